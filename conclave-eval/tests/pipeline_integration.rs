// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end drive of C4+C5 against an in-process mock [`GeneratorTransport`],
//! covering §8 scenarios S1-S3 and S6 plus two of the laws. S4 (missing
//! grounding) and S5 (transient-then-success retry) are exercised at the
//! transport layer in `llm::validation`'s and `llm::retry`'s own
//! `#[cfg(test)]` modules, since both are C2 behaviors a pipeline-level
//! mock can't observe without reimplementing the validator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use conclave_eval::judge::PairwiseJudge;
use conclave_eval::llm::{
    GenerateOptions, GenerateOutcome, GenerateQuery, GenerateStatus, GeneratorConfig,
    GeneratorTransport,
};
use conclave_eval::model::filename_safe;
use conclave_eval::{
    CriterionScore, EvalCriterion, EvalError, GeneratedDocument, GeneratorKind, ModelKey,
    RunCallbacks, RunConfig, RunContext, RunExecutor, RunStatus, SingleEvalResult, SourceDoc,
};
use conclave_eval::persistence::RunStore;

/// Deterministic "model" stand-in for a generator backend: every document
/// carries a `SCORE_MARKER:<n>` the mock judge below can read back out of
/// the rendered prompt, so the test doesn't need a real LLM to produce
/// distinguishable candidates.
struct MockGenTransport {
    scores: HashMap<String, u8>,
}

#[async_trait]
impl GeneratorTransport for MockGenTransport {
    async fn generate(
        &self,
        _query: &GenerateQuery,
        config: &GeneratorConfig,
        _options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        let score = self.scores.get(&config.model).copied().unwrap_or(3);
        Ok(GenerateOutcome {
            content: format!("draft from {} SCORE_MARKER:{score}", config.model),
            cost_usd: 0.02,
            duration: Duration::from_millis(1),
            status: GenerateStatus::Ok,
            metadata: serde_json::json!({}),
        })
    }

    fn name(&self) -> &'static str {
        "mock-generator"
    }
}

/// Scans for every `SCORE_MARKER:<digit>` in arrival order.
fn extract_markers(text: &str) -> Vec<u8> {
    let marker = "SCORE_MARKER:";
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(marker) {
        let after = &rest[idx + marker.len()..];
        if let Some(d) = after.chars().next().and_then(|c| c.to_digit(10)) {
            out.push(d as u8);
        }
        rest = &after[1.min(after.len())..];
    }
    out
}

/// Plays both the single-doc and pairwise judge role: branches on a marker
/// literal each test's instructions templates carry, so one mock transport
/// can back both `SingleDocJudge` and `PairwiseJudge` in the same run, same
/// as a caller supplying one `judge_transport` for both in production.
struct MockJudgeTransport {
    criteria: Vec<String>,
}

#[async_trait]
impl GeneratorTransport for MockJudgeTransport {
    async fn generate(
        &self,
        query: &GenerateQuery,
        _config: &GeneratorConfig,
        _options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        let body = if query.instructions.contains("PAIRWISE_PROMPT") {
            let scores = extract_markers(&query.instructions);
            let a = scores.first().copied().unwrap_or(3);
            let b = scores.get(1).copied().unwrap_or(3);
            let winner = if a >= b { "A" } else { "B" };
            serde_json::json!({"winner": winner, "reason": "deterministic mock verdict"})
        } else {
            let score = extract_markers(&query.instructions).first().copied().unwrap_or(3);
            let evaluations: Vec<_> = self
                .criteria
                .iter()
                .map(|c| serde_json::json!({"criterion": c, "score": score, "reason": "mock"}))
                .collect();
            serde_json::json!({"evaluations": evaluations})
        };
        Ok(GenerateOutcome {
            content: body.to_string(),
            cost_usd: 0.0,
            duration: Duration::from_millis(1),
            status: GenerateStatus::Ok,
            metadata: serde_json::json!({}),
        })
    }

    fn name(&self) -> &'static str {
        "mock-judge"
    }
}

/// Generation transport that also counts in-flight calls, to exercise the
/// §8 boundary property "`generation_concurrency = 1` => strictly serial
/// C2 calls". Doubles as the judge transport in the relevant test so the
/// same counter observes generation *and* judge calls sharing one cap.
struct ConcurrencyProbeTransport {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl GeneratorTransport for ConcurrencyProbeTransport {
    async fn generate(
        &self,
        _query: &GenerateQuery,
        _config: &GeneratorConfig,
        _options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(8)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(GenerateOutcome {
            content: r#"{"evaluations":[{"criterion":"quality","score":3,"reason":"ok"}]}"#.to_string(),
            cost_usd: 0.0,
            duration: Duration::from_millis(8),
            status: GenerateStatus::Ok,
            metadata: serde_json::json!({}),
        })
    }

    fn name(&self) -> &'static str {
        "concurrency-probe"
    }
}

/// Generation transport with a counter but no artificial delay beyond one
/// controllable `await` point, used to pin down exactly when cancellation
/// takes effect in the S6 test.
struct CountingGenTransport {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl GeneratorTransport for CountingGenTransport {
    async fn generate(
        &self,
        _query: &GenerateQuery,
        config: &GeneratorConfig,
        _options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        Ok(GenerateOutcome {
            content: format!("draft from {} SCORE_MARKER:3", config.model),
            cost_usd: 0.0,
            duration: Duration::from_millis(15),
            status: GenerateStatus::Ok,
            metadata: serde_json::json!({}),
        })
    }

    fn name(&self) -> &'static str {
        "counting-generator"
    }
}

fn base_config() -> RunConfig {
    RunConfig {
        source_docs: vec![SourceDoc {
            id: "S".to_string(),
            name: "Source".to_string(),
            body: "source body".to_string(),
        }],
        generators: vec![GeneratorKind::Template],
        generator_models: HashMap::new(),
        model_settings: HashMap::new(),
        generation_instructions: "produce a variation".to_string(),
        iterations: 1,
        enable_single_eval: false,
        eval_iterations: 0,
        judge_models: vec![],
        eval_instructions: String::new(),
        pairwise_instructions: "PAIRWISE_PROMPT A:{doc_a} B:{doc_b}".to_string(),
        criteria: vec![],
        enable_combine: false,
        combine_models: vec![],
        combine_instructions: "synthesize the best of both reports".to_string(),
        combine_max_tokens: None,
        enable_pairwise: false,
        pairwise_top_n: 0,
        post_combine_top_n: 0,
        eval_retries: 2,
        max_retries: 1,
        retry_delay_secs: 0,
        request_timeout_secs: 5,
        generation_concurrency: 4,
        eval_concurrency: 4,
        callbacks: RunCallbacks::default(),
    }
}

fn model_map(generator: &str, models: &[&str]) -> HashMap<String, Vec<ModelKey>> {
    let mut map = HashMap::new();
    map.insert(
        generator.to_string(),
        models.iter().map(|m| ModelKey::new("mock", *m)).collect(),
    );
    map
}

/// S1 (§8): two generators, one model each, one iteration, single-eval
/// only. Expects 2 generated documents, 2 single-eval results, and a
/// timeline carrying exactly 1 run-start, 2 generation events, 2
/// single-eval events, 1 run-complete.
#[tokio::test]
async fn s1_happy_path_two_generators_single_eval_only() {
    let gen_scores = HashMap::from([("m1".to_string(), 4u8), ("m2".to_string(), 4u8)]);
    let gen_transport: Arc<dyn GeneratorTransport> = Arc::new(MockGenTransport { scores: gen_scores });
    let judge_transport: Arc<dyn GeneratorTransport> = Arc::new(MockJudgeTransport {
        criteria: vec!["factuality".to_string(), "clarity".to_string()],
    });

    let mut generator_models = model_map("template", &["m1"]);
    generator_models.extend(model_map("researcher", &["m2"]));

    let config = RunConfig {
        generators: vec![GeneratorKind::Template, GeneratorKind::Researcher],
        generator_models,
        enable_single_eval: true,
        eval_iterations: 1,
        judge_models: vec![ModelKey::new("mock", "j1")],
        eval_instructions: "EVAL_PROMPT {document} {criteria}".to_string(),
        criteria: vec![
            EvalCriterion { name: "factuality".to_string(), description: "is it true".to_string() },
            EvalCriterion { name: "clarity".to_string(), description: "is it clear".to_string() },
        ],
        ..base_config()
    };

    let mut transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    transports.insert(GeneratorKind::Template, Arc::clone(&gen_transport));
    transports.insert(GeneratorKind::Researcher, Arc::clone(&gen_transport));

    let executor = RunExecutor::new(config, "run-s1", transports, judge_transport, None).expect("valid config");
    let outcome = executor.run().await;

    assert_eq!(outcome.run.status, RunStatus::Completed);
    let result = &outcome.run.results["S"];
    assert_eq!(result.generated_docs.len(), 2);
    let total_evals: usize = result.single_eval_results.values().map(|v| v.len()).sum();
    assert_eq!(total_evals, 2);

    let events = &outcome.run.timeline_events;
    let count = |ty: &str| events.iter().filter(|e| e.event_type == ty).count();
    assert_eq!(count("run_start"), 1);
    assert_eq!(count("generation_complete"), 2);
    assert_eq!(count("single_eval_complete"), 2);
    assert_eq!(count("run_complete"), 1);
}

/// S2 (§8): five candidates with distinct single-eval means and
/// `pairwise_top_n = 3`. Expects pairwise to run with exactly the top 3
/// (3 pairs) and the bottom 2 to never appear as an operand.
#[tokio::test]
async fn s2_top_n_gate_excludes_low_scorers_from_pairwise() {
    let gen_scores = HashMap::from([
        ("m1".to_string(), 5u8),
        ("m2".to_string(), 5u8),
        ("m3".to_string(), 3u8),
        ("m4".to_string(), 2u8),
        ("m5".to_string(), 1u8),
    ]);
    let gen_transport: Arc<dyn GeneratorTransport> = Arc::new(MockGenTransport { scores: gen_scores });
    let judge_transport: Arc<dyn GeneratorTransport> =
        Arc::new(MockJudgeTransport { criteria: vec!["quality".to_string()] });

    let config = RunConfig {
        generator_models: model_map("template", &["m1", "m2", "m3", "m4", "m5"]),
        enable_single_eval: true,
        eval_iterations: 1,
        judge_models: vec![ModelKey::new("mock", "j1")],
        eval_instructions: "EVAL_PROMPT {document} {criteria}".to_string(),
        criteria: vec![EvalCriterion { name: "quality".to_string(), description: "overall quality".to_string() }],
        enable_pairwise: true,
        pairwise_top_n: 3,
        ..base_config()
    };

    let mut transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    transports.insert(GeneratorKind::Template, gen_transport);

    let executor = RunExecutor::new(config, "run-s2", transports, judge_transport, None).expect("valid config");
    let outcome = executor.run().await;

    let result = &outcome.run.results["S"];
    let low_ids: Vec<String> = result
        .generated_docs
        .iter()
        .filter(|d| d.model.model == "m4" || d.model.model == "m5")
        .map(|d| d.doc_id.clone())
        .collect();
    assert_eq!(low_ids.len(), 2);

    let pairwise = result.pairwise.as_ref().expect("pairwise ran");
    assert_eq!(pairwise.results.len(), 3, "3 choose 2 pairs for the top-3 gate");
    for pair in &pairwise.results {
        assert!(!low_ids.contains(&pair.doc_id_a));
        assert!(!low_ids.contains(&pair.doc_id_b));
    }
}

/// S3 (§8): combine with two models. Expects two combined docs, and a
/// post-combine pairwise summary whose operands cover all four documents
/// (the two pre-combine tops plus both combined outputs).
#[tokio::test]
async fn s3_combine_with_two_models_runs_post_combine_pairwise() {
    let gen_scores = HashMap::from([
        ("m1".to_string(), 5u8),
        ("m2".to_string(), 1u8),
        ("c1".to_string(), 5u8),
        ("c2".to_string(), 1u8),
    ]);
    let gen_transport: Arc<dyn GeneratorTransport> = Arc::new(MockGenTransport { scores: gen_scores });
    let judge_transport: Arc<dyn GeneratorTransport> =
        Arc::new(MockJudgeTransport { criteria: vec!["quality".to_string()] });

    let config = RunConfig {
        generator_models: model_map("template", &["m1", "m2"]),
        enable_pairwise: true,
        enable_combine: true,
        combine_models: vec![ModelKey::new("mock", "c1"), ModelKey::new("mock", "c2")],
        post_combine_top_n: 2,
        ..base_config()
    };

    let mut transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    transports.insert(GeneratorKind::Template, gen_transport);

    let executor = RunExecutor::new(config, "run-s3", transports, judge_transport, None).expect("valid config");
    let outcome = executor.run().await;

    let result = &outcome.run.results["S"];
    assert_eq!(result.combined_docs.len(), 2);

    let post_combine = result.post_combine_pairwise.as_ref().expect("post-combine pairwise ran");
    let mut operands: std::collections::HashSet<String> = std::collections::HashSet::new();
    for pair in &post_combine.results {
        operands.insert(pair.doc_id_a.clone());
        operands.insert(pair.doc_id_b.clone());
    }
    assert_eq!(operands.len(), 4, "both pre-combine tops and both combined docs took part");
}

/// S6 (§8): cancel while generation is still fanning out. Generation tasks
/// already spawned run to completion (cancellation is cooperative, never
/// aborting an in-flight C2 call) so every on-disk generated-doc file must
/// still correspond exactly to an in-memory `GeneratedDocument`; but the
/// cancellation must be observed before the next phase, so pairwise (which
/// would otherwise run once >= 2 docs exist) never starts.
#[tokio::test]
async fn s6_cancellation_mid_run_leaves_disk_consistent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let gen_transport: Arc<dyn GeneratorTransport> =
        Arc::new(CountingGenTransport { calls: Arc::clone(&calls) });
    let judge_transport: Arc<dyn GeneratorTransport> =
        Arc::new(MockJudgeTransport { criteria: vec![] });

    let config = RunConfig {
        generator_models: model_map("template", &["m1", "m2", "m3", "m4", "m5", "m6"]),
        generation_concurrency: 2,
        enable_pairwise: true,
        ..base_config()
    };

    let mut transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    transports.insert(GeneratorKind::Template, gen_transport);

    let tmp = tempfile::tempdir().unwrap();
    let executor = Arc::new(
        RunExecutor::new(config, "run-s6", transports, judge_transport, Some(tmp.path().to_path_buf()))
            .expect("valid config"),
    );
    let token = executor.cancellation_token();

    let run_handle = tokio::spawn({
        let executor = Arc::clone(&executor);
        async move { executor.run().await }
    });

    while calls.load(Ordering::SeqCst) < 1 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    token.cancel();

    let outcome = run_handle.await.unwrap();
    assert_eq!(outcome.run.status, RunStatus::Cancelled);

    let result = &outcome.run.results["S"];
    assert!(result.pairwise.is_none(), "cancellation must be observed before the pairwise phase starts");

    let generated_dir = tmp.path().join("generated");
    let on_disk: std::collections::HashSet<String> = if generated_dir.exists() {
        std::fs::read_dir(&generated_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    } else {
        Default::default()
    };
    let in_memory: std::collections::HashSet<String> = result
        .generated_docs
        .iter()
        .map(|d| format!("{}.md", filename_safe(&d.doc_id)))
        .collect();
    assert_eq!(on_disk, in_memory);
}

/// §8 boundary: `generation_concurrency = 1` serialises every C2 call
/// across the whole run, generation *and* judge alike (§5: "every
/// generator and judge C2 call passes through" the one global semaphore).
/// Regresses the generation/judge semaphore-sharing fix directly.
#[tokio::test]
async fn boundary_generation_concurrency_one_serialises_generation_and_judge_calls() {
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let probe: Arc<dyn GeneratorTransport> = Arc::new(ConcurrencyProbeTransport {
        current: Arc::clone(&current),
        max_seen: Arc::clone(&max_seen),
    });

    let config = RunConfig {
        generator_models: model_map("template", &["m1", "m2", "m3"]),
        enable_single_eval: true,
        eval_iterations: 2,
        judge_models: vec![ModelKey::new("mock", "j1"), ModelKey::new("mock", "j2")],
        eval_instructions: "EVAL_PROMPT {document} {criteria}".to_string(),
        criteria: vec![EvalCriterion { name: "quality".to_string(), description: "overall quality".to_string() }],
        generation_concurrency: 1,
        eval_concurrency: 4,
        ..base_config()
    };

    let mut transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    transports.insert(GeneratorKind::Template, Arc::clone(&probe));

    let executor = RunExecutor::new(config, "run-boundary", transports, probe, None).expect("valid config");
    let outcome = executor.run().await;

    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(outcome.run.results["S"].generated_docs.len(), 3);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1, "generation_concurrency=1 must serialise every C2 call");
}

/// Law: replaying the same `upsert_single_eval_result` (the persistence
/// surface behind `on_eval_complete`) for an identical `(doc_id, judge,
/// trial)` leaves the stored result set unchanged rather than duplicating
/// the entry.
#[test]
fn law_idempotent_persistence_replay_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = RunStore::new("run-idem").with_root(dir.path().to_path_buf());
    let result = SingleEvalResult {
        doc_id: "doc-a".to_string(),
        model: ModelKey::new("mock", "j1"),
        trial: 0,
        scores: vec![CriterionScore::new("quality", 4, "ok").unwrap()],
        started_at: Utc::now(),
        completed_at: Utc::now(),
        raw_response: None,
    };

    store.upsert_single_eval_result("src1", result.clone());
    let after_first = store.snapshot();
    store.upsert_single_eval_result("src1", result.clone());
    let after_replay = store.snapshot();

    let first_bucket = &after_first.results["src1"].single_eval_results["doc-a"];
    let replay_bucket = &after_replay.results["src1"].single_eval_results["doc-a"];
    assert_eq!(first_bucket.len(), 1);
    assert_eq!(replay_bucket.len(), 1);
    assert_eq!(first_bucket[0].scores.len(), replay_bucket[0].scores.len());
    assert_eq!(first_bucket[0].scores[0].score, replay_bucket[0].scores[0].score);
}

fn make_doc(doc_id: &str, content: &str) -> GeneratedDocument {
    GeneratedDocument {
        doc_id: doc_id.to_string(),
        content: content.to_string(),
        generator: GeneratorKind::Template,
        model: ModelKey::new("mock", "gen"),
        source_doc_id: "S".to_string(),
        iteration: 1,
        cost_usd: 0.0,
        duration_seconds: 0.0,
        started_at: Utc::now(),
        completed_at: Utc::now(),
        persisted_path: None,
    }
}

/// Law: swapping which document is passed as `doc_a` vs `doc_b` yields
/// the same *winner identity*, not the same letter — `judge_pair`
/// internally randomises the A/B label, so across many calls the
/// stronger document must win regardless of which argument position it
/// was passed in.
#[tokio::test]
async fn law_ab_symmetry_winner_identity_independent_of_assignment() {
    let judge_transport: Arc<dyn GeneratorTransport> = Arc::new(MockJudgeTransport { criteria: vec![] });
    let judge = PairwiseJudge::new(Arc::clone(&judge_transport), "PAIRWISE_PROMPT A:{doc_a} B:{doc_b}".to_string(), 1);

    let strong = make_doc("doc-strong", "content SCORE_MARKER:5");
    let weak = make_doc("doc-weak", "content SCORE_MARKER:1");
    let options = GenerateOptions {
        timeout: Duration::from_secs(5),
        max_retries: 1,
        retry_delay: Duration::from_millis(1),
        run_context: RunContext::new("run-ab".to_string(), "mock".to_string(), "j1".to_string()),
    };
    let model = ModelKey::new("mock", "j1");

    for trial in 0..20 {
        let forward = judge.judge_pair(&strong, &weak, &model, trial, &options).await.unwrap();
        assert_eq!(forward.winner_doc_id, "doc-strong");
        let reversed = judge.judge_pair(&weak, &strong, &model, trial, &options).await.unwrap();
        assert_eq!(reversed.winner_doc_id, "doc-strong");
    }
}
