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

//! C4: one pipeline per source document, driving it through generation
//! (overlapped with single-eval), pairwise, combine, and post-combine
//! pairwise, sharing C5's global semaphores and C1/C3 instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::error::EvalError;
use crate::judge::{EloCalculator, EloConfig, PairwiseEvaluator, PairwiseJudge, SingleDocJudge, SingleEvaluator};
use crate::llm::transport::{GenerateOptions, GenerateQuery, GeneratorConfig, GeneratorTransport};
use crate::model::{
    make_combined_doc_id, make_doc_id, EloRating, FpfStats, GeneratedDocument, GeneratorKind,
    ModelKey, PairwiseResult, PairwiseSummary, PipelinePhase, RunConfig, RunContext,
    SingleEvalResult, SourceDoc, SourceDocResult, TimelineEvent,
};
use crate::persistence::RunStore;
use crate::rate_registry::ProviderRateRegistry;
use crate::scheduler::CancellationToken;

/// Everything a pipeline needs that is owned by C5 and shared across every
/// other pipeline in the run: the two global semaphores (§4.5), the
/// per-provider rate gates (C1), the cancellation flag, the transports,
/// and the persistence surface (C6).
#[derive(Clone)]
pub struct PipelineHandles {
    pub run_store: RunStore,
    pub rate_registry: Arc<ProviderRateRegistry>,
    pub generation_semaphore: Arc<Semaphore>,
    pub eval_semaphore: Arc<Semaphore>,
    pub stats: Arc<FpfStats>,
    pub cancellation: CancellationToken,
    pub generator_transports: Arc<HashMap<GeneratorKind, Arc<dyn GeneratorTransport>>>,
    pub judge_transport: Arc<dyn GeneratorTransport>,
}

struct SingleEvalSetup {
    evaluator: SingleEvaluator,
    judge_models: Vec<ModelKey>,
}

/// Drives one source document through all five phases (§4.4).
pub struct SourceDocPipeline {
    source_doc: SourceDoc,
    config: Arc<RunConfig>,
    run_id: Arc<str>,
    handles: PipelineHandles,
    /// Random per-pipeline suffix folded into every doc_id this pipeline
    /// mints, so two runs over the same source document never collide on
    /// disk (§3, §6).
    suffix: String,
}

impl SourceDocPipeline {
    pub fn new(source_doc: SourceDoc, config: Arc<RunConfig>, run_id: Arc<str>, handles: PipelineHandles) -> Self {
        let suffix = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        Self {
            source_doc,
            config,
            run_id,
            handles,
            suffix,
        }
    }

    fn emit(
        &self,
        result: &mut SourceDocResult,
        phase: PipelinePhase,
        event_type: &str,
        description: impl Into<String>,
        model: Option<String>,
        success: bool,
        details: Option<serde_json::Value>,
    ) {
        let event = TimelineEvent {
            run_id: self.run_id.to_string(),
            source_doc_id: Some(self.source_doc.id.clone()),
            phase,
            event_type: event_type.to_string(),
            description: description.into(),
            model,
            timestamp: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            success,
            details,
        };
        result.timeline_events.push(event.clone());
        self.handles.run_store.append_timeline_event(event);
    }

    fn is_cancelled(&self) -> bool {
        self.handles.cancellation.is_cancelled()
    }

    pub async fn run(self) -> SourceDocResult {
        let run_started = std::time::Instant::now();
        let mut result = SourceDocResult::default();
        result.phase = Some(PipelinePhase::Generating);
        self.emit(
            &mut result,
            PipelinePhase::Generating,
            "phase_start",
            "generation started",
            None,
            true,
            None,
        );

        self.run_generation_with_eval(&mut result).await;

        if self.is_cancelled() {
            self.finish_cancelled(&mut result, run_started);
            return result;
        }
        if result.generated_docs.is_empty() {
            result.phase = Some(PipelinePhase::Failed);
            result.errors.push("no documents were generated successfully".to_string());
            self.emit(
                &mut result,
                PipelinePhase::Failed,
                "phase_failed",
                "no documents were generated successfully",
                None,
                false,
                None,
            );
            result.duration_seconds = run_started.elapsed().as_secs_f64();
            return result;
        }

        let avg_scores = average_scores(&result.single_eval_results);

        if self.config.enable_pairwise && result.generated_docs.len() >= 2 {
            result.phase = Some(PipelinePhase::PairwiseEval);
            self.run_pairwise(&mut result, &avg_scores).await;
        }
        if self.is_cancelled() {
            self.finish_cancelled(&mut result, run_started);
            return result;
        }

        self.select_winner(&mut result, &avg_scores);

        if self.config.enable_combine && result.winner_doc_id.is_some() && !self.config.combine_models.is_empty() {
            result.phase = Some(PipelinePhase::Combining);
            self.run_combine(&mut result).await;
        }
        if self.is_cancelled() {
            self.finish_cancelled(&mut result, run_started);
            return result;
        }

        if !result.combined_docs.is_empty() && self.config.enable_pairwise {
            result.phase = Some(PipelinePhase::PostCombineEval);
            self.run_post_combine(&mut result).await;
        }
        if self.is_cancelled() {
            self.finish_cancelled(&mut result, run_started);
            return result;
        }

        result.phase = Some(PipelinePhase::Completed);
        self.emit(
            &mut result,
            PipelinePhase::Completed,
            "phase_complete",
            "source document pipeline completed",
            None,
            true,
            None,
        );
        result.duration_seconds = run_started.elapsed().as_secs_f64();
        result
    }

    fn finish_cancelled(&self, result: &mut SourceDocResult, run_started: std::time::Instant) {
        result.phase = Some(PipelinePhase::Cancelled);
        self.emit(
            result,
            PipelinePhase::Cancelled,
            "phase_cancelled",
            "pipeline observed the cancellation flag",
            None,
            false,
            None,
        );
        result.duration_seconds = run_started.elapsed().as_secs_f64();
    }

    /// Phase 1: fan out one task per (generator, model, iteration) — outer
    /// to inner, matching the nesting a generator-keyed model list forces —
    /// and, within each task, schedule that document's single-eval the
    /// moment it is produced rather than waiting on its siblings.
    async fn run_generation_with_eval(&self, result: &mut SourceDocResult) {
        let single_eval_setup = if self.config.enable_single_eval && self.config.eval_iterations > 0 {
            let judge = Arc::new(SingleDocJudge::new(
                Arc::clone(&self.handles.judge_transport),
                self.config.criteria.clone(),
                self.config.eval_instructions.clone(),
                self.config.eval_retries.max(1),
            ));
            Some(Arc::new(SingleEvalSetup {
                evaluator: SingleEvaluator::new(
                    judge,
                    Arc::clone(&self.handles.eval_semaphore),
                    Arc::clone(&self.handles.generation_semaphore),
                ),
                judge_models: self.config.judge_models.clone(),
            }))
        } else {
            None
        };

        let mut tasks = Vec::new();
        'dispatch: for generator in self.config.generators.iter().copied() {
            let Some(models) = self.config.generator_models.get(generator.tag()) else {
                continue;
            };
            for model in models.iter().cloned() {
                for iteration in 1..=self.config.iterations {
                    if self.is_cancelled() {
                        break 'dispatch;
                    }
                    let ctx = GenTaskCtx {
                        handles: self.handles.clone(),
                        config: Arc::clone(&self.config),
                        run_id: Arc::clone(&self.run_id),
                        source_doc: self.source_doc.clone(),
                        suffix: self.suffix.clone(),
                    };
                    let single_eval_setup = single_eval_setup.clone();
                    tasks.push(tokio::spawn(async move {
                        generate_and_eval_one(ctx, generator, model, iteration, single_eval_setup).await
                    }));
                }
            }
        }

        for task in tasks {
            match task.await {
                Ok(Ok((doc, eval_results))) => {
                    self.handles.run_store.add_cost(&self.source_doc.id, doc.cost_usd);
                    result.cost_usd += doc.cost_usd;
                    let doc_id = doc.doc_id.clone();
                    let model = doc.model.as_str();
                    let persisted = match self.handles.run_store.append_generated_doc(&self.source_doc.id, doc.clone()) {
                        Ok(persisted) => persisted,
                        Err(e) => {
                            tracing::warn!(error = %e, doc_id = %doc_id, "failed to persist generated document to disk");
                            doc
                        }
                    };
                    self.emit(
                        result,
                        PipelinePhase::Generating,
                        "generation_complete",
                        format!("generated {doc_id}"),
                        Some(model),
                        true,
                        None,
                    );
                    result.generated_docs.push(persisted);

                    for eval in eval_results {
                        match eval {
                            Ok(eval_result) => {
                                self.handles
                                    .run_store
                                    .upsert_single_eval_result(&self.source_doc.id, eval_result.clone());
                                let judge_model = eval_result.model.as_str();
                                self.emit(
                                    result,
                                    PipelinePhase::SingleEval,
                                    "single_eval_complete",
                                    format!("judged {doc_id} (trial {})", eval_result.trial),
                                    Some(judge_model),
                                    true,
                                    None,
                                );
                                result
                                    .single_eval_results
                                    .entry(doc_id.clone())
                                    .or_default()
                                    .push(eval_result);
                            }
                            Err(e) => {
                                result.errors.push(format!("single-eval failed for {doc_id}: {e}"));
                                self.emit(
                                    result,
                                    PipelinePhase::SingleEval,
                                    "single_eval_failed",
                                    format!("single-eval failed for {doc_id}: {e}"),
                                    None,
                                    false,
                                    None,
                                );
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    result.errors.push(format!("generation failed: {e}"));
                    self.emit(
                        result,
                        PipelinePhase::Generating,
                        "generation_failed",
                        e.to_string(),
                        None,
                        false,
                        None,
                    );
                }
                Err(join_err) => {
                    result.errors.push(format!("generation task panicked: {join_err}"));
                }
            }
        }
    }

    /// Phase 2: filters to non-empty-content docs, optionally narrows to
    /// the top-N by single-eval mean score, and skips (with a warning, not
    /// an error) if fewer than two candidates remain (§4.3 tie-break rules).
    async fn run_pairwise(&self, result: &mut SourceDocResult, avg_scores: &HashMap<String, f64>) {
        let mut candidates: Vec<GeneratedDocument> = result
            .generated_docs
            .iter()
            .filter(|d| !d.content.trim().is_empty())
            .cloned()
            .collect();

        if candidates.len() != result.generated_docs.len() {
            tracing::warn!(
                source_doc_id = %self.source_doc.id,
                "excluded {} empty-content document(s) from pairwise",
                result.generated_docs.len() - candidates.len()
            );
        }

        if self.config.pairwise_top_n > 0 && self.config.pairwise_top_n < candidates.len() && !avg_scores.is_empty() {
            candidates.sort_by(|a, b| {
                let score_a = avg_scores.get(&a.doc_id).copied().unwrap_or(0.0);
                let score_b = avg_scores.get(&b.doc_id).copied().unwrap_or(0.0);
                score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.truncate(self.config.pairwise_top_n);
        }

        if candidates.len() < 2 {
            tracing::warn!(
                source_doc_id = %self.source_doc.id,
                "pairwise skipped: fewer than two eligible candidates"
            );
            return;
        }

        let (elo, results) = self.run_pairwise_tournament(&candidates).await;
        let winner_doc_id = elo.get_winner();
        self.emit(
            result,
            PipelinePhase::PairwiseEval,
            "pairwise_complete",
            "pairwise tournament complete",
            None,
            true,
            Some(serde_json::json!({
                "total_comparisons": results.len(),
                "winner_doc_id": winner_doc_id,
            })),
        );
        result.pairwise = Some(PairwiseSummary {
            results,
            ratings: elo.get_all_ratings().clone(),
            winner_doc_id,
        });
    }

    async fn run_pairwise_tournament(&self, docs: &[GeneratedDocument]) -> (EloCalculator, Vec<PairwiseResult>) {
        let judge = Arc::new(PairwiseJudge::new(
            Arc::clone(&self.handles.judge_transport),
            self.config.pairwise_instructions.clone(),
            self.config.eval_retries.max(1),
        ));
        let evaluator = PairwiseEvaluator::new(
            judge,
            Arc::clone(&self.handles.eval_semaphore),
            Arc::clone(&self.handles.generation_semaphore),
        );
        let mut elo = EloCalculator::new(EloConfig::default());
        let options = GenerateOptions {
            timeout: self.config.request_timeout(),
            max_retries: 1,
            retry_delay: Duration::from_secs(self.config.retry_delay_secs),
            run_context: RunContext::new(Arc::clone(&self.run_id), "judge", "judge"),
        };
        let results = evaluator
            .run_tournament(docs, &self.config.judge_models, self.config.eval_iterations, &mut elo, &options)
            .await;
        (elo, results)
    }

    /// Either the pairwise winner (if pairwise ran with >= 2 candidates) or
    /// the single-eval argmax; undefined (combine skipped) otherwise
    /// (§4.4 "Winner selection").
    fn select_winner(&self, result: &mut SourceDocResult, avg_scores: &HashMap<String, f64>) {
        if let Some(winner) = result.pairwise.as_ref().and_then(|p| p.winner_doc_id.clone()) {
            result.winner_doc_id = Some(winner);
            return;
        }
        if avg_scores.is_empty() {
            return;
        }
        let mut ranked: Vec<(&String, &f64)> = avg_scores.iter().collect();
        ranked.sort_by(|(id_a, score_a), (id_b, score_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| id_a.cmp(id_b))
        });
        result.winner_doc_id = ranked.first().map(|(id, _)| (*id).clone());
    }

    /// Phase 3: builds a "--- ORIGINAL INSTRUCTIONS ---" context block from
    /// the two pairwise-top documents and runs every configured combine
    /// model against it through the Template transport. One model failing
    /// does not abort the others (§4.4 "Combine").
    async fn run_combine(&self, result: &mut SourceDocResult) {
        let Some(pairwise) = result.pairwise.as_ref() else {
            tracing::warn!(source_doc_id = %self.source_doc.id, "combine skipped: no pairwise rankings available");
            return;
        };
        let ranked_ids = rank_doc_ids(&pairwise.ratings);
        if ranked_ids.len() < 2 {
            tracing::warn!(source_doc_id = %self.source_doc.id, "combine skipped: fewer than two pairwise-ranked documents");
            return;
        }

        let doc_by_id = |id: &str| result.generated_docs.iter().find(|d| d.doc_id == id);
        let (Some(report_a), Some(report_b)) = (doc_by_id(&ranked_ids[0]), doc_by_id(&ranked_ids[1])) else {
            tracing::warn!(source_doc_id = %self.source_doc.id, "combine skipped: pairwise-ranked documents missing from generated set");
            return;
        };
        let report1 = report_a.content.clone();
        let report2 = report_b.content.clone();

        let Some(transport) = self.handles.generator_transports.get(&GeneratorKind::Template).cloned() else {
            result.errors.push("combine requires a Template transport, none configured".to_string());
            return;
        };

        let prompt = format!(
            "{}\n\n--- ORIGINAL INSTRUCTIONS ---\n{}\n--- REPORT 1 ---\n{}\n--- REPORT 2 ---\n{}\n--- END OF INPUTS ---",
            self.config.combine_instructions, self.source_doc.body, report1, report2
        );

        for (idx, model) in self.config.combine_models.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }
            let _gen_permit = self.handles.generation_semaphore.acquire().await.expect("semaphore closed");
            let _rate_guard = self.handles.rate_registry.acquire(&model.provider).await;

            let query = GenerateQuery {
                source_text: self.source_doc.body.clone(),
                instructions: prompt.clone(),
            };
            let gen_config = GeneratorConfig {
                provider: model.provider.clone(),
                model: model.model.clone(),
                temperature: None,
                max_output_tokens: self.config.combine_max_tokens,
                extra: Default::default(),
            };
            let options = GenerateOptions {
                timeout: self.config.request_timeout(),
                max_retries: self.config.max_retries,
                retry_delay: Duration::from_secs(self.config.retry_delay_secs),
                run_context: RunContext::new(Arc::clone(&self.run_id), model.provider.clone(), model.model.clone()),
            };

            let started_at = Utc::now();
            match transport.generate(&query, &gen_config, &options).await {
                Ok(outcome) => {
                    let doc_id = make_combined_doc_id(&self.source_doc.id, model, &self.suffix);
                    let doc = GeneratedDocument {
                        doc_id: doc_id.clone(),
                        content: outcome.content,
                        generator: GeneratorKind::Template,
                        model: model.clone(),
                        source_doc_id: self.source_doc.id.clone(),
                        iteration: idx as u32,
                        cost_usd: outcome.cost_usd,
                        duration_seconds: outcome.duration.as_secs_f64(),
                        started_at,
                        completed_at: Utc::now(),
                        persisted_path: None,
                    };
                    result.cost_usd += doc.cost_usd;
                    self.handles.run_store.add_cost(&self.source_doc.id, doc.cost_usd);
                    let persisted = match self.handles.run_store.append_generated_doc(&self.source_doc.id, doc.clone()) {
                        Ok(persisted) => persisted,
                        Err(e) => {
                            tracing::warn!(error = %e, doc_id = %doc_id, "failed to persist combined document to disk");
                            doc
                        }
                    };
                    self.emit(
                        result,
                        PipelinePhase::Combining,
                        "combine_complete",
                        format!("combined via {model}"),
                        Some(model.as_str()),
                        true,
                        None,
                    );
                    result.combined_docs.push(persisted);
                }
                Err(e) => {
                    result.errors.push(format!("combine model {model} failed: {e}"));
                    self.emit(
                        result,
                        PipelinePhase::Combining,
                        "combine_failed",
                        e.to_string(),
                        Some(model.as_str()),
                        false,
                        None,
                    );
                }
            }
        }

        if result.combined_docs.is_empty() {
            result.errors.push(format!(
                "all {} combine model(s) failed",
                self.config.combine_models.len()
            ));
        }
    }

    /// Phase 4: re-runs pairwise over the top-N pre-combine documents union
    /// every combined document, so the synthesized output is judged against
    /// the best originals, not just against itself (§4.4 "Phase 4").
    async fn run_post_combine(&self, result: &mut SourceDocResult) {
        if result.combined_docs.is_empty() {
            return;
        }
        let Some(pairwise) = result.pairwise.as_ref() else {
            tracing::warn!(source_doc_id = %self.source_doc.id, "post-combine pairwise skipped: no pre-combine rankings");
            return;
        };
        let ranked_ids = rank_doc_ids(&pairwise.ratings);
        if ranked_ids.is_empty() {
            return;
        }

        let top_n = if self.config.post_combine_top_n == 0 {
            2
        } else {
            self.config.post_combine_top_n
        };
        let top_ids: Vec<&String> = ranked_ids.iter().take(top_n).collect();

        let mut docs: Vec<GeneratedDocument> = result
            .generated_docs
            .iter()
            .filter(|d| top_ids.iter().any(|id| *id == &d.doc_id))
            .cloned()
            .collect();
        docs.extend(result.combined_docs.iter().cloned());

        if docs.len() < 2 {
            tracing::warn!(source_doc_id = %self.source_doc.id, "post-combine pairwise skipped: fewer than two candidates");
            return;
        }

        let (elo, results) = self.run_pairwise_tournament(&docs).await;
        let winner_doc_id = elo.get_winner();
        self.emit(
            result,
            PipelinePhase::PostCombineEval,
            "post_combine_complete",
            "post-combine pairwise complete",
            None,
            true,
            Some(serde_json::json!({ "total_comparisons": results.len(), "winner_doc_id": winner_doc_id })),
        );
        result.post_combine_pairwise = Some(PairwiseSummary {
            results,
            ratings: elo.get_all_ratings().clone(),
            winner_doc_id,
        });
    }
}

/// Reproduces `EloCalculator::get_rankings`'s tie-break order (rating desc,
/// wins desc, losses asc, doc_id asc) over an already-materialized ratings
/// map, since combine/post-combine only have the `PairwiseSummary` snapshot
/// to work from, not the calculator itself.
fn rank_doc_ids(ratings: &HashMap<String, EloRating>) -> Vec<String> {
    let mut ranked: Vec<(&String, &EloRating)> = ratings.iter().collect();
    ranked.sort_by(|(id_a, a), (id_b, b)| {
        b.rating
            .partial_cmp(&a.rating)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.wins.cmp(&a.wins))
            .then_with(|| a.losses.cmp(&b.losses))
            .then_with(|| id_a.cmp(id_b))
    });
    ranked.into_iter().map(|(id, _)| id.clone()).collect()
}

fn average_scores(single_eval_results: &HashMap<String, Vec<SingleEvalResult>>) -> HashMap<String, f64> {
    single_eval_results
        .iter()
        .filter_map(|(doc_id, results)| {
            if results.is_empty() {
                return None;
            }
            let mean = results.iter().map(|r| r.average_score()).sum::<f64>() / results.len() as f64;
            Some((doc_id.clone(), mean))
        })
        .collect()
}

struct GenTaskCtx {
    handles: PipelineHandles,
    config: Arc<RunConfig>,
    run_id: Arc<str>,
    source_doc: SourceDoc,
    suffix: String,
}

/// One spawned task: acquire the shared generation permit and this
/// provider's C1 gate, call C2, and — if single-eval is enabled — schedule
/// that document's evaluation immediately rather than waiting on sibling
/// generations (§4.4 "interleave generation and single-eval").
async fn generate_and_eval_one(
    ctx: GenTaskCtx,
    generator: GeneratorKind,
    model: ModelKey,
    iteration: u32,
    single_eval: Option<Arc<SingleEvalSetup>>,
) -> Result<(GeneratedDocument, Vec<Result<SingleEvalResult, EvalError>>), EvalError> {
    let _gen_permit = ctx.handles.generation_semaphore.acquire().await.expect("semaphore closed");
    let _rate_guard = ctx.handles.rate_registry.acquire(&model.provider).await;

    let transport = ctx
        .handles
        .generator_transports
        .get(&generator)
        .cloned()
        .ok_or_else(|| EvalError::ConfigInvalid(format!("no transport configured for generator {generator:?}")))?;

    let settings = ctx.config.model_settings.get(&model.as_str());
    let query = GenerateQuery {
        source_text: ctx.source_doc.body.clone(),
        instructions: ctx.config.generation_instructions.clone(),
    };
    let gen_config = GeneratorConfig {
        provider: model.provider.clone(),
        model: model.model.clone(),
        temperature: settings.and_then(|s| s.temperature),
        max_output_tokens: settings.and_then(|s| s.max_output_tokens),
        extra: Default::default(),
    };
    let options = GenerateOptions {
        timeout: ctx.config.request_timeout(),
        max_retries: ctx.config.max_retries,
        retry_delay: Duration::from_secs(ctx.config.retry_delay_secs),
        run_context: RunContext::new(Arc::clone(&ctx.run_id), model.provider.clone(), model.model.clone()),
    };

    let started_at = Utc::now();
    let outcome = transport.generate(&query, &gen_config, &options).await?;
    // Release the generation permit before the (optional) single-eval
    // phase below: single-eval tasks acquire the same global semaphore
    // themselves (§5), and holding this one across them would pin one
    // permit per in-flight generation, deadlocking at
    // `generation_concurrency = 1` once the evaluator tries to acquire
    // its own permit from the same exhausted semaphore.
    drop(_gen_permit);
    let doc_id = make_doc_id(&ctx.source_doc.id, generator, iteration, &model, &ctx.suffix);
    let doc = GeneratedDocument {
        doc_id,
        content: outcome.content,
        generator,
        model,
        source_doc_id: ctx.source_doc.id.clone(),
        iteration,
        cost_usd: outcome.cost_usd,
        duration_seconds: outcome.duration.as_secs_f64(),
        started_at,
        completed_at: Utc::now(),
        persisted_path: None,
    };

    let eval_results = if let Some(setup) = single_eval {
        let options = GenerateOptions {
            timeout: ctx.config.request_timeout(),
            max_retries: 1,
            retry_delay: Duration::from_secs(ctx.config.retry_delay_secs),
            run_context: RunContext::new(Arc::clone(&ctx.run_id), "judge", "judge"),
        };
        setup
            .evaluator
            .evaluate_document(&doc, &setup.judge_models, ctx.config.eval_iterations, &options)
            .await
    } else {
        Vec::new()
    };

    Ok((doc, eval_results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CriterionScore;

    fn score_result(doc_id: &str, score: u8) -> SingleEvalResult {
        SingleEvalResult {
            doc_id: doc_id.to_string(),
            model: ModelKey::new("openai", "gpt-4o"),
            trial: 0,
            scores: vec![CriterionScore::new("quality", score, "").unwrap()],
            started_at: Utc::now(),
            completed_at: Utc::now(),
            raw_response: None,
        }
    }

    #[test]
    fn average_scores_means_across_trials() {
        let mut results = HashMap::new();
        results.insert("doc-a".to_string(), vec![score_result("doc-a", 4), score_result("doc-a", 2)]);
        let averages = average_scores(&results);
        assert_eq!(averages["doc-a"], 3.0);
    }

    #[test]
    fn rank_doc_ids_breaks_ties_by_doc_id() {
        let mut ratings = HashMap::new();
        ratings.insert("b".to_string(), EloRating { rating: 1000.0, wins: 0, losses: 0 });
        ratings.insert("a".to_string(), EloRating { rating: 1000.0, wins: 0, losses: 0 });
        let ranked = rank_doc_ids(&ratings);
        assert_eq!(ranked, vec!["a".to_string(), "b".to_string()]);
    }
}
