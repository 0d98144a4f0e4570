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

//! C3: judging. Single-document scoring against a rubric, pairwise
//! head-to-head comparison, and the Elo rating bookkeeping that turns a
//! set of pairwise verdicts into a ranking. Parse failures are retried
//! here, not in C2 — the provider call already succeeded, it's the judge's
//! own JSON contract that didn't parse (§9).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};

use crate::error::EvalError;
use crate::llm::transport::{GenerateOptions, GenerateQuery, GeneratorConfig, GeneratorTransport};
use crate::llm::parser::parse_json_response;
use crate::model::{CriterionScore, EloRating, EvalCriterion, GeneratedDocument, ModelKey, PairwiseResult, SingleEvalResult};

const DEFAULT_K_FACTOR: f64 = 32.0;
const DEFAULT_INITIAL_RATING: f64 = 1000.0;

#[derive(Debug, Clone, Copy)]
pub struct EloConfig {
    pub k_factor: f64,
    pub initial_rating: f64,
    pub use_dynamic_k: bool,
    pub high_rating_threshold: f64,
    pub high_rating_k_factor: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            k_factor: DEFAULT_K_FACTOR,
            initial_rating: DEFAULT_INITIAL_RATING,
            use_dynamic_k: false,
            high_rating_threshold: 2000.0,
            high_rating_k_factor: 16.0,
        }
    }
}

/// Tracks per-doc Elo ratings across a pairwise tournament.
#[derive(Debug, Clone)]
pub struct EloCalculator {
    config: EloConfig,
    ratings: HashMap<String, EloRating>,
}

impl EloCalculator {
    pub fn new(config: EloConfig) -> Self {
        Self {
            config,
            ratings: HashMap::new(),
        }
    }

    fn rating_value(&self, doc_id: &str) -> f64 {
        self.ratings.get(doc_id).map(|r| r.rating).unwrap_or(self.config.initial_rating)
    }

    /// `1 / (1 + 10^((Rb - Ra) / 400))`.
    fn expected_score(&self, rating_a: f64, rating_b: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
    }

    fn k_factor_for(&self, rating: f64) -> f64 {
        if self.config.use_dynamic_k && rating >= self.config.high_rating_threshold {
            self.config.high_rating_k_factor
        } else {
            self.config.k_factor
        }
    }

    fn entry(&mut self, doc_id: &str) -> &mut EloRating {
        self.ratings.entry(doc_id.to_string()).or_insert(EloRating {
            rating: self.config.initial_rating,
            wins: 0,
            losses: 0,
        })
    }

    /// Updates both sides' ratings for one pairwise verdict.
    pub fn update_ratings(&mut self, doc_a: &str, doc_b: &str, winner: &str) {
        let rating_a = self.rating_value(doc_a);
        let rating_b = self.rating_value(doc_b);
        let expected_a = self.expected_score(rating_a, rating_b);
        let expected_b = 1.0 - expected_a;
        let (score_a, score_b) = if winner == doc_a { (1.0, 0.0) } else { (0.0, 1.0) };
        let k_a = self.k_factor_for(rating_a);
        let k_b = self.k_factor_for(rating_b);

        let new_rating_a = rating_a + k_a * (score_a - expected_a);
        let new_rating_b = rating_b + k_b * (score_b - expected_b);

        let won_a = winner == doc_a;
        {
            let entry = self.entry(doc_a);
            entry.rating = new_rating_a;
            if won_a {
                entry.wins += 1;
            } else {
                entry.losses += 1;
            }
        }
        {
            let entry = self.entry(doc_b);
            entry.rating = new_rating_b;
            if won_a {
                entry.losses += 1;
            } else {
                entry.wins += 1;
            }
        }
    }

    pub fn process_result(&mut self, result: &PairwiseResult) {
        self.update_ratings(&result.doc_id_a, &result.doc_id_b, &result.winner_doc_id);
    }

    pub fn process_results(&mut self, results: &[PairwiseResult]) {
        for result in results {
            self.process_result(result);
        }
    }

    pub fn get_rating(&self, doc_id: &str) -> EloRating {
        self.ratings.get(doc_id).copied().unwrap_or(EloRating {
            rating: self.config.initial_rating,
            wins: 0,
            losses: 0,
        })
    }

    pub fn get_all_ratings(&self) -> &HashMap<String, EloRating> {
        &self.ratings
    }

    /// Ranked by rating desc, then wins desc, then losses asc, then doc_id
    /// lexicographically, so ties never depend on arrival order.
    pub fn get_rankings(&self) -> Vec<(String, EloRating)> {
        let mut ranked: Vec<(String, EloRating)> =
            self.ratings.iter().map(|(id, r)| (id.clone(), *r)).collect();
        ranked.sort_by(|(id_a, a), (id_b, b)| {
            b.rating
                .partial_cmp(&a.rating)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.wins.cmp(&a.wins))
                .then_with(|| a.losses.cmp(&b.losses))
                .then_with(|| id_a.cmp(id_b))
        });
        ranked
    }

    pub fn get_top_n(&self, n: usize) -> Vec<(String, EloRating)> {
        self.get_rankings().into_iter().take(n).collect()
    }

    pub fn get_winner(&self) -> Option<String> {
        self.get_rankings().into_iter().next().map(|(id, _)| id)
    }

    pub fn reset(&mut self) {
        self.ratings.clear();
    }
}

fn render(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in replacements {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

async fn call_with_parse_retry<F>(
    max_retries: u32,
    mut call: impl FnMut() -> F,
) -> Result<(String, f64, serde_json::Value), EvalError>
where
    F: std::future::Future<Output = Result<(String, f64), EvalError>>,
{
    let mut last_err = EvalError::ParseError("no judge attempts made".into());
    for _attempt in 0..max_retries.max(1) {
        let (raw_text, cost_usd) = call().await?;
        match parse_json_response(&raw_text) {
            Ok(parsed) => return Ok((raw_text, cost_usd, parsed)),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

pub struct SingleDocJudge {
    transport: Arc<dyn GeneratorTransport>,
    criteria: Vec<EvalCriterion>,
    instructions: String,
    max_parse_retries: u32,
}

impl SingleDocJudge {
    pub fn new(
        transport: Arc<dyn GeneratorTransport>,
        criteria: Vec<EvalCriterion>,
        instructions: impl Into<String>,
        max_parse_retries: u32,
    ) -> Self {
        Self {
            transport,
            criteria,
            instructions: instructions.into(),
            max_parse_retries,
        }
    }

    pub async fn judge_one(
        &self,
        doc: &GeneratedDocument,
        model: &ModelKey,
        trial: u32,
        options: &GenerateOptions,
    ) -> Result<SingleEvalResult, EvalError> {
        let started_at = Utc::now();
        let criteria_block = self
            .criteria
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = render(
            &self.instructions,
            &[("document", &doc.content), ("content", &doc.content), ("criteria", &criteria_block)],
        );

        let query = GenerateQuery {
            source_text: doc.content.clone(),
            instructions: prompt,
        };
        let config = GeneratorConfig {
            provider: model.provider.clone(),
            model: model.model.clone(),
            temperature: None,
            max_output_tokens: None,
            extra: Default::default(),
        };

        let (_raw, cost_usd, parsed) = call_with_parse_retry(self.max_parse_retries, || async {
            let outcome = self.transport.generate(&query, &config, options).await?;
            Ok((outcome.content, outcome.cost_usd))
        })
        .await?;
        let _ = cost_usd;

        let evaluations = parsed
            .get("evaluations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EvalError::ParseError("judge response missing 'evaluations' array".into()))?;

        let mut scores = Vec::with_capacity(evaluations.len());
        for item in evaluations {
            let criterion = item
                .get("criterion")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EvalError::ParseError("evaluation entry missing 'criterion'".into()))?;
            let score = item
                .get("score")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| EvalError::ParseError("evaluation entry missing numeric 'score'".into()))?;
            let reason = item.get("reason").and_then(|v| v.as_str()).unwrap_or_default();
            scores.push(CriterionScore::new(criterion, score as u8, reason)?);
        }

        let expected: std::collections::HashSet<&str> = self.criteria.iter().map(|c| c.name.as_str()).collect();
        let got: std::collections::HashSet<&str> = scores.iter().map(|s| s.criterion.as_str()).collect();
        if expected != got {
            return Err(EvalError::ParseError(format!(
                "judge scored criteria {got:?}, rubric expects {expected:?}"
            )));
        }

        Ok(SingleEvalResult {
            doc_id: doc.doc_id.clone(),
            model: model.clone(),
            trial,
            scores,
            started_at,
            completed_at: Utc::now(),
            raw_response: Some(_raw),
        })
    }
}

pub struct PairwiseJudge {
    transport: Arc<dyn GeneratorTransport>,
    instructions: String,
    max_parse_retries: u32,
}

impl PairwiseJudge {
    pub fn new(transport: Arc<dyn GeneratorTransport>, instructions: impl Into<String>, max_parse_retries: u32) -> Self {
        Self {
            transport,
            instructions: instructions.into(),
            max_parse_retries,
        }
    }

    pub async fn judge_pair(
        &self,
        doc_a: &GeneratedDocument,
        doc_b: &GeneratedDocument,
        model: &ModelKey,
        trial: u32,
        options: &GenerateOptions,
    ) -> Result<PairwiseResult, EvalError> {
        let started_at = Utc::now();
        // Randomize which document is labeled "A" so position bias in the
        // judge model doesn't systematically favor one generator.
        let swap = rand::random::<bool>();
        let (first, second) = if swap { (doc_b, doc_a) } else { (doc_a, doc_b) };

        let prompt = render(
            &self.instructions,
            &[
                ("doc_a", &first.content),
                ("document_a", &first.content),
                ("doc_b", &second.content),
                ("document_b", &second.content),
            ],
        );

        let query = GenerateQuery {
            source_text: String::new(),
            instructions: prompt,
        };
        let config = GeneratorConfig {
            provider: model.provider.clone(),
            model: model.model.clone(),
            temperature: None,
            max_output_tokens: None,
            extra: Default::default(),
        };

        let (raw, _cost_usd, parsed) = call_with_parse_retry(self.max_parse_retries, || async {
            let outcome = self.transport.generate(&query, &config, options).await?;
            Ok((outcome.content, outcome.cost_usd))
        })
        .await?;

        let verdict = parsed
            .get("winner")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EvalError::ParseError("judge response missing 'winner'".into()))?;
        let reason = parsed.get("reason").and_then(|v| v.as_str()).unwrap_or_default();

        let winner_doc_id = match verdict.trim().to_ascii_uppercase().as_str() {
            "A" => first.doc_id.clone(),
            "B" => second.doc_id.clone(),
            other => {
                return Err(EvalError::ParseError(format!(
                    "judge winner must be 'A' or 'B', got {other:?}"
                )))
            }
        };

        PairwiseResult::new(
            doc_a.doc_id.clone(),
            doc_b.doc_id.clone(),
            winner_doc_id,
            model.clone(),
            trial,
            reason,
            started_at,
            Utc::now(),
            Some(raw),
        )
    }
}

/// Runs `iterations * judge_models.len()` single-doc evaluations per
/// document under a shared concurrency cap. The cap is a `Semaphore` owned
/// by the caller (C5) so it can be shared across every pipeline's
/// evaluator for the run rather than each pipeline getting its own
/// private budget. Every call also passes through the global generation
/// semaphore (§4.4, §5: "every generator *and judge* C2 call" shares the
/// one global cap), so `generation_concurrency = 1` serialises judge calls
/// across the whole run too, not just generation calls.
pub struct SingleEvaluator {
    judge: Arc<SingleDocJudge>,
    concurrency: Arc<Semaphore>,
    generation_concurrency: Arc<Semaphore>,
}

impl SingleEvaluator {
    pub fn new(judge: Arc<SingleDocJudge>, concurrency: Arc<Semaphore>, generation_concurrency: Arc<Semaphore>) -> Self {
        Self { judge, concurrency, generation_concurrency }
    }

    /// Convenience constructor for tests and standalone callers that don't
    /// need to share either semaphore across pipelines.
    pub fn with_capacity(judge: Arc<SingleDocJudge>, eval_concurrency: usize) -> Self {
        Self::new(
            judge,
            Arc::new(Semaphore::new(eval_concurrency.max(1))),
            Arc::new(Semaphore::new(eval_concurrency.max(1))),
        )
    }

    pub async fn evaluate_document(
        &self,
        doc: &GeneratedDocument,
        judge_models: &[ModelKey],
        iterations: u32,
        options: &GenerateOptions,
    ) -> Vec<Result<SingleEvalResult, EvalError>> {
        let mut handles = Vec::new();
        for model in judge_models {
            for trial in 0..iterations {
                let judge = Arc::clone(&self.judge);
                let sem = Arc::clone(&self.concurrency);
                let gen_sem = Arc::clone(&self.generation_concurrency);
                let doc = doc.clone();
                let model = model.clone();
                let options = options.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = sem.acquire().await.expect("semaphore closed");
                    let _gen_permit = gen_sem.acquire().await.expect("semaphore closed");
                    judge.judge_one(&doc, &model, trial, &options).await
                }));
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(error = %e, "single-eval task panicked");
                    results.push(Err(EvalError::Cancelled));
                }
            }
        }
        results
    }
}

/// Generates all unordered pairs from a document set, runs them under a
/// concurrency cap, and feeds verdicts to a single Elo-updating consumer
/// in arrival order so rating updates stay deterministic per run. Every
/// call also passes through the global generation semaphore, same as
/// [`SingleEvaluator`] above.
pub struct PairwiseEvaluator {
    judge: Arc<PairwiseJudge>,
    concurrency: Arc<Semaphore>,
    generation_concurrency: Arc<Semaphore>,
}

impl PairwiseEvaluator {
    pub fn new(judge: Arc<PairwiseJudge>, concurrency: Arc<Semaphore>, generation_concurrency: Arc<Semaphore>) -> Self {
        Self { judge, concurrency, generation_concurrency }
    }

    pub fn with_capacity(judge: Arc<PairwiseJudge>, eval_concurrency: usize) -> Self {
        Self::new(
            judge,
            Arc::new(Semaphore::new(eval_concurrency.max(1))),
            Arc::new(Semaphore::new(eval_concurrency.max(1))),
        )
    }

    pub fn generate_pairs(docs: &[GeneratedDocument]) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..docs.len() {
            for j in (i + 1)..docs.len() {
                pairs.push((i, j));
            }
        }
        pairs
    }

    /// Runs `|pairs| * iterations * judge_models.len()` comparisons (§4.3,
    /// §8 scenario S2).
    pub async fn run_tournament(
        &self,
        docs: &[GeneratedDocument],
        judge_models: &[ModelKey],
        iterations: u32,
        elo: &mut EloCalculator,
        options: &GenerateOptions,
    ) -> Vec<PairwiseResult> {
        let pairs = Self::generate_pairs(docs);
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<PairwiseResult, EvalError>>();

        for (i, j) in pairs {
            for model in judge_models {
                for trial in 0..iterations {
                    let judge = Arc::clone(&self.judge);
                    let sem = Arc::clone(&self.concurrency);
                    let gen_sem = Arc::clone(&self.generation_concurrency);
                    let doc_a = docs[i].clone();
                    let doc_b = docs[j].clone();
                    let model = model.clone();
                    let options = options.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _permit = sem.acquire().await.expect("semaphore closed");
                        let _gen_permit = gen_sem.acquire().await.expect("semaphore closed");
                        let result = judge.judge_pair(&doc_a, &doc_b, &model, trial, &options).await;
                        let _ = tx.send(result);
                    });
                }
            }
        }
        drop(tx);

        let mut collected = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(verdict) => {
                    elo.process_result(&verdict);
                    collected.push(verdict);
                }
                Err(e) => tracing::warn!(error = %e, "pairwise judge call failed, dropping from tournament"),
            }
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_score_is_half_for_equal_ratings() {
        let calc = EloCalculator::new(EloConfig::default());
        assert!((calc.expected_score(1000.0, 1000.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn winner_gains_rating_loser_loses_it() {
        let mut calc = EloCalculator::new(EloConfig::default());
        calc.update_ratings("a", "b", "a");
        let a = calc.get_rating("a");
        let b = calc.get_rating("b");
        assert!(a.rating > 1000.0);
        assert!(b.rating < 1000.0);
        assert_eq!(a.wins, 1);
        assert_eq!(b.losses, 1);
    }

    #[test]
    fn upset_moves_rating_more_than_expected_win() {
        let mut strong = EloCalculator::new(EloConfig::default());
        strong.update_ratings("favorite", "underdog", "favorite");
        let favorite_gain = strong.get_rating("favorite").rating - 1000.0;

        // Give the underdog a head start so it's the expected winner, then
        // have the favorite win anyway: the gain should exceed the
        // equal-rating case.
        let mut uneven = EloCalculator::new(EloConfig::default());
        uneven.entry("underdog").rating = 1400.0;
        uneven.update_ratings("favorite", "underdog", "favorite");
        let upset_gain = uneven.get_rating("favorite").rating - 1000.0;

        assert!(upset_gain > favorite_gain);
    }

    #[test]
    fn rankings_break_ties_by_wins_then_losses_then_doc_id() {
        let mut calc = EloCalculator::new(EloConfig::default());
        calc.entry("b").rating = 1000.0;
        calc.entry("a").rating = 1000.0;
        let rankings = calc.get_rankings();
        assert_eq!(rankings[0].0, "a");
        assert_eq!(rankings[1].0, "b");
    }

    #[test]
    fn dynamic_k_shrinks_updates_above_threshold() {
        let config = EloConfig {
            use_dynamic_k: true,
            high_rating_threshold: 1100.0,
            high_rating_k_factor: 8.0,
            ..EloConfig::default()
        };
        let mut calc = EloCalculator::new(config);
        calc.entry("veteran").rating = 1200.0;
        calc.update_ratings("veteran", "newcomer", "veteran");
        let gain = calc.get_rating("veteran").rating - 1200.0;
        assert!(gain < 8.0);
    }
}
