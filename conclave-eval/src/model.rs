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

//! Core data model (§3): RunConfig, SourceDoc, GeneratedDocument, eval
//! results, Elo ratings, and the aggregated Run/SourceDocResult records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeneratorKind {
    Template,
    Researcher,
    DeepResearcher,
}

impl GeneratorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            GeneratorKind::Template => "template",
            GeneratorKind::Researcher => "researcher",
            GeneratorKind::DeepResearcher => "deep_researcher",
        }
    }
}

/// A `provider:model` key, e.g. `"openai:gpt-4o"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn as_str(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCriterion {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCallbacks {
    // Callback identity is opaque to the core; the caller correlates events
    // by run_id/doc_id out-of-band via C6's broadcast bus rather than
    // receiving closures here, so this struct only flags whether the
    // caller wants them invoked at all.
    #[serde(default = "default_true")]
    pub on_gen_complete: bool,
    #[serde(default = "default_true")]
    pub on_eval_complete: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RunCallbacks {
    fn default() -> Self {
        Self {
            on_gen_complete: true,
            on_eval_complete: true,
        }
    }
}

/// Immutable input to C5 for one run (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub source_docs: Vec<SourceDoc>,
    pub generators: Vec<GeneratorKind>,
    /// Models to use per generator kind, keyed by `GeneratorKind::tag()`.
    pub generator_models: HashMap<String, Vec<ModelKey>>,
    #[serde(default)]
    pub model_settings: HashMap<String, ModelSettings>,
    pub generation_instructions: String,
    pub iterations: u32,

    pub enable_single_eval: bool,
    #[serde(default)]
    pub eval_iterations: u32,
    #[serde(default)]
    pub judge_models: Vec<ModelKey>,
    #[serde(default)]
    pub eval_instructions: String,
    #[serde(default)]
    pub pairwise_instructions: String,
    #[serde(default)]
    pub criteria: Vec<EvalCriterion>,

    pub enable_combine: bool,
    #[serde(default)]
    pub combine_models: Vec<ModelKey>,
    #[serde(default)]
    pub combine_instructions: String,
    #[serde(default)]
    pub combine_max_tokens: Option<u32>,

    pub enable_pairwise: bool,
    #[serde(default)]
    pub pairwise_top_n: usize,
    #[serde(default)]
    pub post_combine_top_n: usize,

    #[serde(default)]
    pub eval_retries: u32,
    /// Retry budget for C2's own provider-transient failures, distinct from
    /// `eval_retries` (the judge's JSON-parse retries, consumed in C3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub eval_concurrency: usize,

    #[serde(default)]
    pub callbacks: RunCallbacks,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    1
}

fn default_concurrency() -> usize {
    4
}

impl RunConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Up-front validation run synchronously by C5 before any work starts
    /// (§4.5); every enforced field must be present, no silent defaults.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.source_docs.is_empty() {
            return Err(EvalError::ConfigInvalid("source_docs must not be empty".into()));
        }
        if self.generators.is_empty() {
            return Err(EvalError::ConfigInvalid("generators must not be empty".into()));
        }
        for kind in &self.generators {
            let models = self.generator_models.get(kind.tag());
            if models.map(|m| m.is_empty()).unwrap_or(true) {
                return Err(EvalError::ConfigInvalid(format!(
                    "no models configured for generator {:?}",
                    kind
                )));
            }
        }
        if self.iterations == 0 {
            return Err(EvalError::ConfigInvalid("iterations must be >= 1".into()));
        }
        if self.enable_single_eval {
            if self.judge_models.is_empty() {
                return Err(EvalError::ConfigInvalid(
                    "enable_single_eval requires judge_models".into(),
                ));
            }
            if self.eval_instructions.trim().is_empty() {
                return Err(EvalError::ConfigInvalid(
                    "enable_single_eval requires eval_instructions".into(),
                ));
            }
            if self.criteria.is_empty() {
                return Err(EvalError::ConfigInvalid(
                    "enable_single_eval requires a non-empty criteria rubric".into(),
                ));
            }
        }
        if self.enable_pairwise && self.pairwise_instructions.trim().is_empty() {
            return Err(EvalError::ConfigInvalid(
                "enable_pairwise requires pairwise_instructions".into(),
            ));
        }
        if self.enable_combine && self.combine_models.is_empty() {
            return Err(EvalError::ConfigInvalid(
                "enable_combine requires a non-empty combine_models list".into(),
            ));
        }
        if self.generation_concurrency == 0 {
            return Err(EvalError::ConfigInvalid("generation_concurrency must be >= 1".into()));
        }
        if self.eval_concurrency == 0 {
            return Err(EvalError::ConfigInvalid("eval_concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDoc {
    pub id: String,
    pub name: String,
    pub body: String,
}

/// Deterministic doc_id: short source-id, random suffix, generator, iteration,
/// filename-safe model name (§3, §6).
pub fn make_doc_id(
    source_doc_id: &str,
    generator: GeneratorKind,
    iteration: u32,
    model: &ModelKey,
    suffix: &str,
) -> String {
    let short_source: String = source_doc_id.chars().take(8).collect();
    let safe_model = filename_safe(&model.as_str());
    format!(
        "{}-{}-{}-it{}-{}",
        short_source,
        suffix,
        generator.tag(),
        iteration,
        safe_model
    )
}

pub fn make_combined_doc_id(source_doc_id: &str, model: &ModelKey, suffix: &str) -> String {
    let short_source: String = source_doc_id.chars().take(8).collect();
    format!("combined.{}-{}-{}", short_source, suffix, filename_safe(&model.as_str()))
}

/// Filename-safe transform: `:/ \` → `_` (§6).
pub fn filename_safe(s: &str) -> String {
    s.chars()
        .map(|c| if matches!(c, ':' | '/' | ' ' | '\\') { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub doc_id: String,
    pub content: String,
    pub generator: GeneratorKind,
    pub model: ModelKey,
    pub source_doc_id: String,
    pub iteration: u32,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Set once the content has been written atomically to
    /// `generated/<safe_doc_id>.md`.
    pub persisted_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: String,
    pub score: u8,
    pub reason: String,
}

impl CriterionScore {
    pub fn new(criterion: impl Into<String>, score: u8, reason: impl Into<String>) -> Result<Self, EvalError> {
        if !(1..=5).contains(&score) {
            return Err(EvalError::ParseError(format!(
                "criterion score must be 1-5, got {score}"
            )));
        }
        Ok(Self {
            criterion: criterion.into(),
            score,
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleEvalResult {
    pub doc_id: String,
    pub model: ModelKey,
    pub trial: u32,
    pub scores: Vec<CriterionScore>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub raw_response: Option<String>,
}

impl SingleEvalResult {
    pub fn average_score(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().map(|s| s.score as f64).sum::<f64>() / self.scores.len() as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub doc_id_a: String,
    pub doc_id_b: String,
    pub winner_doc_id: String,
    pub model: ModelKey,
    pub trial: u32,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub raw_response: Option<String>,
}

impl PairwiseResult {
    pub fn new(
        doc_id_a: impl Into<String>,
        doc_id_b: impl Into<String>,
        winner_doc_id: impl Into<String>,
        model: ModelKey,
        trial: u32,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        raw_response: Option<String>,
    ) -> Result<Self, EvalError> {
        let doc_id_a = doc_id_a.into();
        let doc_id_b = doc_id_b.into();
        let winner_doc_id = winner_doc_id.into();
        if winner_doc_id != doc_id_a && winner_doc_id != doc_id_b {
            return Err(EvalError::ParseError(format!(
                "winner '{winner_doc_id}' must be one of '{doc_id_a}' or '{doc_id_b}'"
            )));
        }
        Ok(Self {
            doc_id_a,
            doc_id_b,
            winner_doc_id,
            model,
            trial,
            reason: reason.into(),
            started_at,
            completed_at,
            raw_response,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EloRating {
    pub rating: f64,
    pub wins: u32,
    pub losses: u32,
}

impl EloRating {
    pub fn matches(&self) -> u32 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelinePhase {
    Pending,
    Generating,
    SingleEval,
    PairwiseEval,
    Combining,
    PostCombineEval,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub run_id: String,
    pub source_doc_id: Option<String>,
    pub phase: PipelinePhase,
    pub event_type: String,
    pub description: String,
    #[serde(default)]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub success: bool,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseSummary {
    pub results: Vec<PairwiseResult>,
    pub ratings: HashMap<String, EloRating>,
    pub winner_doc_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDocResult {
    pub phase: Option<PipelinePhase>,
    pub generated_docs: Vec<GeneratedDocument>,
    pub single_eval_results: HashMap<String, Vec<SingleEvalResult>>,
    pub pairwise: Option<PairwiseSummary>,
    pub winner_doc_id: Option<String>,
    pub combined_docs: Vec<GeneratedDocument>,
    pub post_combine_pairwise: Option<PairwiseSummary>,
    pub timeline_events: Vec<TimelineEvent>,
    pub errors: Vec<String>,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

impl SourceDocResult {
    pub fn status(&self) -> PipelinePhase {
        self.phase.unwrap_or(PipelinePhase::Pending)
    }
}

/// Operator-facing call counters, owned by C5 and passed down rather than
/// kept as a global (§9 design note).
#[derive(Debug, Default)]
pub struct FpfStats {
    pub total: std::sync::atomic::AtomicU64,
    pub success: std::sync::atomic::AtomicU64,
    pub failed: std::sync::atomic::AtomicU64,
    pub retries: std::sync::atomic::AtomicU64,
}

impl FpfStats {
    pub fn snapshot(&self) -> FpfStatsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        FpfStatsSnapshot {
            total: self.total.load(Relaxed),
            success: self.success.load(Relaxed),
            failed: self.failed.load(Relaxed),
            retries: self.retries.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FpfStatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub results: HashMap<String, SourceDocResult>,
    pub cumulative_cost_usd: f64,
    pub timeline_events: Vec<TimelineEvent>,
}

impl Run {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            results: HashMap::new(),
            cumulative_cost_usd: 0.0,
            timeline_events: Vec::new(),
        }
    }
}

/// Per-request correlation context threaded explicitly through call
/// arguments, replacing the donor's thread-local validation context (§5,
/// §9 design note).
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Arc<str>,
    pub provider: String,
    pub model: String,
    pub log_dir: Option<std::path::PathBuf>,
}

impl RunContext {
    pub fn new(run_id: impl Into<Arc<str>>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            provider: provider.into(),
            model: model.into(),
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }
}
