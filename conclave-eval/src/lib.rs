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

//! Conclave Eval
//!
//! Implements C1-C6 of the multi-model content evaluation orchestrator:
//! per-provider rate gating, the LLM adapter layer, the judge/evaluator,
//! the per-source-document pipeline, the run scheduler, and incremental
//! persistence with a live event bus.

pub mod error;
pub mod judge;
pub mod llm;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod rate_registry;
pub mod scheduler;

pub use error::EvalError;
pub use model::{
    CriterionScore, EloRating, EvalCriterion, FpfStats, FpfStatsSnapshot, GeneratedDocument,
    GeneratorKind, ModelKey, ModelSettings, PairwiseResult, PairwiseSummary, PipelinePhase, Run,
    RunCallbacks, RunConfig, RunContext, RunStatus, SingleEvalResult, SourceDoc, SourceDocResult,
    TimelineEvent,
};
pub use persistence::{RunEvent, RunRegistry, RunStore};
pub use pipeline::{PipelineHandles, SourceDocPipeline};
pub use rate_registry::ProviderRateRegistry;
pub use scheduler::{CancellationToken, RunExecutor, RunOutcome};
