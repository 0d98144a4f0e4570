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

//! C5: validates a run up front, fans one [`crate::pipeline::SourceDocPipeline`]
//! out per source document, and owns the two semaphores every pipeline
//! shares (§4.5) plus the single cancellation flag every pipeline polls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::error::EvalError;
use crate::llm::transport::GeneratorTransport;
use crate::model::{
    FpfStats, FpfStatsSnapshot, GeneratorKind, PipelinePhase, Run, RunConfig, RunStatus,
    TimelineEvent,
};
use crate::persistence::RunStore;
use crate::pipeline::{PipelineHandles, SourceDocPipeline};
use crate::rate_registry::ProviderRateRegistry;

/// A single atomic flag shared by every pipeline in a run (§4.5,
/// §9 design note). Cooperative: a pipeline only consults it between tasks
/// and between phases, never aborting an in-flight C2 call.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a run returns once every pipeline has reached a terminal state.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub stats: FpfStatsSnapshot,
}

/// Drives one run end to end: validates the config, constructs one
/// pipeline per source document, starts them concurrently, and aggregates
/// their results back into the run record (§4.5).
pub struct RunExecutor {
    config: Arc<RunConfig>,
    run_id: Arc<str>,
    handles: PipelineHandles,
}

impl RunExecutor {
    pub fn new(
        config: RunConfig,
        run_id: impl Into<String>,
        generator_transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>>,
        judge_transport: Arc<dyn GeneratorTransport>,
        log_dir: Option<PathBuf>,
    ) -> Result<Self, EvalError> {
        config.validate()?;

        let run_id_string = run_id.into();
        let mut run_store = RunStore::new(run_id_string.clone());
        if let Some(dir) = &log_dir {
            run_store = run_store.with_root(dir.clone());
        }

        let handles = PipelineHandles {
            run_store,
            rate_registry: Arc::new(ProviderRateRegistry::new()),
            generation_semaphore: Arc::new(Semaphore::new(config.generation_concurrency)),
            eval_semaphore: Arc::new(Semaphore::new(config.eval_concurrency)),
            stats: Arc::new(FpfStats::default()),
            cancellation: CancellationToken::new(),
            generator_transports: Arc::new(generator_transports),
            judge_transport,
        };

        Ok(Self {
            config: Arc::new(config),
            run_id: Arc::from(run_id_string.as_str()),
            handles,
        })
    }

    pub fn run_store(&self) -> RunStore {
        self.handles.run_store.clone()
    }

    pub fn stats(&self) -> Arc<FpfStats> {
        Arc::clone(&self.handles.stats)
    }

    /// Shared with the caller so they can request cancellation from outside
    /// the run loop (an admin endpoint, a ctrl-c handler, a test).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handles.cancellation.clone()
    }

    pub async fn run(&self) -> RunOutcome {
        self.handles.run_store.append_timeline_event(TimelineEvent {
            run_id: self.run_id.to_string(),
            source_doc_id: None,
            phase: PipelinePhase::Pending,
            event_type: "run_start".to_string(),
            description: format!(
                "run started with {} source document(s)",
                self.config.source_docs.len()
            ),
            model: None,
            timestamp: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            success: true,
            details: None,
        });

        let mut tasks = Vec::with_capacity(self.config.source_docs.len());
        for source_doc in self.config.source_docs.clone() {
            let pipeline = SourceDocPipeline::new(
                source_doc,
                Arc::clone(&self.config),
                Arc::clone(&self.run_id),
                self.handles.clone(),
            );
            tasks.push(tokio::spawn(async move { pipeline.run().await }));
        }

        let mut pipeline_panicked = false;
        for (source_doc, task) in self.config.source_docs.iter().zip(tasks) {
            match task.await {
                Ok(result) => {
                    self.handles
                        .run_store
                        .set_source_doc_result(&source_doc.id, result);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, source_doc_id = %source_doc.id, "pipeline task panicked");
                    pipeline_panicked = true;
                }
            }
        }

        let status = if pipeline_panicked {
            RunStatus::Failed
        } else if self.handles.cancellation.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.handles.run_store.set_status(status);

        let event_type = match status {
            RunStatus::Completed => "run_complete",
            RunStatus::Failed => "run_failed",
            RunStatus::Cancelled => "run_cancelled",
            RunStatus::Running => unreachable!("a finished run is never left Running"),
        };
        self.handles.run_store.append_timeline_event(TimelineEvent {
            run_id: self.run_id.to_string(),
            source_doc_id: None,
            phase: PipelinePhase::Completed,
            event_type: event_type.to_string(),
            description: format!("run finished with status {status:?}"),
            model: None,
            timestamp: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_seconds: None,
            success: matches!(status, RunStatus::Completed),
            details: None,
        });

        RunOutcome {
            run: self.handles.run_store.snapshot(),
            stats: self.handles.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancellation_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
