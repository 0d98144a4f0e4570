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

//! C6: the run's persistence surface. A single lock per run serializes
//! read-modify-write updates to that run's `SourceDocResult` map; callers
//! that want a live feed subscribe to a broadcast channel that the same
//! writes publish to, on a best-effort basis — a slow or absent subscriber
//! never blocks a write (§6, §8 invariant on idempotent replays).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::model::{
    GeneratedDocument, PairwiseResult, Run, RunStatus, SingleEvalResult, SourceDocResult,
    TimelineEvent,
};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum RunEvent {
    GeneratedDoc { source_doc_id: String, doc_id: String },
    SingleEvalResult { source_doc_id: String, doc_id: String, judge: String },
    PairwiseResult { source_doc_id: String, doc_id_a: String, doc_id_b: String },
    Timeline(TimelineEvent),
}

/// Owns one run's mutable state plus an atomic-write path for generated
/// document bodies. Cloned handles share the same underlying run.
#[derive(Clone)]
pub struct RunStore {
    run_id: Arc<str>,
    inner: Arc<Mutex<Run>>,
    events: broadcast::Sender<RunEvent>,
    root: Option<PathBuf>,
}

impl RunStore {
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            run_id: Arc::from(run_id.as_str()),
            inner: Arc::new(Mutex::new(Run::new(run_id))),
            events,
            root: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RunEvent) {
        // A broadcast send fails only when there are zero subscribers;
        // that's the expected common case and not an error.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> Run {
        self.inner.lock().clone()
    }

    /// Appends a generated document, persisting its body to
    /// `generated/<safe-doc-id>.md` under the configured root first so the
    /// in-memory record is never ahead of disk. Idempotent per
    /// `(run_id, doc_id)`: a repeat append with the same `doc_id` replaces
    /// the prior entry rather than duplicating it. Returns the stored
    /// document with `persisted_path` filled in, so callers that keep
    /// their own copy don't lose track of where it landed on disk.
    pub fn append_generated_doc(
        &self,
        source_doc_id: &str,
        mut doc: GeneratedDocument,
    ) -> std::io::Result<GeneratedDocument> {
        if let Some(root) = &self.root {
            let path = write_generated_doc(root, &doc)?;
            doc.persisted_path = Some(path.to_string_lossy().into_owned());
        }

        let doc_id = doc.doc_id.clone();
        let stored = doc.clone();
        {
            let mut run = self.inner.lock();
            let entry = run.results.entry(source_doc_id.to_string()).or_default();
            if let Some(existing) = entry.generated_docs.iter_mut().find(|d| d.doc_id == doc_id) {
                *existing = doc;
            } else {
                entry.generated_docs.push(doc);
            }
        }
        self.publish(RunEvent::GeneratedDoc {
            source_doc_id: source_doc_id.to_string(),
            doc_id,
        });
        Ok(stored)
    }

    /// Idempotent per `(run_id, doc_id, judge, trial)`: a retried
    /// evaluation with the same key replaces the earlier attempt in place.
    pub fn upsert_single_eval_result(&self, source_doc_id: &str, result: SingleEvalResult) {
        let doc_id = result.doc_id.clone();
        let judge = result.model.as_str();
        {
            let mut run = self.inner.lock();
            let entry = run.results.entry(source_doc_id.to_string()).or_default();
            let bucket = entry.single_eval_results.entry(doc_id.clone()).or_default();
            if let Some(existing) = bucket
                .iter_mut()
                .find(|r| r.model == result.model && r.trial == result.trial)
            {
                *existing = result;
            } else {
                bucket.push(result);
            }
        }
        self.publish(RunEvent::SingleEvalResult {
            source_doc_id: source_doc_id.to_string(),
            doc_id,
            judge,
        });
    }

    pub fn record_pairwise(&self, source_doc_id: &str, result: PairwiseResult) {
        let (doc_id_a, doc_id_b) = (result.doc_id_a.clone(), result.doc_id_b.clone());
        self.publish(RunEvent::PairwiseResult {
            source_doc_id: source_doc_id.to_string(),
            doc_id_a,
            doc_id_b,
        });
        let _ = result;
    }

    pub fn append_timeline_event(&self, event: TimelineEvent) {
        {
            let mut run = self.inner.lock();
            if let Some(source_doc_id) = &event.source_doc_id {
                let entry = run.results.entry(source_doc_id.clone()).or_default();
                entry.timeline_events.push(event.clone());
            }
            run.timeline_events.push(event.clone());
        }
        self.publish(RunEvent::Timeline(event));
    }

    pub fn add_cost(&self, source_doc_id: &str, cost_usd: f64) {
        let mut run = self.inner.lock();
        run.cumulative_cost_usd += cost_usd;
        let entry = run.results.entry(source_doc_id.to_string()).or_default();
        entry.cost_usd += cost_usd;
    }

    /// Replaces a source document's result wholesale with the pipeline's
    /// final, locally-assembled view once it reaches a terminal phase. The
    /// incremental `append_*`/`upsert_*` calls made during the run keep
    /// subscribers live-updated; this call makes the aggregate fields
    /// (phase, winner, pairwise summaries, errors) durable too.
    pub fn set_source_doc_result(&self, source_doc_id: &str, result: SourceDocResult) {
        self.inner.lock().results.insert(source_doc_id.to_string(), result);
    }

    pub fn set_status(&self, status: RunStatus) {
        self.inner.lock().status = status;
    }
}

fn write_generated_doc(root: &Path, doc: &GeneratedDocument) -> std::io::Result<PathBuf> {
    let generated_dir = root.join("generated");
    std::fs::create_dir_all(&generated_dir)?;
    let safe_id = crate::model::filename_safe(&doc.doc_id);
    let path = generated_dir.join(format!("{safe_id}.md"));
    let tmp_path = generated_dir.join(format!("{safe_id}.md.tmp"));
    std::fs::write(&tmp_path, &doc.content)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// All run stores active in this process, keyed by `run_id`, so an admin
/// surface can look one up without threading a handle through every call
/// site.
#[derive(Default)]
pub struct RunRegistry {
    stores: Mutex<HashMap<String, RunStore>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, store: RunStore) {
        self.stores.lock().insert(store.run_id().to_string(), store);
    }

    pub fn get(&self, run_id: &str) -> Option<RunStore> {
        self.stores.lock().get(run_id).cloned()
    }
}
