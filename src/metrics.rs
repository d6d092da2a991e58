//! Run-level execution counters.
//!
//! A [`RunMetrics`] is attached to every run and counts what the scheduler
//! actually did: batches executed, notifications accepted or dropped as
//! stale, emissions published or suppressed, failures contained, and
//! corrective re-assertions. The counters are cheap relaxed atomics; read
//! them after the run through [`RunOutput::metrics`](crate::RunOutput::metrics).
//!
//! ```no_run
//! use runahead::{MapStep, Outcome, Run};
//! use std::collections::HashMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut run: Run<String, u64> = Run::new();
//! run.add_step(MapStep::new(|_k: &String, v: &u64| Ok(Outcome::Value(v + 1))))?;
//! let out = run.run_to_completion(HashMap::from([("a".into(), 1)]))?;
//! out.metrics().print();
//! out.metrics().save_to_file("run_metrics.json")?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one run. All loads and stores are relaxed; totals are only
/// meaningful once the run has completed.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pub(crate) batches: AtomicU64,
    pub(crate) accepted: AtomicU64,
    pub(crate) stale_dropped: AtomicU64,
    pub(crate) unmatched: AtomicU64,
    pub(crate) emitted: AtomicU64,
    pub(crate) unchanged_suppressed: AtomicU64,
    pub(crate) speculative_discarded: AtomicU64,
    pub(crate) transform_failures: AtomicU64,
    pub(crate) batch_timeouts: AtomicU64,
    pub(crate) correctives: AtomicU64,
}

impl RunMetrics {
    /// Batches handed to a transform (empty claims are not counted).
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Notifications accepted into some stage's input map.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Notifications discarded because their vector did not dominate.
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }

    /// Accepted notifications whose key the stage's match predicate skipped.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Notifications published onto outgoing queues.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Transform results equal to their input, silently dropped.
    pub fn unchanged_suppressed(&self) -> u64 {
        self.unchanged_suppressed.load(Ordering::Relaxed)
    }

    /// Batch outputs beaten to the output map by a later-generation batch.
    pub fn speculative_discarded(&self) -> u64 {
        self.speculative_discarded.load(Ordering::Relaxed)
    }

    /// Batches dropped because the transform failed.
    pub fn transform_failures(&self) -> u64 {
        self.transform_failures.load(Ordering::Relaxed)
    }

    /// Batches dropped because they exceeded the per-stage deadline.
    pub fn batch_timeouts(&self) -> u64 {
        self.batch_timeouts.load(Ordering::Relaxed)
    }

    /// Corrective pass-through emissions after rolled-back batches.
    pub fn correctives(&self) -> u64 {
        self.correctives.load(Ordering::Relaxed)
    }

    /// All counters as a JSON object.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        json!({
            "batches": self.batches(),
            "accepted": self.accepted(),
            "stale_dropped": self.stale_dropped(),
            "unmatched": self.unmatched(),
            "emitted": self.emitted(),
            "unchanged_suppressed": self.unchanged_suppressed(),
            "speculative_discarded": self.speculative_discarded(),
            "transform_failures": self.transform_failures(),
            "batch_timeouts": self.batch_timeouts(),
            "correctives": self.correctives(),
        })
    }

    /// Print the counters to stdout.
    pub fn print(&self) {
        println!("=== Run Metrics ===");
        let snapshot = self.snapshot();
        if let Some(map) = snapshot.as_object() {
            for (name, value) in map {
                println!("{name}: {value}");
            }
        }
    }

    /// Save the counters to a JSON file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
