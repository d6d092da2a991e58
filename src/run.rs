//! Run assembly and the blocking execution façade.
//!
//! A [`Run`] collects an ordered list of steps, then
//! [`run_to_completion`](Run::run_to_completion) seeds the pipeline with the
//! initial mapping, spins up the worker pool, and drives the coordination
//! loop on the calling thread until the rightmost stage finalizes. The call
//! consumes the run, so a `Run` is single-use by construction.
//!
//! # Example
//!
//! ```
//! use runahead::{MapStep, Outcome, Run};
//! use std::collections::HashMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut run: Run<String, String> = Run::new();
//! run.add_step(MapStep::new(|_k: &String, v: &String| {
//!     Ok(Outcome::Value(v.to_uppercase()))
//! }))?;
//!
//! let out = run.run_to_completion(HashMap::from([("greeting".to_string(), "hi".to_string())]))?;
//! assert_eq!(out.values().get("greeting").map(String::as_str), Some("HI"));
//! # Ok(())
//! # }
//! ```

use crate::coordinator::Coordinator;
use crate::error::Error;
#[cfg(feature = "metrics")]
use crate::metrics::RunMetrics;
use crate::stage::Stage;
use crate::state::{KeyBound, State, ValueBound};
use crate::step::Step;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Options for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOptions {
    /// Size of the worker thread pool. `None` uses the hardware
    /// parallelism reported by `num_cpus`.
    pub worker_count: Option<usize>,
    /// Maximum notifications absorbed into one batch per stage.
    pub batch_cap: usize,
    /// Force every stage non-eager: a stage runs only once all stages to
    /// its left have finalized. Disables speculation.
    pub deliberate_mode: bool,
    /// Deadline for a single batch. A batch that exceeds it is dropped
    /// like a failed one.
    pub per_stage_timeout: Option<Duration>,
    /// Cancel the run gracefully on SIGINT. Requires the `signal` feature.
    pub cancel_on_signal: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            worker_count: None,
            batch_cap: 16,
            deliberate_mode: false,
            per_stage_timeout: None,
            cancel_on_signal: false,
        }
    }
}

/// Run-wide coordination state shared by the coordinator, the stages, and
/// cancel handles: a stop flag, the first fatal error, and the condition
/// variable workers use to wake the coordinator.
pub(crate) struct Shared {
    epoch: Mutex<u64>,
    cv: Condvar,
    stop: Arc<AtomicBool>,
    fatal: Mutex<Option<Error>>,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: RunMetrics,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
            stop: Arc::new(AtomicBool::new(false)),
            fatal: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics: RunMetrics::default(),
        }
    }

    /// Wake the coordinator: something changed (a batch finished, a queue
    /// grew, a flag flipped).
    pub(crate) fn signal(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch += 1;
        drop(epoch);
        self.cv.notify_all();
    }

    /// Park until the epoch moves past `seen` or `timeout` elapses. The
    /// timeout bounds the latency of externally-set flags (cancellation,
    /// signals), which do not always ring the condvar.
    pub(crate) fn wait_for_signal(&self, seen: &mut u64, timeout: Duration) {
        let mut epoch = self.epoch.lock().unwrap();
        if *epoch == *seen {
            let (guard, _) = self.cv.wait_timeout(epoch, timeout).unwrap();
            epoch = guard;
        }
        *seen = *epoch;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.signal();
    }

    #[cfg(feature = "signal")]
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Record a fatal error (first one wins) and stop the run.
    pub(crate) fn abort(&self, err: Error) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.request_stop();
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap().take()
    }
}

/// Cooperative cancellation for an in-flight run.
///
/// Obtained from [`Run::cancel_handle`] before the run starts; cloneable
/// and sendable to any thread. Cancelling stops workers from picking up
/// new batches and makes the run return its partial results.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.request_stop();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.stop_requested()
    }
}

/// An ordered pipeline of steps plus the options to evaluate it under.
///
/// Build with [`Run::new`] or [`Run::with_options`], append steps in
/// pipeline order with [`Run::add_step`], then call
/// [`Run::run_to_completion`] once.
pub struct Run<K, V> {
    steps: Vec<Arc<dyn Step<K, V>>>,
    options: RunOptions,
    shared: Arc<Shared>,
}

impl<K: KeyBound, V: ValueBound> Default for Run<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyBound, V: ValueBound> Run<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(RunOptions::default())
    }

    #[must_use]
    pub fn with_options(options: RunOptions) -> Self {
        Self {
            steps: Vec::new(),
            options,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Append a step. The order of `add_step` calls defines stage indices.
    pub fn add_step(&mut self, step: impl Step<K, V> + 'static) -> crate::Result<()> {
        self.add_step_arc(Arc::new(step))
    }

    /// Append an already-shared step. Adding the same instance twice is a
    /// configuration error: each stage owns its position in the generation
    /// vector.
    pub fn add_step_arc(&mut self, step: Arc<dyn Step<K, V>>) -> crate::Result<()> {
        if self.steps.iter().any(|s| Arc::ptr_eq(s, &step)) {
            return Err(Error::Config(
                "the same step instance was added twice".into(),
            ));
        }
        self.steps.push(step);
        Ok(())
    }

    /// A handle that can cancel this run from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Evaluate the pipeline over `initial` and block until the rightmost
    /// stage finalizes (or the run is cancelled). Consumes the run.
    pub fn run_to_completion(self, initial: HashMap<K, V>) -> crate::Result<RunOutput<K, V>> {
        if self.options.worker_count == Some(0) {
            return Err(Error::Config("worker_count must be at least 1".into()));
        }
        if self.options.batch_cap == 0 {
            return Err(Error::Config("batch_cap must be at least 1".into()));
        }
        if self.options.cancel_on_signal && !cfg!(feature = "signal") {
            return Err(Error::Config(
                "cancel_on_signal requires the `signal` feature".into(),
            ));
        }
        if let Some(i) = self.steps.iter().position(|s| s.max_concurrency() == Some(0)) {
            return Err(Error::Config(format!(
                "stage {i} has a concurrency cap of 0 and could never run"
            )));
        }

        let workers = self.options.worker_count.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {e}")))?;

        #[cfg(feature = "signal")]
        let sig_id = if self.options.cancel_on_signal {
            let id = signal_hook::flag::register(
                signal_hook::consts::SIGINT,
                self.shared.stop_flag(),
            )
            .map_err(|e| Error::Config(format!("signal handler: {e}")))?;
            Some(id)
        } else {
            None
        };

        let stage_count = self.steps.len();
        let stages: Vec<Arc<Stage<K, V>>> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                Arc::new(Stage::new(
                    index,
                    stage_count,
                    Arc::clone(step),
                    Arc::clone(&self.shared),
                ))
            })
            .collect();

        let coordinator =
            Coordinator::new(stages, Arc::clone(&self.shared), pool, self.options.clone());
        let outcome = coordinator.run(initial);

        #[cfg(feature = "signal")]
        if let Some(id) = sig_id {
            signal_hook::low_level::unregister(id);
        }

        let (final_states, cancelled) = outcome?;
        Ok(RunOutput {
            final_states,
            cancelled,
            #[cfg(feature = "metrics")]
            shared: self.shared,
        })
    }
}

/// The result of a completed (or cancelled) run: the terminal state for
/// every surviving key, with deleted keys already filtered out.
pub struct RunOutput<K, V> {
    final_states: HashMap<K, State<V>>,
    cancelled: bool,
    #[cfg(feature = "metrics")]
    shared: Arc<Shared>,
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for RunOutput<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOutput")
            .field("final_states", &self.final_states)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl<K: KeyBound, V: ValueBound> RunOutput<K, V> {
    /// Final `key -> State` mapping.
    pub fn states(&self) -> &HashMap<K, State<V>> {
        &self.final_states
    }

    pub fn into_states(self) -> HashMap<K, State<V>> {
        self.final_states
    }

    pub fn get(&self, key: &K) -> Option<&State<V>> {
        self.final_states.get(key)
    }

    /// Final values, cloned out of their states.
    pub fn values(&self) -> HashMap<K, V> {
        self.final_states
            .iter()
            .filter_map(|(k, st)| st.value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.final_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.final_states.is_empty()
    }

    /// True if the run was cancelled and these are partial results.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Execution counters for the run.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> &RunMetrics {
        &self.shared.metrics
    }
}
