// src/coordinator.rs

use crate::gens::GenVec;
use crate::run::{RunOptions, Shared};
use crate::stage::Stage;
use crate::state::{KeyBound, Notification, Payload, State, ValueBound};
use rayon::ThreadPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// How long the coordinator parks when there is nothing to move. Signals
/// from finishing workers cut the wait short; the bound keeps cancellation
/// and signal flags responsive.
const PARK: Duration = Duration::from_millis(20);

/// Single-threaded owner of everything between stages: fan-out of outgoing
/// notifications, the finality cascade, dispatch into the worker pool, and
/// the absorbing terminal map the run result is read from.
///
/// Running the loop on one thread means the outer ends of the queues need
/// no coordination among themselves; every hand-off into a stage goes
/// through that stage's lock.
pub(crate) struct Coordinator<K: KeyBound, V: ValueBound> {
    stages: Vec<Arc<Stage<K, V>>>,
    shared: Arc<Shared>,
    pool: ThreadPool,
    options: RunOptions,
    terminal: HashMap<K, State<V>>,
}

impl<K: KeyBound, V: ValueBound> Coordinator<K, V> {
    pub(crate) fn new(
        stages: Vec<Arc<Stage<K, V>>>,
        shared: Arc<Shared>,
        pool: ThreadPool,
        options: RunOptions,
    ) -> Self {
        Self {
            stages,
            shared,
            pool,
            options,
            terminal: HashMap::new(),
        }
    }

    /// Drive the run to completion. Returns the terminal map and whether
    /// the run was cancelled.
    pub(crate) fn run(
        mut self,
        initial: HashMap<K, V>,
    ) -> crate::Result<(HashMap<K, State<V>>, bool)> {
        let n = self.stages.len();

        // Seed: zero vectors, origin "before stage 0". Input fans out to
        // every stage so that a stage skipping a key never starves the
        // stages behind it.
        for (key, value) in initial {
            let note = Notification::new(
                key,
                State::new(Payload::Value(value), GenVec::zero(n)),
                None,
            );
            self.absorb(&note);
            for stage in &self.stages {
                stage.offer(note.clone());
            }
        }
        if n == 0 {
            return Ok((self.finish(), false));
        }
        self.stages[0].mark_input_final();

        let mut seen = 0u64;
        loop {
            if let Some(err) = self.shared.take_fatal() {
                return Err(err);
            }
            if self.shared.stop_requested() {
                self.drain_cancelled();
                debug!("run cancelled; returning partial results");
                return Ok((self.finish(), true));
            }

            let mut progress = false;

            // 1. Move outputs downstream and into the terminal map.
            for i in 0..n {
                let drained = self.stages[i].drain_outgoing();
                for note in drained {
                    progress = true;
                    self.absorb(&note);
                    for stage in &self.stages[i + 1..] {
                        stage.offer(note.clone());
                    }
                }
            }

            // 2. Finality cascade, left to right. A stage that is final
            // and fully drained promises its right neighbour silence.
            for i in 0..n {
                if self.stages[i].try_finalize_output() && self.stages[i].outgoing_is_empty() {
                    if let Some(next) = self.stages.get(i + 1) {
                        next.mark_input_final();
                    }
                }
            }

            // 3. Dispatch pending batches, leftmost stages first: work on
            // early stages invalidates less downstream speculation. The
            // deliberate gate needs predecessors final *and* drained, or a
            // non-eager stage could run on a key it will see again.
            let mut preds_final = true;
            for stage in &self.stages {
                let eager = stage.eager() && !self.options.deliberate_mode;
                let claims = stage.claim_batches(self.options.batch_cap, eager || preds_final);
                for _ in 0..claims {
                    progress = true;
                    let worker = Arc::clone(stage);
                    let cap = self.options.batch_cap;
                    let timeout = self.options.per_stage_timeout;
                    self.pool.spawn(move || worker.run_next_batch(cap, timeout));
                }
                if claims > 0 {
                    trace!(stage = stage.index, claims, "dispatched");
                }
                preds_final =
                    preds_final && stage.is_output_final() && stage.outgoing_is_empty();
            }

            // 4. Done once the rightmost stage is final and drained.
            if self.stages[n - 1].is_output_final() && self.stages[n - 1].outgoing_is_empty() {
                debug!("run complete");
                return Ok((self.finish(), false));
            }

            if !progress {
                self.shared.wait_for_signal(&mut seen, PARK);
            }
        }
    }

    /// Cancellation: stop dispatching, let in-flight batches finish, keep
    /// absorbing their results, then freeze every stage.
    fn drain_cancelled(&mut self) {
        let mut seen = 0u64;
        loop {
            if self.stages.iter().all(|s| s.active_worker_count() == 0) {
                for i in 0..self.stages.len() {
                    for note in self.stages[i].drain_outgoing() {
                        self.absorb(&note);
                    }
                }
                break;
            }
            for i in 0..self.stages.len() {
                for note in self.stages[i].drain_outgoing() {
                    self.absorb(&note);
                }
            }
            self.shared.wait_for_signal(&mut seen, PARK);
        }
        for stage in &self.stages {
            stage.force_finalize();
        }
    }

    /// Fold a notification into the absorbing terminal surface under the
    /// same dominance rule every stage applies on intake.
    fn absorb(&mut self, note: &Notification<K, V>) {
        match self.terminal.get(&note.key) {
            Some(current) if !note.state.gens().dominates(current.gens()) => {
                trace!("terminal surface dropped a stale notification");
            }
            _ => {
                self.terminal.insert(note.key.clone(), note.state.clone());
            }
        }
    }

    fn finish(self) -> HashMap<K, State<V>> {
        self.terminal
            .into_iter()
            .filter(|(_, state)| !state.payload().is_tombstone())
            .collect()
    }
}
