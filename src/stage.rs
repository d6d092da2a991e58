//! Per-stage state, queues, and batch execution.
//!
//! A [`Stage`] owns the four structures the protocol revolves around: the
//! input map (latest accepted state per key), the output map (latest
//! emitted state per key), and the incoming/outgoing FIFO queues. One lock
//! guards all of them; it is held for batch selection and publication but
//! never across a user transform.
//!
//! Lifecycle: `OPEN -> INPUT_FINAL -> (draining) -> OUTPUT_FINAL`. The
//! coordinator flips the finality flags; workers only drain and publish.
//!
//! Invariants maintained here:
//! - a key's vector in either map only ever increases (tuple order),
//! - an emitted vector carries a fresh local count in this stage's slot,
//!   so it dominates everything the stage previously produced for the key,
//! - `output_final` implies the incoming queue is empty and no batch is in
//!   flight.

use crate::error::Error;
use crate::gens::GenVec;
use crate::run::Shared;
use crate::state::{Notification, Payload, State};
use crate::state::{KeyBound, ValueBound};
use crate::step::{BaseGens, BatchItem, Emitter, Step};
use anyhow::anyhow;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub(crate) struct Stage<K, V> {
    pub(crate) index: usize,
    stage_count: usize,
    step: Arc<dyn Step<K, V>>,
    shared: Arc<Shared>,
    core: Mutex<StageCore<K, V>>,
}

struct StageCore<K, V> {
    input: HashMap<K, State<V>>,
    output: HashMap<K, State<V>>,
    incoming: VecDeque<Notification<K, V>>,
    outgoing: VecDeque<Notification<K, V>>,
    /// Next local generation count. Starts at 1; slot 0 is reserved for
    /// "never emitted".
    local_gen: u64,
    input_final: bool,
    output_final: bool,
    active_workers: usize,
}

impl<K: KeyBound, V: ValueBound> Stage<K, V> {
    pub(crate) fn new(
        index: usize,
        stage_count: usize,
        step: Arc<dyn Step<K, V>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            index,
            stage_count,
            step,
            shared,
            core: Mutex::new(StageCore {
                input: HashMap::new(),
                output: HashMap::new(),
                incoming: VecDeque::new(),
                outgoing: VecDeque::new(),
                local_gen: 1,
                input_final: false,
                output_final: false,
                active_workers: 0,
            }),
        }
    }

    pub(crate) fn eager(&self) -> bool {
        self.step.eager()
    }

    /// Enqueue a notification for this stage. Offering after `input_final`
    /// is a scheduler bug, not a runtime condition.
    pub(crate) fn offer(&self, note: Notification<K, V>) {
        let mut core = self.core.lock().unwrap();
        assert!(
            !core.input_final,
            "stage {} was offered a notification after input_final",
            self.index
        );
        core.incoming.push_back(note);
    }

    /// Hand all pending outgoing notifications to the coordinator.
    pub(crate) fn drain_outgoing(&self) -> Vec<Notification<K, V>> {
        let mut core = self.core.lock().unwrap();
        core.outgoing.drain(..).collect()
    }

    /// Upstream promises to produce nothing further. Idempotent.
    pub(crate) fn mark_input_final(&self) {
        let mut core = self.core.lock().unwrap();
        if !core.input_final {
            core.input_final = true;
            trace!(stage = self.index, "input final");
        }
    }

    /// Transition to `OUTPUT_FINAL` iff the input is final, the incoming
    /// queue is drained, and no batch is in flight. Returns the flag.
    pub(crate) fn try_finalize_output(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.output_final {
            return true;
        }
        if core.input_final && core.incoming.is_empty() && core.active_workers == 0 {
            core.output_final = true;
            debug!(stage = self.index, "output final");
            return true;
        }
        false
    }

    /// Cancellation path: freeze the stage, discarding whatever is still
    /// queued. Only valid once no batch is in flight.
    pub(crate) fn force_finalize(&self) {
        let mut core = self.core.lock().unwrap();
        core.input_final = true;
        if core.active_workers == 0 {
            core.incoming.clear();
            core.output_final = true;
        }
    }

    pub(crate) fn is_output_final(&self) -> bool {
        self.core.lock().unwrap().output_final
    }

    pub(crate) fn outgoing_is_empty(&self) -> bool {
        self.core.lock().unwrap().outgoing.is_empty()
    }

    pub(crate) fn active_worker_count(&self) -> usize {
        self.core.lock().unwrap().active_workers
    }

    /// Reserve worker slots for pending batches. Every claim must be paired
    /// with one [`Stage::run_next_batch`] call, which releases the slot.
    /// In-flight workers count against both the pending estimate and the
    /// step's concurrency cap. `gate_open` is false while a non-eager
    /// stage's predecessors are still producing.
    pub(crate) fn claim_batches(&self, batch_cap: usize, gate_open: bool) -> usize {
        let mut core = self.core.lock().unwrap();
        if !gate_open || core.output_final || core.incoming.is_empty() {
            return 0;
        }
        let want = core.incoming.len().div_ceil(batch_cap);
        let room = self
            .step
            .max_concurrency()
            .unwrap_or(usize::MAX)
            .saturating_sub(core.active_workers);
        let claims = want.saturating_sub(core.active_workers).min(room);
        core.active_workers += claims;
        claims
    }

    /// Worker entry point: select one batch, run the transform, publish or
    /// roll back, and release the worker slot.
    pub(crate) fn run_next_batch(&self, batch_cap: usize, timeout: Option<Duration>) {
        let Some((items, batch_gen)) = self.select_batch(batch_cap) else {
            return;
        };

        let views: Vec<BatchItem<'_, K, V>> = items
            .iter()
            .map(|n| BatchItem {
                key: &n.key,
                value: n.state.value().expect("tombstones are filtered at selection"),
                gens: n.state.gens(),
            })
            .collect();

        let started = Instant::now();
        let mut emitter = Emitter::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.step.process(&views, &mut emitter)
        }))
        .unwrap_or_else(|_| Err(anyhow!("transform panicked")));
        let elapsed = started.elapsed();
        drop(views);

        match outcome {
            Ok(()) => match timeout {
                Some(limit) if elapsed > limit => self.roll_back(
                    &items,
                    Error::BatchTimeout {
                        stage: self.index,
                        elapsed,
                    },
                ),
                _ => self.publish(&items, emitter, batch_gen),
            },
            Err(source) => self.roll_back(
                &items,
                Error::Transform {
                    stage: self.index,
                    source,
                },
            ),
        }
    }

    /// Pop up to `batch_cap` notifications off the incoming queue, folding
    /// each accepted one into the input map. Stale vectors, keys the match
    /// predicate skips, and tombstones never reach the transform. Two
    /// accepted notifications for one key coalesce: only the latest state
    /// is processed. The cap bounds the raw pops, not the survivors, so
    /// one worker consumes at most `batch_cap` queue entries and the
    /// pending estimate in [`Stage::claim_batches`] stays honest.
    fn select_batch(&self, batch_cap: usize) -> Option<(Vec<Notification<K, V>>, u64)> {
        let mut core = self.core.lock().unwrap();
        if self.shared.stop_requested() {
            // cancelled between claim and start: leave the queue alone
            core.active_workers -= 1;
            drop(core);
            self.shared.signal();
            return None;
        }
        let mut picked: Vec<Notification<K, V>> = Vec::new();
        let mut slot_of: HashMap<K, usize> = HashMap::new();

        let mut popped = 0usize;
        while popped < batch_cap {
            let Some(note) = core.incoming.pop_front() else {
                break;
            };
            popped += 1;
            if let Some(current) = core.input.get(&note.key) {
                if !note.state.gens().dominates(current.gens()) {
                    trace!(stage = self.index, "dropping stale notification");
                    #[cfg(feature = "metrics")]
                    self.shared.metrics.stale_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            core.input.insert(note.key.clone(), note.state.clone());
            #[cfg(feature = "metrics")]
            self.shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);

            if !self.step.matches(&note.key) {
                // Recorded, not transformed; the value has already fanned
                // out past this stage.
                #[cfg(feature = "metrics")]
                self.shared.metrics.unmatched.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if note.state.payload().is_tombstone() {
                continue;
            }
            match slot_of.get(&note.key) {
                Some(&i) => picked[i] = note,
                None => {
                    slot_of.insert(note.key.clone(), picked.len());
                    picked.push(note);
                }
            }
        }

        if picked.is_empty() {
            core.active_workers -= 1;
            drop(core);
            self.shared.signal();
            return None;
        }

        let batch_gen = core.local_gen;
        core.local_gen += 1;
        trace!(stage = self.index, batch = picked.len(), batch_gen, "batch selected");
        Some((picked, batch_gen))
    }

    /// Post-batch publication under the lock: resolve each staged emission's
    /// vector via merge-and-bump, suppress unchanged values, and write
    /// through the output map's dominance filter onto the outgoing queue.
    fn publish(&self, items: &[Notification<K, V>], emitter: Emitter<K, V>, batch_gen: u64) {
        let staged = emitter.into_staged();
        let mut core = self.core.lock().unwrap();
        #[cfg(feature = "metrics")]
        self.shared.metrics.batches.fetch_add(1, Ordering::Relaxed);

        let mut merged = GenVec::zero(self.stage_count);
        for note in items {
            merged = merged.merge_max(note.state.gens());
        }
        let batch_values: HashMap<&K, &V> = items
            .iter()
            .map(|n| (&n.key, n.state.value().expect("tombstones are filtered at selection")))
            .collect();

        let mut published = 0usize;
        for entry in staged {
            let gens_out = match entry.base {
                BaseGens::Item(base) => base.bump(self.index, batch_gen),
                BaseGens::Merged => merged.bump(self.index, batch_gen),
                BaseGens::Explicit(gens) => {
                    if let Err(err) = self.check_explicit(&gens, &merged) {
                        warn!(stage = self.index, "aborting run: {err}");
                        self.shared.abort(err);
                        core.active_workers -= 1;
                        drop(core);
                        self.shared.signal();
                        return;
                    }
                    gens
                }
            };

            // A result equal to its input is no result at all: downstream
            // already holds that value.
            if let Payload::Value(v) = &entry.payload {
                let current = batch_values
                    .get(&entry.key)
                    .copied()
                    .or_else(|| core.input.get(&entry.key).and_then(State::value));
                if current == Some(v) {
                    #[cfg(feature = "metrics")]
                    self.shared
                        .metrics
                        .unchanged_suppressed
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if let Some(prev) = core.output.get(&entry.key) {
                if !gens_out.dominates(prev.gens()) {
                    // A later batch got there first; this output is stale
                    // speculation.
                    #[cfg(feature = "metrics")]
                    self.shared
                        .metrics
                        .speculative_discarded
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let state = State::new(entry.payload, gens_out);
            core.output.insert(entry.key.clone(), state.clone());
            core.outgoing
                .push_back(Notification::new(entry.key, state, Some(self.index)));
            published += 1;
            #[cfg(feature = "metrics")]
            self.shared.metrics.emitted.fetch_add(1, Ordering::Relaxed);
        }

        trace!(stage = self.index, published, "batch published");
        core.active_workers -= 1;
        drop(core);
        self.shared.signal();
    }

    fn check_explicit(&self, gens: &GenVec, merged: &GenVec) -> Result<(), Error> {
        if gens.len() != self.stage_count {
            return Err(Error::Config(format!(
                "emitted a vector of length {} in a {}-stage run",
                gens.len(),
                self.stage_count
            )));
        }
        if gens.slot(self.index) == 0 || !gens.dominates(merged) {
            return Err(Error::Protocol {
                stage: self.index,
                detail: format!(
                    "emitted vector {gens:?} does not dominate the merged inputs {merged:?}"
                ),
            });
        }
        Ok(())
    }

    /// Drop a failed batch. Nothing the transform produced is published,
    /// and the stage is effectively skipped for the batch's keys. For any
    /// key the stage had already published an output for, re-assert the
    /// key's current input as a pass-through under a fresh local count, so
    /// the stale output cannot outlive the skip downstream.
    fn roll_back(&self, items: &[Notification<K, V>], err: Error) {
        let mut core = self.core.lock().unwrap();
        warn!(stage = self.index, "dropping batch: {err}");
        #[cfg(feature = "metrics")]
        match &err {
            Error::BatchTimeout { .. } => {
                self.shared.metrics.batch_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.shared
                    .metrics
                    .transform_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        if items.iter().any(|n| core.output.contains_key(&n.key)) {
            let corrective_gen = core.local_gen;
            core.local_gen += 1;
            for note in items {
                if !core.output.contains_key(&note.key) {
                    continue;
                }
                let current = core
                    .input
                    .get(&note.key)
                    .expect("accepted inputs are recorded")
                    .clone();
                let gens_out = current.gens().bump(self.index, corrective_gen);
                let state = State::new(current.into_payload(), gens_out);
                core.output.insert(note.key.clone(), state.clone());
                core.outgoing
                    .push_back(Notification::new(note.key.clone(), state, Some(self.index)));
                #[cfg(feature = "metrics")]
                self.shared.metrics.correctives.fetch_add(1, Ordering::Relaxed);
            }
            debug!(stage = self.index, "re-asserted inputs for rolled-back batch");
        }

        core.active_workers -= 1;
        drop(core);
        self.shared.signal();
    }

    #[cfg(test)]
    fn output_state(&self, key: &K) -> Option<State<V>> {
        self.core.lock().unwrap().output.get(key).cloned()
    }

    #[cfg(test)]
    fn input_state(&self, key: &K) -> Option<State<V>> {
        self.core.lock().unwrap().input.get(key).cloned()
    }
}
