//! # Runahead
//!
//! A library for evaluating an **ordered pipeline of key-indexed
//! transforms** over an in-memory keyspace with optimistic (speculative)
//! parallelism. You declare the stages up front and supply an initial
//! `key -> value` mapping; runahead produces the mapping in which every
//! value has had each applicable stage applied, in declared order -- while
//! freely running later stages concurrently with earlier ones on the
//! current best-guess value and discarding speculative work that earlier
//! stages invalidate.
//!
//! ## Quick Start
//!
//! ```
//! use runahead::{MapStep, Outcome, Run};
//! use std::collections::HashMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut run: Run<String, String> = Run::new();
//!
//! // Stages run in the order they are added.
//! run.add_step(MapStep::new(|_k: &String, v: &String| {
//!     Ok(if v.contains("chunky") {
//!         Outcome::Value(v.replace("chunky", "CHUNKY"))
//!     } else {
//!         Outcome::Unchanged
//!     })
//! }))?;
//! run.add_step(MapStep::new(|_k: &String, v: &String| {
//!     Ok(if v.contains("bacon") {
//!         Outcome::Value(v.replace("bacon", "BACON"))
//!     } else {
//!         Outcome::Unchanged
//!     })
//! }))?;
//!
//! let out = run.run_to_completion(HashMap::from([
//!     ("f".to_string(), "chunky bacon".to_string()),
//! ]))?;
//! assert_eq!(
//!     out.values().get("f").map(String::as_str),
//!     Some("CHUNKY BACON")
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### `Run`
//!
//! A [`Run`] assembles the pipeline: append stages with
//! [`add_step`](Run::add_step) (order defines stage indices), then call
//! [`run_to_completion`](Run::run_to_completion) with the initial mapping.
//! The call blocks until every stage has finalized and consumes the run --
//! a `Run` is single-use.
//!
//! ### `Step`
//!
//! A [`Step`] is one transform plus its capability flags: a `matches`
//! predicate (unmatched keys pass through untransformed), an `eager` flag,
//! and an optional concurrency cap. Implement [`Step::apply`] for a simple
//! per-key transform or override [`Step::process`] to add, rename, or
//! delete keys across a whole batch. [`MapStep`] wraps a closure for the
//! common case.
//!
//! ### Generation vectors
//!
//! Every state carries a [`GenVec`] with one slot per stage, compared in
//! lexicographic tuple order. A stage accepts an update for a key only if
//! its vector strictly dominates the one it currently holds, and stamps a
//! fresh count into its own slot whenever it emits a change. This is the
//! entire correctness argument for speculation: work based on a stale
//! value loses the dominance race and is silently discarded, regardless of
//! the order in which threads ran it.
//!
//! ### Speculation
//!
//! The coordinator fans every emission out to *all* downstream stages
//! immediately, before upstream stages have finished. Downstream stages
//! therefore start on the current-best value for each key; if an earlier
//! stage later emits a change, the dominating notification supersedes the
//! speculative result. Stages whose transforms are not idempotent can opt
//! out per stage ([`MapStep::deliberate`]) or globally
//! ([`RunOptions::deliberate_mode`]).
//!
//! ## Error Handling
//!
//! A failing (or panicking, or timed-out) transform drops its whole batch:
//! the stage is skipped for those keys and downstream keeps the value it
//! already has. These failures are contained and logged, never surfaced to
//! the caller. Ordering-protocol violations and configuration errors abort
//! the run with an [`Error`]. Cancellation (via [`CancelHandle`] or, with
//! the `signal` feature, SIGINT) returns partial results flagged by
//! [`RunOutput::cancelled`].
//!
//! ## Options
//!
//! [`RunOptions`] controls the worker pool size (default: hardware
//! parallelism), the per-stage batch cap, global deliberate mode, the
//! per-batch deadline, and signal-triggered cancellation.
//!
//! ## Feature Flags
//!
//! - `metrics` (default) -- run-level execution counters with JSON export
//!   via [`RunOutput::metrics`].
//! - `signal` -- SIGINT-triggered graceful cancellation
//!   ([`RunOptions::cancel_on_signal`]).
//!
//! ## Module Overview
//!
//! - [`run`] -- assembly and the blocking execution façade
//! - [`step`] -- the user-facing transform boundary
//! - [`gens`] -- generation vectors and their ordering
//! - [`state`] -- keys, values, states, notifications
//! - [`error`] -- the error taxonomy at the scheduler boundary
//! - [`metrics`] -- execution counters (feature: `metrics`)
//! - [`testing`] -- assertion helpers and step fixtures for tests

pub mod error;
pub mod gens;
pub mod run;
pub mod state;
pub mod step;
pub mod testing;

mod coordinator;
mod stage;

#[cfg(feature = "metrics")]
pub mod metrics;

// General re-exports
pub use error::{Error, Result};
pub use gens::{GenOrder, GenVec};
pub use run::{CancelHandle, Run, RunOptions, RunOutput};
pub use state::{KeyBound, Notification, Payload, State, ValueBound};
pub use step::{BatchItem, Emitter, MapStep, Outcome, Step};

// Gated re-exports
#[cfg(feature = "metrics")]
pub use metrics::RunMetrics;
