//! The user-facing transform boundary.
//!
//! This module defines:
//!
//! - [`Step`]: the capability set a pipeline stage exposes to the scheduler
//!   (`matches`, `eager`, `max_concurrency`, and the transform itself in a
//!   simple and a full form).
//! - [`Outcome`]: what a simple 1:1 transform can say about one value.
//! - [`BatchItem`] / [`Emitter`]: the borrowed input view and push-style
//!   output collector handed to the full form.
//! - [`MapStep`]: a closure-backed [`Step`] builder covering the common
//!   case.
//!
//! A step never sees queues, locks, or generation bookkeeping. The stage
//! computes output vectors with the merge-and-bump rule at publication;
//! [`Emitter::emit_with_gens`] is the one escape hatch for steps that track
//! their own history, and emissions made through it are checked against the
//! ordering protocol.

use crate::error::Error;
use crate::gens::GenVec;
use crate::state::{KeyBound, Payload, ValueBound};
use glob::Pattern;
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of applying a simple 1:1 transform to one value.
///
/// Returning [`Outcome::Value`] with a value equal to the input is
/// indistinguishable from [`Outcome::Unchanged`]: the stage suppresses the
/// emission either way, since downstream already holds that value.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<V> {
    Unchanged,
    Value(V),
    Delete,
}

/// Borrowed view of one accepted notification inside a batch.
#[derive(Debug)]
pub struct BatchItem<'a, K, V> {
    pub(crate) key: &'a K,
    pub(crate) value: &'a V,
    pub(crate) gens: &'a GenVec,
}

impl<'a, K, V> BatchItem<'a, K, V> {
    pub fn key(&self) -> &'a K {
        self.key
    }

    pub fn value(&self) -> &'a V {
        self.value
    }

    /// The generation vector the input arrived with.
    pub fn gens(&self) -> &'a GenVec {
        self.gens
    }
}

/// How a staged emission derives its base vector. The stage resolves the
/// base at publication and bumps its own slot with the batch's local gen.
pub(crate) enum BaseGens {
    /// The input vector of the batch item the emission was made for.
    Item(GenVec),
    /// Componentwise max over the whole batch's input vectors (new or
    /// renamed keys have no single originating item).
    Merged,
    /// Supplied by the step; published as-is after the protocol check.
    Explicit(GenVec),
}

pub(crate) struct Staged<K, V> {
    pub key: K,
    pub payload: Payload<V>,
    pub base: BaseGens,
}

/// Push-style output collector for [`Step::process`].
///
/// Nothing is published while the step runs; the stage validates and
/// publishes staged emissions under its lock after the step returns. If the
/// step fails, everything staged here is discarded with it.
pub struct Emitter<K, V> {
    staged: Vec<Staged<K, V>>,
}

impl<K: KeyBound, V: ValueBound> Emitter<K, V> {
    pub(crate) fn new() -> Self {
        Self { staged: Vec::new() }
    }

    /// Record the outcome for one batch item. [`Outcome::Unchanged`] stages
    /// nothing.
    pub fn emit_for(&mut self, item: &BatchItem<'_, K, V>, outcome: Outcome<V>) {
        let payload = match outcome {
            Outcome::Unchanged => return,
            Outcome::Value(v) => Payload::Value(v),
            Outcome::Delete => Payload::Tombstone,
        };
        self.staged.push(Staged {
            key: item.key.clone(),
            payload,
            base: BaseGens::Item(item.gens.clone()),
        });
    }

    /// Emit a value for `key`, which need not occur in the batch. The base
    /// vector is the merge of the whole batch's inputs.
    pub fn emit(&mut self, key: K, value: V) {
        self.staged.push(Staged {
            key,
            payload: Payload::Value(value),
            base: BaseGens::Merged,
        });
    }

    /// Emit a deletion for `key` with the merged base vector.
    pub fn delete(&mut self, key: K) {
        self.staged.push(Staged {
            key,
            payload: Payload::Tombstone,
            base: BaseGens::Merged,
        });
    }

    /// Emit with a caller-supplied vector instead of the merge-and-bump
    /// default. The vector must strictly dominate the merge of the batch's
    /// inputs and carry a non-zero count in the emitting stage's own slot;
    /// anything else aborts the run with a protocol error.
    pub fn emit_with_gens(&mut self, key: K, payload: Payload<V>, gens: GenVec) {
        self.staged.push(Staged {
            key,
            payload,
            base: BaseGens::Explicit(gens),
        });
    }

    pub(crate) fn into_staged(self) -> Vec<Staged<K, V>> {
        self.staged
    }
}

/// One transform in the pipeline, as the scheduler sees it.
///
/// Implement [`Step::apply`] for a simple per-key transform, or override
/// [`Step::process`] when the stage needs to add, rename, or delete keys
/// beyond its own inputs. The remaining methods are capability flags with
/// defaults matching the common case.
pub trait Step<K: KeyBound, V: ValueBound>: Send + Sync {
    /// Keys this step acts on. Unmatched keys are not transformed, but
    /// their values still flow past this stage to every stage downstream.
    fn matches(&self, _key: &K) -> bool {
        true
    }

    /// Eager steps run speculatively on upstream's current-best value and
    /// rely on the dominance protocol to discard invalidated work. A
    /// non-eager (deliberate) step is not dispatched until every stage to
    /// its left has finalized, so it observes each key at most once.
    /// Steps with effects that are not idempotent must be deliberate.
    fn eager(&self) -> bool {
        true
    }

    /// Upper bound on this step's concurrently running batches.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// The simple 1:1 form. The default leaves every value unchanged.
    fn apply(&self, _key: &K, _value: &V) -> anyhow::Result<Outcome<V>> {
        Ok(Outcome::Unchanged)
    }

    /// The full form: transform a whole batch, emitting zero or more
    /// outputs. The default loops [`Step::apply`] over the batch.
    ///
    /// An error drops the entire batch: no state is updated and nothing
    /// staged in the emitter is published.
    fn process(
        &self,
        batch: &[BatchItem<'_, K, V>],
        out: &mut Emitter<K, V>,
    ) -> anyhow::Result<()> {
        for item in batch {
            let outcome = self.apply(item.key(), item.value())?;
            out.emit_for(item, outcome);
        }
        Ok(())
    }
}

/// Closure-backed [`Step`] for the simple 1:1 form.
///
/// ```
/// use runahead::{MapStep, Outcome};
///
/// let step = MapStep::new(|_k: &String, v: &String| {
///     Ok(if v.contains("chunky") {
///         Outcome::Value(v.replace("chunky", "CHUNKY"))
///     } else {
///         Outcome::Unchanged
///     })
/// });
/// # let _ = step;
/// ```
pub struct MapStep<K, V, F> {
    f: F,
    matcher: Option<Arc<dyn Fn(&K) -> bool + Send + Sync>>,
    eager: bool,
    cap: Option<usize>,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, F> MapStep<K, V, F>
where
    K: KeyBound,
    V: ValueBound,
    F: Fn(&K, &V) -> anyhow::Result<Outcome<V>> + Send + Sync,
{
    #[must_use]
    pub fn new(f: F) -> Self {
        Self {
            f,
            matcher: None,
            eager: true,
            cap: None,
            _marker: PhantomData,
        }
    }

    /// Restrict the step to keys accepted by `pred`. Unmatched keys pass
    /// through untransformed.
    #[must_use]
    pub fn match_keys(mut self, pred: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Some(Arc::new(pred));
        self
    }

    /// Restrict the step to keys matching a glob pattern.
    pub fn match_glob(self, pattern: &str) -> crate::Result<Self>
    where
        K: AsRef<str>,
    {
        let pat = Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("bad key pattern {pattern:?}: {e}")))?;
        Ok(self.match_keys(move |k: &K| pat.matches(k.as_ref())))
    }

    /// Mark the step non-eager: it waits for every stage to its left to
    /// finalize before acting, trading speculation for at-most-once
    /// observation of each key.
    #[must_use]
    pub fn deliberate(mut self) -> Self {
        self.eager = false;
        self
    }

    /// Cap the number of concurrently running batches for this step.
    #[must_use]
    pub fn limit_concurrency(mut self, n: usize) -> Self {
        self.cap = Some(n);
        self
    }
}

impl<K, V, F> Step<K, V> for MapStep<K, V, F>
where
    K: KeyBound,
    V: ValueBound,
    F: Fn(&K, &V) -> anyhow::Result<Outcome<V>> + Send + Sync,
{
    fn matches(&self, key: &K) -> bool {
        self.matcher.as_ref().is_none_or(|m| m(key))
    }

    fn eager(&self) -> bool {
        self.eager
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.cap
    }

    fn apply(&self, key: &K, value: &V) -> anyhow::Result<Outcome<V>> {
        (self.f)(key, value)
    }
}
