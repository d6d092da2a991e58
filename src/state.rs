//! Keys, values, and the states and notifications that carry them.
//!
//! Keys and values are opaque to the scheduler: a key is only ever hashed
//! and compared, a value is only ever cloned and compared for equality.
//! Value equality may report false negatives (the update is then treated as
//! a change); it must not report false positives.

use crate::gens::GenVec;
use std::hash::Hash;

/// The standard bound for keys indexed by a run.
///
/// The runtime moves keys across threads and uses them as map indices, so
/// they must be hashable, comparable, clonable, and `'static`. The blanket
/// impl admits any type fitting these constraints.
pub trait KeyBound: Eq + Hash + Clone + Send + Sync + 'static {}
impl<T> KeyBound for T where T: Eq + Hash + Clone + Send + Sync + 'static {}

/// The standard bound for values carried through a run.
///
/// Values are never mutated by the core; they are cloned into downstream
/// queues and compared against their inputs to suppress no-op emissions.
pub trait ValueBound: PartialEq + Clone + Send + Sync + 'static {}
impl<T> ValueBound for T where T: PartialEq + Clone + Send + Sync + 'static {}

/// A value or its absence. Deletions travel through the pipeline as
/// ordinary state so that downstream stages and the terminal surface can
/// retire the key under the same dominance rule as any other update.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload<V> {
    Value(V),
    Tombstone,
}

impl<V> Payload<V> {
    /// The carried value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&V> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }
}

/// A `(payload, gens)` pair: one key's latest content on one side of a
/// stage, or in the terminal surface.
#[derive(Clone, Debug)]
pub struct State<V> {
    payload: Payload<V>,
    gens: GenVec,
}

impl<V> State<V> {
    #[must_use]
    pub fn new(payload: Payload<V>, gens: GenVec) -> Self {
        Self { payload, gens }
    }

    pub fn payload(&self) -> &Payload<V> {
        &self.payload
    }

    /// The carried value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&V> {
        self.payload.value()
    }

    pub fn gens(&self) -> &GenVec {
        &self.gens
    }

    pub fn into_payload(self) -> Payload<V> {
        self.payload
    }
}

/// One key-state update moving between stages.
///
/// `origin` is the index of the producing stage, or `None` for run input
/// seeded by the driver (before stage 0). The coordinator fans a
/// notification out to every stage to the right of its origin.
#[derive(Clone, Debug)]
pub struct Notification<K, V> {
    pub key: K,
    pub state: State<V>,
    pub origin: Option<usize>,
}

impl<K, V> Notification<K, V> {
    #[must_use]
    pub fn new(key: K, state: State<V>, origin: Option<usize>) -> Self {
        Self { key, state, origin }
    }
}
