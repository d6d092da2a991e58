//! Testing utilities for pipelines built on runahead.
//!
//! This module provides assertion helpers for run results plus a few
//! closure-backed step fixtures that cover the shapes most pipeline tests
//! need: a do-nothing step, a string rewriter, and a glob-based deleter.
//!
//! ```no_run
//! use runahead::Run;
//! use runahead::testing::*;
//! use std::collections::HashMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut run: Run<String, String> = Run::new();
//! run.add_step(rewrite_step("bacon", "BACON"))?;
//!
//! let out = run.run_to_completion(HashMap::from([
//!     ("f".to_string(), "crispy bacon".to_string()),
//! ]))?;
//! assert_final_values_equal(&out, [("f".to_string(), "crispy BACON".to_string())]);
//! # Ok(())
//! # }
//! ```

use crate::run::RunOutput;
use crate::state::{KeyBound, ValueBound};
use crate::step::{MapStep, Outcome};
use std::collections::HashMap;
use std::fmt::Debug;

/// The final values of a run, keyed as the user supplied them.
pub fn final_values<K: KeyBound, V: ValueBound>(out: &RunOutput<K, V>) -> HashMap<K, V> {
    out.values()
}

/// Assert that a run's final values match `expected` exactly (same keys,
/// same values; deleted keys must be absent).
pub fn assert_final_values_equal<K, V>(
    out: &RunOutput<K, V>,
    expected: impl IntoIterator<Item = (K, V)>,
) where
    K: KeyBound + Debug,
    V: ValueBound + Debug,
{
    let got = out.values();
    let want: HashMap<K, V> = expected.into_iter().collect();
    assert_eq!(got, want, "final values differ from expected mapping");
}

/// Assert the exact generation vector of a key's final state.
///
/// # Panics
/// Panics if the key has no final state.
pub fn assert_gens<K, V>(out: &RunOutput<K, V>, key: &K, expected: &[u64])
where
    K: KeyBound + Debug,
    V: ValueBound,
{
    let state = out
        .get(key)
        .unwrap_or_else(|| panic!("no final state for key {key:?}"));
    assert_eq!(
        state.gens().as_slice(),
        expected,
        "generation vector mismatch for key {key:?}"
    );
}

/// A step that leaves every value unchanged (and therefore never emits).
pub fn identity_step<K: KeyBound, V: ValueBound>()
-> MapStep<K, V, impl Fn(&K, &V) -> anyhow::Result<Outcome<V>> + Send + Sync> {
    MapStep::new(|_k: &K, _v: &V| Ok(Outcome::Unchanged))
}

/// A step over string values that replaces occurrences of `from` with
/// `to`, reporting values without `from` as unchanged.
pub fn rewrite_step<K: KeyBound>(
    from: &str,
    to: &str,
) -> MapStep<K, String, impl Fn(&K, &String) -> anyhow::Result<Outcome<String>> + Send + Sync> {
    let from = from.to_string();
    let to = to.to_string();
    MapStep::new(move |_k: &K, v: &String| {
        Ok(if v.contains(&from) {
            Outcome::Value(v.replace(&from, &to))
        } else {
            Outcome::Unchanged
        })
    })
}

/// A step that deletes every key matching a glob pattern and passes the
/// rest through.
pub fn delete_matching_step<K, V>(
    pattern: &str,
) -> crate::Result<MapStep<K, V, impl Fn(&K, &V) -> anyhow::Result<Outcome<V>> + Send + Sync>>
where
    K: KeyBound + AsRef<str>,
    V: ValueBound,
{
    MapStep::new(|_k: &K, _v: &V| Ok(Outcome::Delete)).match_glob(pattern)
}
