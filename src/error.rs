//! Error taxonomy observable at the scheduler boundary.
//!
//! Per-batch failures ([`Error::Transform`], [`Error::BatchTimeout`]) are
//! contained at the stage that suffered them: the batch is dropped, the
//! stage is effectively skipped for those keys, and the run continues.
//! Protocol and configuration errors are fatal and surface to the caller of
//! `run_to_completion`. Cancellation is not an error; a cancelled run
//! returns partial results flagged as such.

use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A user transform failed. The whole batch was rolled back and the
    /// stage skipped for its keys; downstream keeps the pre-existing value.
    #[error("transform failed at stage {stage}: {source}")]
    Transform {
        stage: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A batch exceeded the per-stage deadline. Treated like a transform
    /// failure, with any previously published output for the affected keys
    /// unwound by a corrective emission.
    #[error("batch at stage {stage} exceeded its deadline ({elapsed:?})")]
    BatchTimeout { stage: usize, elapsed: Duration },

    /// A stage emitted a notification whose vector does not dominate its
    /// merged inputs. The run aborts: accepting such an emission would break
    /// the ordering that makes speculation safe.
    #[error("generation protocol violated at stage {stage}: {detail}")]
    Protocol { stage: usize, detail: String },

    /// Invalid run assembly or options, reported at the offending call.
    #[error("invalid configuration: {0}")]
    Config(String),
}
