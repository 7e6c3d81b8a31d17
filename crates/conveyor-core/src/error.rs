use thiserror::Error;

/// Canonical error enumeration for the crate.
///
/// Store implementations map their client's errors into these variants at the
/// module boundary; third-party error types do not cross the crate surface.
/// Processing failures are not errors: they are `ProcessOutcome` values and
/// are settled inside the poll loop.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The backing store could not be reached or refused the operation.
    /// Transient: nothing was mutated, retry with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Enqueue rejected because the payload is currently in flight; accepting
    /// it would leave the payload in two places at once.
    #[error("payload is already in flight")]
    AlreadyInFlight,

    /// The store returned metadata this crate could not decode.
    #[error("store returned malformed metadata: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
