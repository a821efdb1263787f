use proven_subscriber::{AckId, PullTransportError};
use thiserror::Error;

/// Errors produced by the in-memory transport (only through failure injection).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// An injected pull failure.
    #[error("pull failed")]
    PullFailed,

    /// An injected acknowledgment failure.
    #[error("failed to acknowledge {0}")]
    AcknowledgeFailed(AckId),
}

impl PullTransportError for Error {}
