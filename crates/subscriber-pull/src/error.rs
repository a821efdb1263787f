use std::error::Error as StdError;

use proven_subscriber::{AckId, MessageSourceError};
use thiserror::Error;

/// Errors that can occur in a pull message source.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: StdError + Send + Sync + 'static,
{
    /// The source has shut down.
    #[error("message source is shut down")]
    Closed,

    /// A resolution task could not be joined.
    #[error("internal error: {0}")]
    Internal(String),

    /// The options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The transport failed.
    #[error(transparent)]
    Transport(E),

    /// The ack id is not outstanding (already resolved, expired, or never delivered).
    #[error("unknown ack id: {0}")]
    UnknownAckId(AckId),
}

impl<E> MessageSourceError for Error<E>
where
    E: StdError + Send + Sync + 'static,
{
    fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    fn is_unknown_ack_id(&self) -> bool {
        matches!(self, Self::UnknownAckId(_))
    }
}
