use thiserror::Error;

/// Errors that can occur in a subscription session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The session was already started.
    #[error("session already started")]
    AlreadyStarted,

    /// Shutdown has been requested.
    #[error("session is shut down")]
    Closed,

    /// The options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The session has not been started.
    #[error("session not started")]
    NotStarted,
}
