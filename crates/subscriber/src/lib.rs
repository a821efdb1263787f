//! Abstract interface for pull-based, one-message-at-a-time subscription sources.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Messages delivered to the application and the ids used to acknowledge them.
pub mod message;

/// Message sources own the delivery lifecycle of a subscription session.
pub mod source;

/// Lifecycle states shared by all message sources.
pub mod state;

/// Transports perform the actual pulls and acknowledgments against the service.
pub mod transport;

pub use message::{AckId, ReceivedMessage};
pub use source::{AckFuture, MessageCallback, MessageSource, MessageSourceError};
pub use state::SessionState;
pub use transport::{PullTransport, PullTransportError};
