//! Drives a message source: starts and stops it exactly once and turns free
//! worker slots into read requests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod handler;
mod options;
mod session;

pub use error::Error;
pub use handler::{SubscriptionHandler, SubscriptionHandlerError};
pub use options::SessionOptions;
pub use session::SubscriptionSession;
