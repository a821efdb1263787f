//! Pull-based message source with flow control and asynchronous acknowledgment tracking.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod flow_control;
mod options;
mod pending_acks;
mod source;

pub use error::Error;
pub use flow_control::{FlowControlSnapshot, FlowController};
pub use options::{FlowControlOptions, LeaseOptions, PullBackoffOptions, PullSourceOptions};
pub use pending_acks::{PendingAck, PendingAckRegistry};
pub use source::PullMessageSource;
