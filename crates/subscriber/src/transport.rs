use crate::message::{AckId, ReceivedMessage};

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for transport errors
pub trait PullTransportError: Error + Send + Sync + 'static {}

/// The collaborator that talks to the queueing service.
///
/// Retry of failed acknowledgments belongs to implementations of this trait;
/// callers propagate those failures as-is. A pull may come back empty or fail,
/// in which case a source pulls again after a delay.
#[async_trait]
pub trait PullTransport
where
    Self: Send + Sync + 'static,
{
    /// The error type for the transport.
    type Error: PullTransportError;

    /// Pulls up to `max_messages` messages.
    ///
    /// Implementations may wait until at least one message is available. The
    /// returned future must be safe to drop before completion.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, Self::Error>;

    /// Acknowledges a delivery.
    async fn acknowledge(&self, ack_id: &AckId) -> Result<(), Self::Error>;

    /// Negatively acknowledges a delivery so it can be redelivered sooner.
    async fn negative_acknowledge(&self, ack_id: &AckId) -> Result<(), Self::Error>;

    /// Extends the acknowledgment deadline of the given deliveries.
    async fn extend_leases(&self, _ack_ids: &[AckId], _deadline: Duration) -> Result<(), Self::Error> {
        Ok(())
    }
}
