use std::error::Error;

use async_trait::async_trait;
use proven_subscriber::ReceivedMessage;

/// Marker trait for subscription handler errors
pub trait SubscriptionHandlerError: Error + Send + Sync + 'static {}

/// Application logic run for every delivered message.
///
/// Returning `Ok` acknowledges the message; returning an error (or panicking)
/// negatively acknowledges it so the service can redeliver it.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: SubscriptionHandlerError;

    /// Handles the given message.
    async fn handle(&self, message: ReceivedMessage) -> Result<(), Self::Error>;
}
