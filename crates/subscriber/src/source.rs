use crate::message::{AckId, ReceivedMessage};
use crate::state::SessionState;

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Callback invoked once per delivered message.
pub type MessageCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Outcome of an ack or nack.
///
/// The request is submitted when `ack_message`/`nack_message` is called, so
/// dropping this future does not cancel it.
pub type AckFuture<E> = BoxFuture<'static, Result<(), E>>;

/// Marker trait for message source errors.
pub trait MessageSourceError: Error + Send + Sync + 'static {
    /// The source has reached its terminal state.
    fn is_closed(&self) -> bool;

    /// The ack id was not outstanding. Callers should treat this as already resolved.
    fn is_unknown_ack_id(&self) -> bool;
}

/// A source of one-at-a-time message deliveries.
///
/// Typically the source is some sort of queue that receives pull responses and
/// breaks them into individual messages.
#[async_trait]
pub trait MessageSource
where
    Self: Send + Sync + 'static,
{
    /// The error type for the source.
    type Error: MessageSourceError;

    /// Starts the source and registers the callback. Only the first call has
    /// any effect.
    fn start(&self, callback: MessageCallback);

    /// Shuts the source down, cancelling outstanding pulls and timers. No new
    /// callbacks begin once this returns. Safe to call more than once.
    async fn shutdown(&self);

    /// Requests up to `max_callbacks` more deliveries.
    fn read(&self, max_callbacks: usize);

    /// Positively acknowledges the message associated with `ack_id`.
    ///
    /// `size` should be the original size estimate of the message.
    fn ack_message(&self, ack_id: AckId, size: usize) -> AckFuture<Self::Error>;

    /// Negatively acknowledges the message associated with `ack_id`, allowing
    /// the service to redeliver it.
    ///
    /// `size` should be the original size estimate of the message.
    fn nack_message(&self, ack_id: AckId, size: usize) -> AckFuture<Self::Error>;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;
}
