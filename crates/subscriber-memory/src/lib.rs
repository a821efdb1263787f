//! In-memory pull transport for testing and local development.
//!
//! Messages published to the transport sit in a queue until pulled. Each pull
//! leases them out under fresh ack ids; a nack puts the message back at the
//! end of the queue so it is redelivered under a new id.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_subscriber::{AckId, PullTransport, ReceivedMessage};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// A message as stored by the service, before it is leased under an ack id.
#[derive(Clone, Debug)]
struct StoredMessage {
    attributes: HashMap<String, String>,
    payload: Bytes,
    size: Option<usize>,
}

impl StoredMessage {
    fn lease(&self) -> ReceivedMessage {
        let ack_id = AckId::new(Uuid::new_v4().to_string());
        let message =
            ReceivedMessage::with_attributes(ack_id, self.payload.clone(), self.attributes.clone());

        match self.size {
            Some(size) => message.sized(size),
            None => message,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    acknowledged: Vec<AckId>,
    extended: Vec<(AckId, Duration)>,
    fail_acknowledgments: bool,
    failing_pulls: usize,
    in_flight: HashMap<AckId, StoredMessage>,
    nacked: Vec<AckId>,
    pull_count: usize,
    queue: VecDeque<StoredMessage>,
}

/// In-memory transport. Clones share the same queue.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    notify: Arc<Notify>,
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a payload with no attributes.
    pub fn publish(&self, payload: impl Into<Bytes>) {
        self.enqueue(StoredMessage {
            attributes: HashMap::new(),
            payload: payload.into(),
            size: None,
        });
    }

    /// Publishes a payload with attributes.
    pub fn publish_with_attributes(
        &self,
        payload: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) {
        self.enqueue(StoredMessage {
            attributes,
            payload: payload.into(),
            size: None,
        });
    }

    /// Publishes a payload whose deliveries report the given size estimate.
    pub fn publish_sized(&self, payload: impl Into<Bytes>, size: usize) {
        self.enqueue(StoredMessage {
            attributes: HashMap::new(),
            payload: payload.into(),
            size: Some(size),
        });
    }

    /// Makes the next `count` pulls fail.
    pub fn fail_next_pulls(&self, count: usize) {
        self.state.lock().failing_pulls = count;
    }

    /// Makes acknowledgments and negative acknowledgments fail while set.
    pub fn fail_acknowledgments(&self, fail: bool) {
        self.state.lock().fail_acknowledgments = fail;
    }

    /// Ack ids acknowledged so far, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<AckId> {
        self.state.lock().acknowledged.clone()
    }

    /// Ack ids negatively acknowledged so far, in order.
    #[must_use]
    pub fn nacked(&self) -> Vec<AckId> {
        self.state.lock().nacked.clone()
    }

    /// Every lease extension requested so far.
    #[must_use]
    pub fn extended(&self) -> Vec<(AckId, Duration)> {
        self.state.lock().extended.clone()
    }

    /// Number of pulls that returned (successfully or not).
    #[must_use]
    pub fn pull_count(&self) -> usize {
        self.state.lock().pull_count
    }

    /// Number of messages leased out and not yet resolved.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of messages waiting to be pulled.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn enqueue(&self, message: StoredMessage) {
        self.state.lock().queue.push_back(message);
        self.notify.notify_waiters();
    }

    fn try_take(&self, max_messages: usize) -> Option<Result<Vec<ReceivedMessage>, Error>> {
        let mut state = self.state.lock();

        if state.failing_pulls > 0 {
            state.failing_pulls -= 1;
            state.pull_count += 1;
            return Some(Err(Error::PullFailed));
        }

        if state.queue.is_empty() || max_messages == 0 {
            return None;
        }

        let count = max_messages.min(state.queue.len());
        let leased: Vec<StoredMessage> = state.queue.drain(..count).collect();
        let mut messages = Vec::with_capacity(count);
        for stored in leased {
            let message = stored.lease();
            state.in_flight.insert(message.ack_id().clone(), stored);
            messages.push(message);
        }
        state.pull_count += 1;

        Some(Ok(messages))
    }
}

#[async_trait]
impl PullTransport for MemoryTransport {
    type Error = Error;

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, Self::Error> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take(max_messages) {
                if let Ok(messages) = &result {
                    debug!("Pulled {} messages", messages.len());
                }

                return result;
            }

            notified.await;
        }
    }

    async fn acknowledge(&self, ack_id: &AckId) -> Result<(), Self::Error> {
        let mut state = self.state.lock();

        if state.fail_acknowledgments {
            return Err(Error::AcknowledgeFailed(ack_id.clone()));
        }

        state.in_flight.remove(ack_id);
        state.acknowledged.push(ack_id.clone());

        Ok(())
    }

    async fn negative_acknowledge(&self, ack_id: &AckId) -> Result<(), Self::Error> {
        let requeued = {
            let mut state = self.state.lock();

            if state.fail_acknowledgments {
                return Err(Error::AcknowledgeFailed(ack_id.clone()));
            }

            state.nacked.push(ack_id.clone());

            match state.in_flight.remove(ack_id) {
                Some(stored) => {
                    state.queue.push_back(stored);
                    true
                }
                None => false,
            }
        };

        if requeued {
            debug!("Requeued {} for redelivery", ack_id);
            self.notify.notify_waiters();
        }

        Ok(())
    }

    async fn extend_leases(&self, ack_ids: &[AckId], deadline: Duration) -> Result<(), Self::Error> {
        let mut state = self.state.lock();

        for ack_id in ack_ids {
            if state.in_flight.contains_key(ack_id) {
                state.extended.push((ack_id.clone(), deadline));
            }
        }

        Ok(())
    }
}
