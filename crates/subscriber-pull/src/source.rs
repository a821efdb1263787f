use crate::error::Error;
use crate::flow_control::{FlowControlSnapshot, FlowController};
use crate::options::{LeaseOptions, PullSourceOptions};
use crate::pending_acks::PendingAckRegistry;

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;
use proven_subscriber::{
    AckFuture, AckId, MessageCallback, MessageSource, PullTransport, ReceivedMessage, SessionState,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug)]
enum Resolution {
    Ack,
    Nack,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("ack"),
            Self::Nack => f.write_str("nack"),
        }
    }
}

enum Admission {
    Admitted(ReceivedMessage),
    /// The buffer is empty; this many message slots are free.
    NeedsPull(usize),
    Rejected,
}

/// Everything guarded by the source mutex.
struct Ledger {
    /// Pulled but not yet admitted, in arrival order.
    buffer: VecDeque<ReceivedMessage>,
    demand: Option<mpsc::UnboundedReceiver<usize>>,
    flow: FlowController,
    pending: PendingAckRegistry,
    state: SessionState,
}

struct Shared<T>
where
    T: PullTransport,
{
    /// Dispatcher and lease timer.
    background: TaskTracker,
    demand_tx: mpsc::UnboundedSender<usize>,
    ledger: Mutex<Ledger>,
    options: PullSourceOptions,
    /// Submitted acks and nacks.
    resolutions: TaskTracker,
    shutdown_token: CancellationToken,
    state_tx: watch::Sender<SessionState>,
    transport: T,
}

/// A message source that pulls batches from a [`PullTransport`] and hands
/// them out one at a time under flow control.
///
/// Each `read(n)` is an independent grant served in the order received. A
/// grant ends once it has delivered `n` messages or when flow control rejects
/// the next message; demand left at that point is dropped rather than carried
/// over to later reads. A failed or empty pull keeps the grant open and pulls
/// again after a backoff (see [`crate::PullBackoffOptions`]).
pub struct PullMessageSource<T>
where
    T: PullTransport,
{
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PullMessageSource<T>
where
    T: PullTransport,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Debug for PullMessageSource<T>
where
    T: PullTransport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.shared.ledger.lock();

        f.debug_struct("PullMessageSource")
            .field("state", &ledger.state)
            .field("outstanding", &ledger.flow.snapshot())
            .field("buffered", &ledger.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<T> PullMessageSource<T>
where
    T: PullTransport,
{
    /// Creates a new source in the `Created` state.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the options fail validation.
    pub fn new(transport: T, options: PullSourceOptions) -> Result<Self, Error<T::Error>> {
        options.validate().map_err(Error::InvalidOptions)?;

        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Created);
        let flow = FlowController::new(
            options.flow_control.max_outstanding_messages,
            options.flow_control.max_outstanding_bytes,
        );

        Ok(Self {
            shared: Arc::new(Shared {
                background: TaskTracker::new(),
                demand_tx,
                ledger: Mutex::new(Ledger {
                    buffer: VecDeque::new(),
                    demand: Some(demand_rx),
                    flow,
                    pending: PendingAckRegistry::new(),
                    state: SessionState::Created,
                }),
                options,
                resolutions: TaskTracker::new(),
                shutdown_token: CancellationToken::new(),
                state_tx,
                transport,
            }),
        })
    }

    /// Outstanding message count and bytes.
    #[must_use]
    pub fn outstanding(&self) -> FlowControlSnapshot {
        self.shared.ledger.lock().flow.snapshot()
    }

    /// Messages pulled but not yet delivered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.ledger.lock().buffer.len()
    }

    /// Number of invariant violations seen (flow control underflows and
    /// duplicate ack ids from the transport).
    #[must_use]
    pub fn invariant_violations(&self) -> u64 {
        let ledger = self.shared.ledger.lock();

        ledger.flow.violations() + ledger.pending.duplicates()
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T> Shared<T>
where
    T: PullTransport,
{
    fn start(self: &Arc<Self>, callback: MessageCallback) {
        {
            let mut ledger = self.ledger.lock();

            if ledger.state != SessionState::Created {
                debug!("Ignoring start in state {}", ledger.state);
                return;
            }

            let Some(demand) = ledger.demand.take() else {
                error!("demand receiver missing for a created source");
                return;
            };

            ledger.state = SessionState::Started;

            // Spawned under the lock so a concurrent shutdown always tracks them.
            self.background
                .spawn(Arc::clone(self).dispatch(callback, demand));

            if let Some(lease) = self.options.lease.clone() {
                self.background.spawn(Arc::clone(self).extend_leases(lease));
            }
        }

        self.state_tx.send_replace(SessionState::Started);
        info!("Message source started");
    }

    fn read(&self, max_callbacks: usize) {
        if max_callbacks == 0 {
            return;
        }

        let state = self.ledger.lock().state;
        if !state.accepts_deliveries() {
            debug!("Ignoring read({}) in state {}", max_callbacks, state);
            return;
        }

        if self.demand_tx.send(max_callbacks).is_err() {
            debug!("Dispatcher gone, dropping read({})", max_callbacks);
        }
    }

    fn state(&self) -> SessionState {
        self.ledger.lock().state
    }

    async fn dispatch(
        self: Arc<Self>,
        callback: MessageCallback,
        mut demand: mpsc::UnboundedReceiver<usize>,
    ) {
        loop {
            let max_callbacks = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                next = demand.recv() => match next {
                    Some(max_callbacks) => max_callbacks,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                delivered = self.serve(max_callbacks, &callback) => {
                    debug!("read({}) served {} deliveries", max_callbacks, delivered);
                }
            }
        }

        debug!("Dispatcher stopped");
    }

    async fn serve(self: &Arc<Self>, max_callbacks: usize, callback: &MessageCallback) -> usize {
        let backoff = &self.options.pull_backoff;
        let mut delay = backoff.initial();
        let mut delivered = 0;

        while delivered < max_callbacks {
            match self.admit_next() {
                Admission::Admitted(message) => {
                    debug!("Delivering {} ({} bytes)", message.ack_id(), message.size());
                    callback(message);
                    delivered += 1;
                }
                Admission::NeedsPull(headroom) => {
                    let wanted = (max_callbacks - delivered)
                        .min(headroom)
                        .min(self.options.max_pull_batch);

                    match self.transport.pull(wanted).await {
                        Ok(messages) if !messages.is_empty() => {
                            self.ledger.lock().buffer.extend(messages);
                            delay = backoff.initial();
                            continue;
                        }
                        Ok(_) => debug!("Pull returned no messages, retrying in {:?}", delay),
                        Err(e) => warn!("Pull failed, retrying in {:?}: {}", delay, e),
                    }

                    // The unserved part of the grant is kept; shutdown cancels the wait.
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                }
                Admission::Rejected => break,
            }
        }

        delivered
    }

    fn admit_next(self: &Arc<Self>) -> Admission {
        let mut ledger = self.ledger.lock();

        loop {
            if self.shutdown_token.is_cancelled() {
                return Admission::Rejected;
            }

            let Some(message) = ledger.buffer.pop_front() else {
                let headroom = ledger.flow.message_headroom();

                return if headroom == 0 {
                    Admission::Rejected
                } else {
                    Admission::NeedsPull(headroom)
                };
            };

            let size = message.size();

            if ledger.flow.exceeds_ceiling(size) {
                warn!(
                    "Message {} ({} bytes) can never fit the byte ceiling, nacking",
                    message.ack_id(),
                    size
                );
                self.nack_undelivered(message.ack_id().clone());
                continue;
            }

            if ledger.pending.contains(message.ack_id()) {
                // Counted and reported by the registry; the original entry stays.
                ledger
                    .pending
                    .insert(message.ack_id().clone(), size, Instant::now());
                continue;
            }

            if !ledger.flow.try_admit(size) {
                ledger.buffer.push_front(message);
                return Admission::Rejected;
            }

            ledger
                .pending
                .insert(message.ack_id().clone(), size, Instant::now());

            return Admission::Admitted(message);
        }
    }

    fn nack_undelivered(self: &Arc<Self>, ack_id: AckId) {
        let shared = Arc::clone(self);

        self.resolutions.spawn(async move {
            if let Err(e) = shared.transport.negative_acknowledge(&ack_id).await {
                warn!("Failed to nack undelivered message {}: {}", ack_id, e);
            }
        });
    }

    fn resolve(
        self: &Arc<Self>,
        ack_id: AckId,
        size: usize,
        resolution: Resolution,
    ) -> AckFuture<Error<T::Error>> {
        let handle = {
            let mut ledger = self.ledger.lock();

            if ledger.state.is_terminal() {
                return Box::pin(future::ready(Err(Error::Closed)));
            }

            let Some(recorded) = ledger.pending.begin_resolve(&ack_id) else {
                debug!("{} for unknown ack id {}", resolution, ack_id);
                return Box::pin(future::ready(Err(Error::UnknownAckId(ack_id))));
            };

            if recorded != size {
                warn!(
                    "{} for {} reported {} bytes, delivered as {} bytes",
                    resolution, ack_id, size, recorded
                );
            }

            let shared = Arc::clone(self);
            self.resolutions.spawn(async move {
                let result = match resolution {
                    Resolution::Ack => shared.transport.acknowledge(&ack_id).await,
                    Resolution::Nack => shared.transport.negative_acknowledge(&ack_id).await,
                };

                // The token's fate is decided either way once the call returns.
                shared.complete(&ack_id);

                result.map_err(Error::Transport)
            })
        };

        Box::pin(async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Error::Internal(e.to_string())))
        })
    }

    fn complete(&self, ack_id: &AckId) {
        let mut ledger = self.ledger.lock();

        match ledger.pending.complete(ack_id) {
            Some(entry) => ledger.flow.release(entry.size),
            None => error!("resolved ack id {} was no longer outstanding", ack_id),
        }
    }

    async fn extend_leases(self: Arc<Self>, lease: LeaseOptions) {
        let period = lease.refresh_period();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let ack_ids = self
                .ledger
                .lock()
                .pending
                .leases_to_extend(Instant::now(), lease.max_lease());

            if ack_ids.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                result = self.transport.extend_leases(&ack_ids, lease.ack_deadline()) => match result {
                    Ok(()) => debug!("Extended {} leases", ack_ids.len()),
                    Err(e) => warn!("Failed to extend {} leases: {}", ack_ids.len(), e),
                },
            }
        }

        debug!("Lease timer stopped");
    }

    async fn shutdown(self: &Arc<Self>) {
        let previous = {
            let mut ledger = self.ledger.lock();
            let previous = ledger.state;

            if matches!(previous, SessionState::Created | SessionState::Started) {
                ledger.state = SessionState::ShuttingDown;
                ledger.demand = None;
            }

            previous
        };

        match previous {
            SessionState::Created | SessionState::Started => {}
            SessionState::ShuttingDown => {
                self.wait_for_shutdown().await;
                return;
            }
            SessionState::Shutdown => return,
        }

        self.state_tx.send_replace(SessionState::ShuttingDown);
        info!("Shutting down message source");

        self.shutdown_token.cancel();
        self.background.close();
        self.background.wait().await;

        let undelivered: Vec<ReceivedMessage> = self.ledger.lock().buffer.drain(..).collect();
        if !undelivered.is_empty() {
            info!("Nacking {} undelivered messages", undelivered.len());
        }
        for message in undelivered {
            self.nack_undelivered(message.ack_id().clone());
        }

        self.resolutions.close();
        loop {
            self.resolutions.wait().await;

            // Resolutions are only spawned under the lock, so emptiness checked
            // here cannot race with a new one.
            let finished = {
                let mut ledger = self.ledger.lock();

                if self.resolutions.is_empty() {
                    ledger.state = SessionState::Shutdown;
                    true
                } else {
                    false
                }
            };

            if finished {
                break;
            }
        }

        self.state_tx.send_replace(SessionState::Shutdown);
        info!("Message source shut down");
    }

    async fn wait_for_shutdown(&self) {
        let mut state_rx = self.state_tx.subscribe();

        if state_rx.wait_for(|state| state.is_terminal()).await.is_err() {
            error!("state channel closed before shutdown completed");
        }
    }
}

#[async_trait]
impl<T> MessageSource for PullMessageSource<T>
where
    T: PullTransport,
{
    type Error = Error<T::Error>;

    fn start(&self, callback: MessageCallback) {
        self.shared.start(callback);
    }

    async fn shutdown(&self) {
        self.shared.shutdown().await;
    }

    fn read(&self, max_callbacks: usize) {
        self.shared.read(max_callbacks);
    }

    fn ack_message(&self, ack_id: AckId, size: usize) -> AckFuture<Self::Error> {
        self.shared.resolve(ack_id, size, Resolution::Ack)
    }

    fn nack_message(&self, ack_id: AckId, size: usize) -> AckFuture<Self::Error> {
        self.shared.resolve(ack_id, size, Resolution::Nack)
    }

    fn state(&self) -> SessionState {
        self.shared.state()
    }
}
