use crate::error::Error;
use crate::handler::SubscriptionHandler;
use crate::options::SessionOptions;

use std::fmt::{self, Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use proven_subscriber::{AckId, MessageCallback, MessageSource, MessageSourceError, ReceivedMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Inner<S, X> {
    handler: X,
    handlers: TaskTracker,
    options: SessionOptions,
    phase: Mutex<Phase>,
    phase_tx: watch::Sender<Phase>,
    read_gate: CancellationToken,
    source: S,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Runs a [`SubscriptionHandler`] against a [`MessageSource`].
///
/// The session starts and shuts down the source exactly once. It keeps at
/// most `max_concurrency` handlers running and issues one `read(1)` each time
/// a handler finishes, so demand always mirrors free worker slots.
pub struct SubscriptionSession<S, X>
where
    S: MessageSource,
    X: SubscriptionHandler,
{
    inner: Arc<Inner<S, X>>,
}

impl<S, X> Clone for SubscriptionSession<S, X>
where
    S: MessageSource,
    X: SubscriptionHandler,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, X> Debug for SubscriptionSession<S, X>
where
    S: MessageSource,
    X: SubscriptionHandler,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("options", &self.inner.options)
            .field("phase", &*self.inner.phase.lock())
            .field("running_handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

impl<S, X> SubscriptionSession<S, X>
where
    S: MessageSource,
    X: SubscriptionHandler,
{
    /// Creates a session. Nothing is delivered until [`Self::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] if the options fail validation.
    pub fn new(source: S, handler: X, options: SessionOptions) -> Result<Self, Error> {
        options.validate().map_err(Error::InvalidOptions)?;

        let (phase_tx, _) = watch::channel(Phase::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                handler,
                handlers: TaskTracker::new(),
                options,
                phase: Mutex::new(Phase::Idle),
                phase_tx,
                read_gate: CancellationToken::new(),
                source,
                worker: Mutex::new(None),
            }),
        })
    }

    /// Starts the source and requests enough messages to fill every worker slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call and [`Error::Closed`]
    /// once shutdown has been requested.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Idle => {}
                Phase::Running => return Err(Error::AlreadyStarted),
                Phase::Stopping | Phase::Stopped => return Err(Error::Closed),
            }

            let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
            let callback: MessageCallback = Arc::new(move |message: ReceivedMessage| {
                if let Err(e) = deliveries_tx.send(message) {
                    debug!("Session worker gone, dropping delivery {}", e.0.ack_id());
                }
            });

            self.inner.source.start(callback);
            *self.inner.worker.lock() = Some(tokio::spawn(
                Arc::clone(&self.inner).run(deliveries_rx),
            ));

            *phase = Phase::Running;
            self.inner.phase_tx.send_replace(Phase::Running);

            // Issued under the lock so a racing shutdown cannot gate it.
            self.inner.source.read(self.inner.options.max_concurrency);
        }

        info!(
            "Subscription session started with {} worker slots",
            self.inner.options.max_concurrency
        );

        Ok(())
    }

    /// Requests up to `max_messages` additional deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before [`Self::start`] and
    /// [`Error::Closed`] once shutdown has been requested.
    pub fn read(&self, max_messages: usize) -> Result<(), Error> {
        self.inner.read(max_messages)
    }

    /// Stops accepting new work, waits for running handlers to resolve their
    /// messages and shuts the source down.
    ///
    /// Deliveries that arrive after the gate closes are nacked. Calling this
    /// more than once is safe; later callers wait for the first to finish.
    pub async fn shutdown(&self) {
        let previous = {
            let mut phase = self.inner.phase.lock();
            let previous = *phase;
            if matches!(previous, Phase::Idle | Phase::Running) {
                *phase = Phase::Stopping;
                self.inner.read_gate.cancel();
            }
            previous
        };

        match previous {
            Phase::Stopping => {
                let mut phase_rx = self.inner.phase_tx.subscribe();
                if phase_rx
                    .wait_for(|phase| *phase == Phase::Stopped)
                    .await
                    .is_err()
                {
                    error!("phase channel closed before shutdown completed");
                }
                return;
            }
            Phase::Stopped => return,
            Phase::Idle | Phase::Running => {}
        }

        self.inner.phase_tx.send_replace(Phase::Stopping);
        info!("Shutting down subscription session");

        self.inner.handlers.close();
        self.inner.handlers.wait().await;

        self.inner.source.shutdown().await;

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            error!("Subscription session worker failed: {e}");
        }

        *self.inner.phase.lock() = Phase::Stopped;
        self.inner.phase_tx.send_replace(Phase::Stopped);

        info!("Subscription session shut down");
    }

    /// Whether the session has been started and shutdown has not been requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.inner.phase.lock() == Phase::Running
    }

    /// Number of handlers currently running.
    #[must_use]
    pub fn running_handlers(&self) -> usize {
        self.inner.handlers.len()
    }

    /// The driven source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.inner.source
    }
}

impl<S, X> Inner<S, X>
where
    S: MessageSource,
    X: SubscriptionHandler,
{
    fn read(&self, max_messages: usize) -> Result<(), Error> {
        if self.read_gate.is_cancelled() {
            return Err(Error::Closed);
        }

        if *self.phase.lock() == Phase::Idle {
            return Err(Error::NotStarted);
        }

        self.source.read(max_messages);

        Ok(())
    }

    async fn run(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<ReceivedMessage>) {
        while let Some(message) = deliveries.recv().await {
            // Checked under the phase lock so a handler is either tracked
            // before shutdown waits on the tracker or not spawned at all.
            let late = {
                let phase = self.phase.lock();
                if *phase == Phase::Running {
                    self.handlers.spawn(Arc::clone(&self).process(message));
                    None
                } else {
                    Some(message)
                }
            };

            if let Some(message) = late {
                self.nack_late(message);
            }
        }

        debug!("Subscription session worker finished");
    }

    async fn process(self: Arc<Self>, message: ReceivedMessage) {
        let ack_id = message.ack_id().clone();
        let size = message.size();

        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await;

        let resolution = match outcome {
            Ok(Ok(())) => self.source.ack_message(ack_id.clone(), size),
            Ok(Err(e)) => {
                warn!("Handler failed for message {ack_id}: {e}");
                self.source.nack_message(ack_id.clone(), size)
            }
            Err(_) => {
                error!("Handler panicked for message {ack_id}");
                self.source.nack_message(ack_id.clone(), size)
            }
        };

        if let Err(e) = resolution.await {
            report_resolution(&ack_id, &e);
        }

        if self.read(1).is_err() {
            debug!("Session closing, not refilling worker slot");
        }
    }

    fn nack_late(&self, message: ReceivedMessage) {
        let ack_id = message.ack_id().clone();
        debug!("Nacking message {ack_id} delivered after shutdown began");

        // Submitted now so a concurrent source shutdown waits for it.
        let resolution = self.source.nack_message(ack_id.clone(), message.size());

        tokio::spawn(async move {
            if let Err(e) = resolution.await {
                report_resolution(&ack_id, &e);
            }
        });
    }
}

fn report_resolution<E: MessageSourceError>(ack_id: &AckId, error: &E) {
    if error.is_unknown_ack_id() {
        debug!("Message {ack_id} was already resolved");
    } else if error.is_closed() {
        debug!("Source closed before message {ack_id} was resolved");
    } else {
        warn!("Failed to resolve message {ack_id}: {error}");
    }
}
