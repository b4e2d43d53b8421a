use futures_util::{stream::FuturesUnordered, Future, StreamExt};
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::consumers::settings::SubscriptionConfig;
use crate::consumers::{
    ConsumeHandler, FailureHandler, MessageEnvelope, SubscriptionState, Transition,
};
use crate::pool::{ConnectionService, PooledChannel};
use crate::transport::{BrokerChannel, Connector, Delivery, DeliveryStream};
use crate::Error;

/// How many transitions a lagging [`Subscription::transitions`] receiver can miss.
const TRANSITIONS_BUFFER: usize = 64;

/// A queue subscription that keeps consuming across broken channels and connections.
///
/// Use [`SubscriptionFactory`](crate::consumers::SubscriptionFactory) to create one.
///
/// # Lifecycle
///
/// [`Subscription::start_consuming`] registers a consumer and starts invoking the
/// [`ConsumeHandler`] for every delivered message.
///
/// In the background a health check inspects the channel every `check_channel_period`.
/// When the channel is found dead (or the broker cancels our consumer) the subscription:
///
/// - notifies the [`FailureHandler`];
/// - releases the dead channel - envelopes it delivered can no longer be settled;
/// - waits `resubscribe_delay` and registers the consumer again on a fresh channel,
///   over and over, until it succeeds or the subscription is stopped.
///
/// [`Subscription::stop_consuming`] cancels the consumer and waits for all in-flight
/// handlers to complete. [`Subscription::dispose`] does the same and then gives the
/// channel back to the [`ConnectionService`].
///
/// # State transitions
///
/// Every state transition goes through a single lock: the background activities (channel
/// health check, resubscription loop) cannot race with the lifecycle methods.
pub struct Subscription<C: Connector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Connector> {
    connection_service: Arc<ConnectionService<C>>,
    config: SubscriptionConfig,
    machine: Mutex<Machine<C>>,
    state: watch::Sender<SubscriptionState>,
    transitions: broadcast::Sender<Transition>,
    in_flight: Arc<AtomicUsize>,
    /// Lets `Drop` abort the driver without going through the async machine lock.
    driver_abort: std::sync::Mutex<Option<AbortHandle>>,
}

struct Machine<C: Connector> {
    state: SubscriptionState,
    /// Kept across a stop, to be reused by the next start.
    channel: Option<PooledChannel<C>>,
    driver: Option<Driver<C>>,
}

/// The background task running the delivery path, the health check and the
/// resubscription loop.
struct Driver<C: Connector> {
    stop: oneshot::Sender<()>,
    /// Hands back the channel in use when the task exits, if any.
    task: JoinHandle<Option<PooledChannel<C>>>,
}

/// A consumer registered on a channel.
struct Session<C: Connector> {
    channel: PooledChannel<C>,
    consumer_tag: String,
    deliveries: DeliveryStream,
}

#[derive(Clone)]
struct Handlers {
    on_consumed: Arc<dyn ConsumeHandler>,
    on_failure: Arc<dyn FailureHandler>,
}

type InFlight = FuturesUnordered<JoinHandle<()>>;

impl<C: Connector> Subscription<C> {
    pub(crate) fn new(
        connection_service: Arc<ConnectionService<C>>,
        config: SubscriptionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITIONS_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connection_service,
                config,
                machine: Mutex::new(Machine {
                    state: SubscriptionState::Idle,
                    channel: None,
                    driver: None,
                }),
                state,
                transitions,
                in_flight: Arc::new(AtomicUsize::new(0)),
                driver_abort: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue_name
    }

    /// The current state.
    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to all the state transitions from now on.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.inner.transitions.subscribe()
    }

    /// Number of [`ConsumeHandler`] invocations that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Register a consumer on the queue and start invoking `on_consumed` for every message.
    ///
    /// Handlers passed to a previous `start_consuming` call are replaced.
    ///
    /// It returns once the broker has confirmed the consumer registration.
    /// It fails with:
    ///
    /// - [`Error::Connection`] if the broker cannot be reached;
    /// - [`Error::CapacityExceeded`] if the connection service has no channel to spare;
    /// - [`Error::ConsumerRegistration`] if the broker refuses the consumer;
    /// - [`Error::InvalidState`] if the subscription is already running or was disposed.
    ///
    /// Failures are not retried: that is left to the caller.
    #[tracing::instrument(name = "start_consuming", skip_all, fields(queue_name = %self.queue_name()))]
    pub async fn start_consuming<H, F>(&self, on_consumed: H, on_failure: F) -> Result<(), Error>
    where
        H: ConsumeHandler,
        F: FailureHandler,
    {
        let inner = &self.inner;
        let mut machine = inner.machine.lock().await;
        let resting_state = machine.state;
        if !matches!(
            resting_state,
            SubscriptionState::Idle | SubscriptionState::Stopped
        ) {
            return Err(Error::InvalidState {
                operation: "start",
                state: resting_state,
            });
        }
        inner.transition(&mut machine, SubscriptionState::Starting);

        let reusable_channel = machine.channel.take();
        let session = match inner.open_session(reusable_channel).await {
            Ok(session) => session,
            Err(e) => {
                inner.transition(&mut machine, resting_state);
                return Err(e);
            }
        };

        let handlers = Handlers {
            on_consumed: Arc::new(on_consumed),
            on_failure: Arc::new(on_failure),
        };
        let (stop, stop_signal) = oneshot::channel();
        inner.transition(&mut machine, SubscriptionState::Consuming);
        let task = tokio::spawn(Inner::drive(
            Arc::clone(inner),
            session,
            handlers,
            stop_signal,
        ));
        inner.set_driver_abort(Some(task.abort_handle()));
        machine.driver = Some(Driver { stop, task });
        Ok(())
    }

    /// Cancel the consumer and wait for all in-flight handlers to complete.
    ///
    /// No handler is invoked after `stop_consuming` returns.
    /// The channel is kept: a later [`Subscription::start_consuming`] reuses it. Messages
    /// the broker pushed before the consumer was cancelled, but that were not handed to the
    /// handler yet, are requeued.
    ///
    /// It can be called in any state. If the subscription is not running it is a no-op.
    /// In-flight handlers are not interrupted - wrap the call in a timeout if you cannot
    /// afford to wait for them.
    #[tracing::instrument(name = "stop_consuming", skip_all, fields(queue_name = %self.queue_name()))]
    pub async fn stop_consuming(&self) {
        let inner = &self.inner;
        let driver = {
            let mut machine = inner.machine.lock().await;
            match machine.state {
                state if state.is_at_rest() => return,
                SubscriptionState::Stopping => None,
                _ => {
                    inner.transition(&mut machine, SubscriptionState::Stopping);
                    machine.driver.take()
                }
            }
        };

        let Some(driver) = driver else {
            // Somebody else is draining: wait for them to be done.
            self.wait_until_at_rest().await;
            return;
        };

        // The driver might have exited already if its task panicked.
        let _ = driver.stop.send(());
        let channel = match driver.task.await {
            Ok(channel) => channel,
            Err(e) => {
                error!("The consumer task of the subscription failed: {}", e);
                None
            }
        };

        let mut machine = inner.machine.lock().await;
        inner.set_driver_abort(None);
        machine.channel = channel;
        inner.transition(&mut machine, SubscriptionState::Stopped);
    }

    /// Stop consuming (see [`Subscription::stop_consuming`]) and give the channel back to
    /// the connection service.
    ///
    /// It is safe to call `dispose` multiple times.
    #[tracing::instrument(name = "dispose_subscription", skip_all, fields(queue_name = %self.queue_name()))]
    pub async fn dispose(&self) {
        loop {
            self.stop_consuming().await;
            let mut machine = self.inner.machine.lock().await;
            match machine.state {
                SubscriptionState::Disposed => return,
                state if state.is_at_rest() => {
                    if let Some(channel) = machine.channel.take() {
                        self.inner
                            .connection_service
                            .release_channel(&channel)
                            .await;
                    }
                    self.inner
                        .transition(&mut machine, SubscriptionState::Disposed);
                    return;
                }
                // Started again in the meantime.
                _ => continue,
            }
        }
    }

    /// Start consuming, wait for `shutdown` to complete and dispose of the subscription.
    pub async fn run_until_shutdown<H, F>(
        &self,
        on_consumed: H,
        on_failure: F,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error>
    where
        H: ConsumeHandler,
        F: FailureHandler,
    {
        self.start_consuming(on_consumed, on_failure).await?;
        shutdown.await;
        info!(queue_name = %self.queue_name(), "Subscription received shutdown event");
        self.dispose().await;
        Ok(())
    }

    /// [`Subscription::run_until_shutdown`], using SIGTERM as shutdown signal.
    pub async fn run_until_sigterm<H, F>(&self, on_consumed: H, on_failure: F) -> Result<(), Error>
    where
        H: ConsumeHandler,
        F: FailureHandler,
    {
        let shutdown = ShutdownHandler::sigterm().map_err(|e| {
            Error::Configuration(format!("Failed to install the SIGTERM handler: {e}"))
        })?;
        self.run_until_shutdown(on_consumed, on_failure, shutdown.wait_for_signal())
            .await
    }

    async fn wait_until_at_rest(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if state.borrow_and_update().is_at_rest() {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<C: Connector> Drop for Subscription<C> {
    fn drop(&mut self) {
        let driver = self
            .inner
            .driver_abort
            .lock()
            .map(|mut driver| driver.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        if let Some(driver) = driver {
            warn!(
                queue_name = %self.inner.config.queue_name,
                "Subscription dropped while running, in-flight handlers are not drained. Call `dispose` first."
            );
            driver.abort();
        }
    }
}

impl<C: Connector> Inner<C> {
    fn set_driver_abort(&self, handle: Option<AbortHandle>) {
        match self.driver_abort.lock() {
            Ok(mut current) => *current = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }

    /// The single mutation point of the state: callers must hold the machine lock.
    fn transition(&self, machine: &mut Machine<C>, to: SubscriptionState) {
        let from = machine.state;
        if from == to {
            return;
        }
        machine.state = to;
        self.state.send_replace(to);
        // No receivers is fine.
        let _ = self.transitions.send(Transition { from, to });
        info!(queue_name = %self.config.queue_name, ?from, ?to, "Subscription state transition");
    }

    /// Acquire a channel (or reuse `channel`, if still healthy) and register a consumer on it.
    async fn open_session(
        &self,
        channel: Option<PooledChannel<C>>,
    ) -> Result<Session<C>, Error> {
        let channel = match channel {
            Some(channel) if channel.is_usable() && self.connection_service.is_connected() => {
                channel
            }
            Some(broken) => {
                self.connection_service.release_channel(&broken).await;
                self.connection_service.acquire_channel().await?
            }
            None => self.connection_service.acquire_channel().await?,
        };
        let registration =
            tokio::time::timeout(channel.send_timeout(), self.register_consumer(&channel))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::ConsumerRegistration {
                        queue: self.config.queue_name.clone(),
                        source: anyhow::anyhow!("Timed out while registering the consumer."),
                    })
                });
        match registration {
            Ok((consumer_tag, deliveries)) => Ok(Session {
                channel,
                consumer_tag,
                deliveries,
            }),
            Err(e) => {
                self.connection_service.release_channel(&channel).await;
                Err(e)
            }
        }
    }

    #[tracing::instrument(name = "register_consumer", skip_all, fields(queue_name = %self.config.queue_name))]
    async fn register_consumer(
        &self,
        channel: &PooledChannel<C>,
    ) -> Result<(String, DeliveryStream), Error> {
        let queue_name = &self.config.queue_name;
        let refused = |source| Error::ConsumerRegistration {
            queue: queue_name.clone(),
            source,
        };
        let raw = channel.raw();
        raw.set_prefetch(self.config.prefetch_count)
            .await
            .map_err(refused)?;
        raw.declare_queue(queue_name, self.config.queue_options)
            .await
            .map_err(refused)?;
        let consumer_tag = Uuid::new_v4().to_string();
        let deliveries = raw
            .consume(queue_name, &consumer_tag, self.config.auto_ack)
            .await
            .map_err(refused)?;
        Ok((consumer_tag, deliveries))
    }

    /// The background activity of a running subscription.
    async fn drive(
        self: Arc<Self>,
        mut session: Session<C>,
        handlers: Handlers,
        mut stop: oneshot::Receiver<()>,
    ) -> Option<PooledChannel<C>> {
        let mut in_flight = InFlight::new();
        loop {
            let Some(error) = self
                .consume(&mut session, &handlers, &mut stop, &mut in_flight)
                .await
            else {
                return Some(self.wind_down(session, &handlers, &mut in_flight).await);
            };

            if !self.fail(&session.channel, error, &handlers).await {
                // A stop is under way.
                return Some(self.wind_down(session, &handlers, &mut in_flight).await);
            }

            match self.resubscribe(&handlers, &mut stop, &mut in_flight).await {
                Some(fresh) => session = fresh,
                None => {
                    drain(&mut in_flight).await;
                    return None;
                }
            }
        }
    }

    /// Dispatch deliveries until the channel fails (`Some`) or a stop is requested (`None`).
    async fn consume(
        &self,
        session: &mut Session<C>,
        handlers: &Handlers,
        stop: &mut oneshot::Receiver<()>,
        in_flight: &mut InFlight,
    ) -> Option<Error> {
        let period = self.config.check_channel_period;
        let mut health_check = tokio::time::interval_at(Instant::now() + period, period);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Prefer stopping over health checks, and health checks over new deliveries.
                biased;

                _ = &mut *stop => return None,

                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    log_handler_outcome(outcome);
                }

                _ = health_check.tick() => {
                    if !session.channel.is_usable() || !self.connection_service.is_connected() {
                        return Some(Error::ChannelClosed {
                            queue: self.config.queue_name.clone(),
                        });
                    }
                }

                delivery = session.deliveries.next() => match delivery {
                    Some(Ok(delivery)) => {
                        in_flight.push(self.dispatch(delivery, &session.channel, handlers));
                    }
                    Some(Err(e)) => return Some(Error::Channel(e)),
                    None => {
                        return Some(Error::ConsumerCancelled {
                            queue: self.config.queue_name.clone(),
                        })
                    }
                },
            }
        }
    }

    /// Run the message handler as its own task: handlers run concurrently, up to the
    /// prefetch bound, and a panicking handler does not tear the subscription down.
    fn dispatch(
        &self,
        delivery: Delivery,
        channel: &PooledChannel<C>,
        handlers: &Handlers,
    ) -> JoinHandle<()> {
        let envelope = MessageEnvelope::new(
            delivery,
            self.config.queue_name.clone(),
            channel.handle(),
            self.config.auto_ack,
        );
        let handler = Arc::clone(&handlers.on_consumed);
        let guard = InFlightGuard::new(Arc::clone(&self.in_flight));
        tokio::spawn(async move {
            let _guard = guard;
            handler.on_consumed(envelope).await;
        })
    }

    /// `Consuming -> Failed -> Resubscribing`.
    ///
    /// Returns `false`, leaving the state untouched, if a stop has already begun.
    async fn fail(&self, channel: &PooledChannel<C>, error: Error, handlers: &Handlers) -> bool {
        let mut machine = self.machine.lock().await;
        if machine.state != SubscriptionState::Consuming {
            return false;
        }
        self.transition(&mut machine, SubscriptionState::Failed);
        self.report(handlers, error);
        self.connection_service.release_channel(channel).await;
        self.transition(&mut machine, SubscriptionState::Resubscribing);
        true
    }

    /// Try to register the consumer again every `resubscribe_delay`, until it works (`Some`)
    /// or a stop is requested (`None`).
    async fn resubscribe(
        &self,
        handlers: &Handlers,
        stop: &mut oneshot::Receiver<()>,
        in_flight: &mut InFlight,
    ) -> Option<Session<C>> {
        loop {
            let delay = tokio::time::sleep(self.config.resubscribe_delay);
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    biased;

                    _ = &mut *stop => return None,

                    Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                        log_handler_outcome(outcome);
                    }

                    _ = &mut delay => break,
                }
            }

            if self.machine.lock().await.state != SubscriptionState::Resubscribing {
                return None;
            }
            // Broker I/O happens outside the lock: a stop must never wait on the broker.
            let outcome = self.open_session(None).await;
            let mut machine = self.machine.lock().await;
            if machine.state != SubscriptionState::Resubscribing {
                if let Ok(session) = outcome {
                    self.connection_service
                        .release_channel(&session.channel)
                        .await;
                }
                return None;
            }
            match outcome {
                Ok(session) => {
                    self.transition(&mut machine, SubscriptionState::Consuming);
                    return Some(session);
                }
                Err(error) => self.report(handlers, error),
            }
        }
    }

    /// Cancel the consumer, hand back what it had buffered and wait for in-flight handlers.
    async fn wind_down(
        &self,
        mut session: Session<C>,
        handlers: &Handlers,
        in_flight: &mut InFlight,
    ) -> PooledChannel<C> {
        self.cancel_consumer(&session.channel, &session.consumer_tag)
            .await;
        self.settle_buffered(&mut session, handlers, in_flight)
            .await;
        drain(in_flight).await;
        session.channel
    }

    /// Deliveries pushed before the cancellation are still unacked on the channel, which
    /// outlives the stop: requeue them, or dispatch them in auto-ack mode since the broker
    /// has already forgotten about them.
    ///
    /// Reads the delivery stream until it ends or `send_timeout` runs out.
    async fn settle_buffered(
        &self,
        session: &mut Session<C>,
        handlers: &Handlers,
        in_flight: &mut InFlight,
    ) {
        if !session.channel.is_usable() {
            return;
        }
        let deadline = tokio::time::sleep(session.channel.send_timeout());
        tokio::pin!(deadline);
        let mut requeued = 0usize;
        loop {
            let delivery = tokio::select! {
                biased;

                delivery = session.deliveries.next() => delivery,
                _ = &mut deadline => {
                    warn!(
                        queue_name = %self.config.queue_name,
                        "Timed out while waiting for the cancelled consumer to wind down"
                    );
                    break;
                }
            };
            match delivery {
                Some(Ok(delivery)) if self.config.auto_ack => {
                    in_flight.push(self.dispatch(delivery, &session.channel, handlers));
                }
                Some(Ok(delivery)) => {
                    let channel = &session.channel;
                    let requeue = tokio::time::timeout(
                        channel.send_timeout(),
                        channel.raw().nack(delivery.delivery_tag, true),
                    )
                    .await;
                    match requeue {
                        Ok(Ok(())) => requeued += 1,
                        Ok(Err(e)) => warn!(
                            "Failed to requeue delivery {}: {:?}",
                            delivery.delivery_tag, e
                        ),
                        Err(_) => warn!(
                            "Timed out while requeueing delivery {}",
                            delivery.delivery_tag
                        ),
                    }
                }
                Some(Err(_)) | None => break,
            }
        }
        if requeued > 0 {
            info!(
                queue_name = %self.config.queue_name,
                requeued,
                "Requeued deliveries buffered when the consumer was cancelled"
            );
        }
    }

    /// Cancel the broker-side consumer: no more deliveries after this.
    async fn cancel_consumer(&self, channel: &PooledChannel<C>, consumer_tag: &str) {
        if !channel.is_usable() {
            return;
        }
        let cancellation =
            tokio::time::timeout(channel.send_timeout(), channel.raw().cancel(consumer_tag)).await;
        match cancellation {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cancel consumer {}: {:?}", consumer_tag, e),
            Err(_) => warn!("Timed out while cancelling consumer {}", consumer_tag),
        }
    }

    /// Hand `error` to the failure handler, on its own task.
    fn report(&self, handlers: &Handlers, error: Error) {
        warn!(
            queue_name = %self.config.queue_name,
            error = ?error,
            "Subscription failure"
        );
        let handler = Arc::clone(&handlers.on_failure);
        tokio::spawn(async move { handler.on_failure(error).await });
    }
}

async fn drain(in_flight: &mut InFlight) {
    while let Some(outcome) = in_flight.next().await {
        log_handler_outcome(outcome);
    }
}

fn log_handler_outcome(outcome: Result<(), JoinError>) {
    if let Err(e) = outcome {
        error!("A message handler panicked: {}", e);
    }
}

/// Counts a running handler until dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
