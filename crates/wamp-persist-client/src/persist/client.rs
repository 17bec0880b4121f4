use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt as _, TryFutureExt as _};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use super::queue::{PendingOperation, PendingQueue};
use super::registry::{
    IssuedSubscription, SubscriptionId, SubscriptionRecord, SubscriptionRegistry,
};
use super::state::{ConnectionState, StateMachine};
use crate::config::ClientConfig;
use crate::error::{PersistError, Result};
use crate::link::RouterConnection;
use crate::session::{
    Connection, ConnectionListener, EventHandler, Options, Session, SubscriptionHandle,
    TransportError,
};

/// Future handed back by every façade operation
pub type OperationFuture<T> = BoxFuture<'static, Result<T>>;

type SubscribeReply = oneshot::Sender<Result<SubscriptionId>>;

/// Where the façade gets its connection from
pub enum ConnectionSource {
    /// Build a router link from the configuration
    Config(ClientConfig),
    /// Use a ready-made connection
    Connection(Box<dyn Connection>),
}

impl From<ClientConfig> for ConnectionSource {
    fn from(config: ClientConfig) -> Self {
        Self::Config(config)
    }
}

impl From<Box<dyn Connection>> for ConnectionSource {
    fn from(connection: Box<dyn Connection>) -> Self {
        Self::Connection(connection)
    }
}

/// Persistent session
///
/// Accepts calls and subscriptions at any time. Without a live session they
/// wait in a FIFO queue released on the next open event; subscriptions are
/// replayed against every new session under their original id.
///
/// Must be used from within a Tokio runtime.
pub struct PersistentSession {
    connection: Box<dyn Connection>,
    core: Arc<Core>,
}

struct Inner {
    machine: StateMachine,
    queue: PendingQueue,
    registry: SubscriptionRegistry,
}

struct Core {
    inner: Mutex<Inner>,
}

/// Listener handed to the connection on `connect()`
struct Lifecycle {
    core: Arc<Core>,
}

/// A subscription request already sent, waiting for the session's answer
struct Confirmation {
    sub_id: SubscriptionId,
    ticket: u64,
    topic: String,
    pending: BoxFuture<'static, Result<SubscriptionHandle, TransportError>>,
    /// None for replays nobody is waiting on
    reply: Option<SubscribeReply>,
}

impl PersistentSession {
    pub fn new(source: impl Into<ConnectionSource>) -> Self {
        match source.into() {
            ConnectionSource::Connection(connection) => Self::from_parts(connection, None),
            ConnectionSource::Config(config) => {
                log::debug!("Using router link to {}", config.url);
                let max_pending = config.max_pending;
                Self::from_parts(Box::new(RouterConnection::new(config)), max_pending)
            }
        }
    }

    pub fn with_connection(connection: impl Connection + 'static) -> Self {
        Self::new(ConnectionSource::Connection(Box::new(connection)))
    }

    fn from_parts(connection: Box<dyn Connection>, max_pending: Option<usize>) -> Self {
        let mut queue = PendingQueue::new();
        queue.set_capacity(max_pending);

        Self {
            connection,
            core: Arc::new(Core {
                inner: Mutex::new(Inner {
                    machine: StateMachine::new(),
                    queue,
                    registry: SubscriptionRegistry::new(),
                }),
            }),
        }
    }

    /// Bound the number of operations waiting for a session
    pub fn max_pending(self, capacity: usize) -> Self {
        self.core.inner.lock().queue.set_capacity(Some(capacity));
        self
    }

    pub fn is_open(&self) -> bool {
        self.core.inner.lock().machine.is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.core.inner.lock().machine.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.inner.lock().machine.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.core.inner.lock().machine.subscribe_changes()
    }

    /// Resolves once the session is connected, immediately if it already is.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut changes = self.state_changes();
        if changes
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .is_err()
        {
            return Err(PersistError::Abandoned);
        }
        Ok(())
    }

    /// Number of operations waiting for the next open event
    pub fn pending_operations(&self) -> usize {
        self.core.inner.lock().queue.len()
    }

    /// Ids of every subscription kept for replay
    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        self.core.inner.lock().registry.ids()
    }

    /// Ask the connection to open. Only the first call has any effect.
    pub fn connect(&self) {
        let should_open = self.core.inner.lock().machine.begin_open();
        if should_open {
            log::info!("Opening connection");
            self.connection.open(Arc::new(Lifecycle {
                core: Arc::clone(&self.core),
            }));
        }
    }

    /// Call `target` with `args`, now or once the session opens.
    pub fn rpc(&self, target: impl Into<String>, args: Vec<Value>) -> OperationFuture<Value> {
        self.connect();
        let target = target.into();

        let mut inner = self.core.inner.lock();
        let live = inner.machine.live_session();
        if let Some((session, _)) = live {
            drop(inner);
            return session.call(&target, args).map_err(PersistError::from).boxed();
        }

        let (ready, ready_rx) = oneshot::channel();
        let queued = inner
            .queue
            .enqueue(PendingOperation::Call { target, args, ready });
        drop(inner);

        if let Err(e) = queued {
            return future::ready(Err(e)).boxed();
        }

        async move {
            let in_flight = ready_rx.await?;
            Ok(in_flight.await?)
        }
        .boxed()
    }

    /// Subscribe `handler` to `target`.
    ///
    /// Resolves with `sub_id`, or a freshly generated id when `None`. Reusing
    /// a registered id replaces that subscription.
    pub fn subscribe(
        &self,
        target: impl Into<String>,
        handler: EventHandler,
        options: Options,
        sub_id: Option<SubscriptionId>,
    ) -> OperationFuture<SubscriptionId> {
        self.connect();
        let sub_id = sub_id.unwrap_or_else(SubscriptionId::generate);
        let record = SubscriptionRecord::new(target, handler, options);
        let (reply, reply_rx) = oneshot::channel();

        let mut inner = self.core.inner.lock();
        let live = inner.machine.live_session();
        match live {
            Some((session, generation)) => {
                let replaced = inner.registry.insert(sub_id.clone(), record);
                let issued = inner.registry.issue(&sub_id, generation);
                drop(inner);

                if let Some(handle) = replaced.and_then(|old| old.live_handle(generation)) {
                    log::debug!("Subscription {sub_id} replaced, releasing {handle:?}");
                    release(&session, handle);
                }
                if let Some(issued) = issued {
                    let confirmation = issue_subscription(&session, issued, Some(reply));
                    self.core.spawn_confirmation(session, confirmation);
                }
            }
            None => {
                let queued = inner.queue.enqueue(PendingOperation::Subscribe {
                    sub_id: sub_id.clone(),
                    reply,
                });
                if let Err(e) = queued {
                    return future::ready(Err(e)).boxed();
                }
                inner.registry.insert(sub_id, record);
            }
        }

        async move { reply_rx.await? }.boxed()
    }

    /// Drop the subscription registered under `sub_id`.
    ///
    /// Unknown ids fail with [`PersistError::NotFound`].
    pub fn unsubscribe(&self, sub_id: &SubscriptionId) -> OperationFuture<()> {
        self.connect();

        let mut inner = self.core.inner.lock();
        let live = inner.machine.live_session();
        let Some(record) = inner.registry.get(sub_id) else {
            return future::ready(Err(PersistError::NotFound(sub_id.clone()))).boxed();
        };

        match live {
            Some((session, generation)) => match record.live_handle(generation) {
                Some(handle) => {
                    drop(inner);
                    let pending = session.unsubscribe(handle);
                    let (reply, reply_rx) = oneshot::channel();
                    let core = Arc::clone(&self.core);
                    let sub_id = sub_id.clone();

                    tokio::spawn(async move {
                        let result = pending.await.map_err(PersistError::from);
                        let removed = result.is_ok()
                            && core.inner.lock().registry.remove_if_handle(&sub_id, handle);
                        if removed {
                            log::debug!("Unsubscribed {sub_id}");
                        }
                        if reply.send(result).is_err() {
                            log::debug!("Unsubscribe caller for {sub_id} went away");
                        }
                    });

                    async move { reply_rx.await? }.boxed()
                }
                None => {
                    // the in-flight confirmation releases the handle once it lands
                    inner.registry.remove(sub_id);
                    log::debug!("Unsubscribed {sub_id} before its confirmation");
                    future::ready(Ok(())).boxed()
                }
            },
            None => {
                let (reply, reply_rx) = oneshot::channel();
                let queued = inner.queue.enqueue(PendingOperation::Unsubscribe {
                    sub_id: sub_id.clone(),
                    reply,
                });
                if queued.is_ok() {
                    // operations queued after this one must not see the record
                    inner.registry.remove(sub_id);
                }
                drop(inner);

                match queued {
                    Ok(()) => async move { reply_rx.await? }.boxed(),
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            }
        }
    }
}

impl Core {
    fn handle_open(self: &Arc<Self>, session: Arc<dyn Session>) {
        let mut inner = self.inner.lock();
        let generation = inner.machine.opened(Arc::clone(&session));
        let queued: Vec<PendingOperation> = inner.queue.drain().collect();
        log::info!(
            "Session opened (generation {generation}), releasing {} queued operations",
            queued.len()
        );

        let mut confirmations = Vec::new();
        for operation in queued {
            match operation {
                PendingOperation::Call { target, args, ready } => {
                    let in_flight = session.call(&target, args);
                    if ready.send(in_flight).is_err() {
                        log::debug!("Caller of queued {target} went away, result discarded");
                    }
                }
                PendingOperation::Subscribe { sub_id, reply } => {
                    match inner.registry.issue(&sub_id, generation) {
                        Some(issued) => {
                            confirmations.push(issue_subscription(&session, issued, Some(reply)));
                        }
                        None => {
                            log::debug!("Subscription {sub_id} withdrawn before it was sent");
                            if reply.send(Ok(sub_id)).is_err() {
                                log::debug!("Queued subscribe caller went away");
                            }
                        }
                    }
                }
                PendingOperation::Unsubscribe { sub_id, reply } => {
                    // record left the registry when queued; server-side state
                    // died with the previous session
                    log::debug!("Unsubscribed {sub_id} while disconnected");
                    if reply.send(Ok(())).is_err() {
                        log::debug!("Queued unsubscribe caller for {sub_id} went away");
                    }
                }
            }
        }

        let replays = inner.registry.replay(generation);
        if !replays.is_empty() {
            log::info!("Replaying {} subscriptions", replays.len());
        }
        for issued in replays {
            confirmations.push(issue_subscription(&session, issued, None));
        }

        inner.machine.publish();
        drop(inner);

        for confirmation in confirmations {
            self.spawn_confirmation(Arc::clone(&session), confirmation);
        }
    }

    fn handle_close(&self) {
        let mut inner = self.inner.lock();
        if inner.machine.closed() {
            log::warn!(
                "Session closed, keeping {} subscriptions for replay",
                inner.registry.len()
            );
            if !inner.queue.is_empty() {
                log::debug!("{} operations still waiting", inner.queue.len());
            }
        } else {
            log::debug!("Close event without a live session");
        }
    }

    fn spawn_confirmation(self: &Arc<Self>, session: Arc<dyn Session>, confirmation: Confirmation) {
        let core = Arc::clone(self);

        tokio::spawn(async move {
            let Confirmation {
                sub_id,
                ticket,
                topic,
                pending,
                reply,
            } = confirmation;

            let outcome = pending.await;
            let result =
                core.settle_subscription(&session, &sub_id, ticket, outcome, reply.is_some());

            match reply {
                Some(reply) => {
                    if reply.send(result).is_err() {
                        log::debug!("Subscribe caller for {sub_id} went away");
                    }
                }
                None => match result {
                    Ok(_) => log::debug!("Replayed {sub_id} on {topic}"),
                    Err(e) => log::warn!("Replaying {sub_id} on {topic} failed: {e}"),
                },
            }
        });
    }

    /// A failed replay keeps its record for the next reconnect; a failed
    /// caller request does not.
    fn settle_subscription(
        &self,
        session: &Arc<dyn Session>,
        sub_id: &SubscriptionId,
        ticket: u64,
        outcome: Result<SubscriptionHandle, TransportError>,
        caller_waiting: bool,
    ) -> Result<SubscriptionId> {
        match outcome {
            Ok(handle) => {
                let kept = self.inner.lock().registry.confirm(sub_id, ticket, handle);
                if !kept {
                    log::debug!(
                        "Subscription {sub_id} withdrawn while confirming, releasing {handle:?}"
                    );
                    release(session, handle);
                }
                Ok(sub_id.clone())
            }
            Err(e) => {
                if caller_waiting {
                    self.inner.lock().registry.discard(sub_id, ticket);
                }
                Err(e.into())
            }
        }
    }
}

impl ConnectionListener for Lifecycle {
    fn on_open(&self, session: Arc<dyn Session>) {
        self.core.handle_open(session);
    }

    fn on_close(&self) {
        self.core.handle_close();
    }
}

fn issue_subscription(
    session: &Arc<dyn Session>,
    issued: IssuedSubscription,
    reply: Option<SubscribeReply>,
) -> Confirmation {
    let IssuedSubscription {
        sub_id,
        ticket,
        topic,
        handler,
        options,
    } = issued;

    log::debug!("Subscribing {sub_id} to {topic}");
    let pending = session.subscribe(&topic, handler, options);

    Confirmation {
        sub_id,
        ticket,
        topic,
        pending,
        reply,
    }
}

/// Unsubscribe a handle nobody tracks any more
fn release(session: &Arc<dyn Session>, handle: SubscriptionHandle) {
    let pending = session.unsubscribe(handle);
    tokio::spawn(async move {
        if let Err(e) = pending.await {
            log::debug!("Releasing {handle:?} failed: {e}");
        }
    });
}
