//! Scripted collaborators for façade tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::FutureExt as _;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::session::{
    Connection, ConnectionListener, EventHandler, Options, Session, SubscriptionHandle,
    TransportError,
};

type SubscribeGate = oneshot::Receiver<Result<SubscriptionHandle, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    Call(String, Vec<Value>),
    Subscribe(String, Options),
    Unsubscribe(SubscriptionHandle),
}

/// Session recording every request at invocation time.
///
/// Calls echo `{target, args}` unless a call error is set. Subscriptions get
/// sequential handles unless a gate was armed for them.
#[derive(Default)]
pub(crate) struct StubSession {
    recorded: Mutex<Vec<Recorded>>,
    next_handle: AtomicU64,
    call_error: Mutex<Option<TransportError>>,
    /// Handlers in the order their subscriptions were requested
    handlers: Mutex<Vec<EventHandler>>,
    subscribe_gates: Mutex<VecDeque<SubscribeGate>>,
}

impl StubSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_calls(error: TransportError) -> Arc<Self> {
        let session = Self::default();
        *session.call_error.lock() = Some(error);
        Arc::new(session)
    }

    /// The next `subscribe` resolves with whatever is sent on the returned channel.
    pub(crate) fn gate_next_subscribe(
        &self,
    ) -> oneshot::Sender<Result<SubscriptionHandle, TransportError>> {
        let (sender, receiver) = oneshot::channel();
        self.subscribe_gates.lock().push_back(receiver);
        sender
    }

    pub(crate) fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().clone()
    }

    pub(crate) fn handlers(&self) -> Vec<EventHandler> {
        self.handlers.lock().clone()
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.recorded()
            .into_iter()
            .filter_map(|recorded| match recorded {
                Recorded::Call(target, args) => Some((target, args)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn subscribes(&self) -> Vec<(String, Options)> {
        self.recorded()
            .into_iter()
            .filter_map(|recorded| match recorded {
                Recorded::Subscribe(topic, options) => Some((topic, options)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn unsubscribes(&self) -> Vec<SubscriptionHandle> {
        self.recorded()
            .into_iter()
            .filter_map(|recorded| match recorded {
                Recorded::Unsubscribe(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }
}

impl Session for StubSession {
    fn call(
        &self,
        target: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, TransportError>> {
        self.recorded
            .lock()
            .push(Recorded::Call(target.to_owned(), args.clone()));

        let result = match self.call_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(json!({ "target": target, "args": args })),
        };
        future::ready(result).boxed()
    }

    fn subscribe(
        &self,
        target: &str,
        handler: EventHandler,
        options: Options,
    ) -> BoxFuture<'static, Result<SubscriptionHandle, TransportError>> {
        self.handlers.lock().push(handler);
        self.recorded
            .lock()
            .push(Recorded::Subscribe(target.to_owned(), options));

        match self.subscribe_gates.lock().pop_front() {
            Some(gate) => async move { gate.await.unwrap_or(Err(TransportError::Closed)) }.boxed(),
            None => {
                let handle =
                    SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
                future::ready(Ok(handle)).boxed()
            }
        }
    }

    fn unsubscribe(
        &self,
        handle: SubscriptionHandle,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.recorded.lock().push(Recorded::Unsubscribe(handle));
        future::ready(Ok(())).boxed()
    }
}

/// Connection whose lifecycle events are fired by the test
#[derive(Default)]
pub(crate) struct StubConnection {
    opens: AtomicUsize,
    listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
}

impl StubConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn listener(&self) -> Arc<dyn ConnectionListener> {
        self.listener
            .lock()
            .clone()
            .expect("connection was never opened")
    }

    pub(crate) fn fire_open(&self, session: Arc<dyn Session>) {
        self.listener().on_open(session);
    }

    pub(crate) fn fire_close(&self) {
        self.listener().on_close();
    }
}

impl Connection for StubConnection {
    fn open(&self, listener: Arc<dyn ConnectionListener>) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock() = Some(listener);
    }
}

/// Connection that never opens and keeps nothing alive
pub(crate) struct NullConnection;

impl Connection for NullConnection {
    fn open(&self, _listener: Arc<dyn ConnectionListener>) {}
}

/// Lets spawned confirmation tasks run to completion.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
