//! Collaborator contract of the session provider.
//!
//! The façade never talks to a transport directly. It hands a
//! [`ConnectionListener`] to [`Connection::open`] and receives live
//! [`Session`]s through it.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subscription options, forwarded untouched to the provider
pub type Options = Map<String, Value>;

/// Callback invoked for every event delivered on a subscription
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// An event published on a subscribed topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Provider-side identifier of an established subscription.
///
/// Only meaningful on the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

/// Failures reported by the session provider.
///
/// The façade never translates these; they reach the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session closed")]
    Closed,

    #[error("{uri}: {message}")]
    Remote { uri: String, message: String },

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// A live session, valid from an open event until the next close event.
///
/// Implementations must put the request on the wire when the method is
/// invoked, not when the returned future is first polled. The façade relies
/// on this to keep queued operations in order.
pub trait Session: Send + Sync {
    fn call(
        &self,
        target: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, TransportError>>;

    fn subscribe(
        &self,
        target: &str,
        handler: EventHandler,
        options: Options,
    ) -> BoxFuture<'static, Result<SubscriptionHandle, TransportError>>;

    fn unsubscribe(
        &self,
        handle: SubscriptionHandle,
    ) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Lifecycle observer owned by the state machine.
///
/// Providers call it serially and never re-entrantly.
pub trait ConnectionListener: Send + Sync {
    /// A handshake completed; `session` replaces any previous one
    fn on_open(&self, session: Arc<dyn Session>);

    /// The current session is gone
    fn on_close(&self);
}

/// A connection handle driving open/close cycles.
pub trait Connection: Send + Sync {
    /// Start the transport handshake. Fire-and-forget: the outcome arrives
    /// through `listener`, possibly several times if the provider reconnects.
    fn open(&self, listener: Arc<dyn ConnectionListener>);
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn open(&self, listener: Arc<dyn ConnectionListener>) {
        (**self).open(listener);
    }
}
