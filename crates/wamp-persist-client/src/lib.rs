//! Persistent WAMP client
//!
//! Lets callers issue calls and subscriptions before the session is up.
//! Requests made while disconnected are queued and released in order once
//! the connection opens, and subscriptions are replayed on every reconnect.

pub mod config;
pub mod error;
pub mod link;
pub mod persist;
pub mod session;

pub use config::ClientConfig;
pub use error::{PersistError, Result};
pub use persist::{ConnectionSource, ConnectionState, PersistentSession, SubscriptionId};
pub use session::{
    Connection, ConnectionListener, Event, EventHandler, Options, Session, SubscriptionHandle,
    TransportError,
};
