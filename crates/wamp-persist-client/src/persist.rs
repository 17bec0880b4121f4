//! Persistent session façade
//!
//! Holds the connection state machine, the queue of operations waiting for
//! a live session and the registry that replays subscriptions on reconnect.

pub mod client;
pub mod queue;
pub mod registry;
pub mod state;

#[cfg(test)]
mod testing;

pub use client::{ConnectionSource, OperationFuture, PersistentSession};
pub use registry::{SubscriptionId, SubscriptionRecord};
pub use state::ConnectionState;
