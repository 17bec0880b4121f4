//! Router link
//!
//! A session provider speaking length-prefixed JSON envelopes to a router
//! over TCP or a Unix socket, reconnecting with exponential backoff.

pub mod codec;
pub mod connection;
pub mod envelope;
pub mod protocol;
pub mod reconnect;

pub use codec::{CodecError, FrameBuffer, LinkCodec};
pub use connection::{Endpoint, RouterConnection, RouterSession};
pub use envelope::{Envelope, MessageKind};
pub use reconnect::{ReconnectConfig, ReconnectManager};
