use tokio::sync::oneshot;

use crate::persist::SubscriptionId;
use crate::session::TransportError;

pub type Result<T, E = PersistError> = std::result::Result<T, E>;

/// Errors surfaced by [`crate::PersistentSession`] operations.
///
/// No timeout is ever produced: queued work waits until the connection
/// opens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscription {0} is not registered")]
    NotFound(SubscriptionId),

    #[error("pending queue is full ({0} operations waiting)")]
    QueueFull(usize),

    #[error("client dropped before the operation was issued")]
    Abandoned,
}

impl From<oneshot::error::RecvError> for PersistError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::Abandoned
    }
}
