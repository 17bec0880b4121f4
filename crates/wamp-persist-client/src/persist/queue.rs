use std::collections::VecDeque;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use super::registry::SubscriptionId;
use crate::error::{PersistError, Result};
use crate::session::TransportError;

/// A session call already on the wire, waiting for its result
pub(crate) type InFlightCall = BoxFuture<'static, Result<Value, TransportError>>;

/// An operation requested while no session was live.
///
/// Each variant owns everything needed to issue it later plus the sending
/// half of the future its caller already holds.
pub(crate) enum PendingOperation {
    /// Ready signal carries the in-flight call so the caller awaits the real result
    Call {
        target: String,
        args: Vec<Value>,
        ready: oneshot::Sender<InFlightCall>,
    },
    /// Topic, handler and options live in the registry record
    Subscribe {
        sub_id: SubscriptionId,
        reply: oneshot::Sender<Result<SubscriptionId>>,
    },
    Unsubscribe {
        sub_id: SubscriptionId,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PendingOperation {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Call { target, .. } => format!("call {target}"),
            Self::Subscribe { sub_id, .. } => format!("subscribe {sub_id}"),
            Self::Unsubscribe { sub_id, .. } => format!("unsubscribe {sub_id}"),
        }
    }
}

/// FIFO of operations waiting for the next open event
#[derive(Default)]
pub(crate) struct PendingQueue {
    operations: VecDeque<PendingOperation>,
    /// None means unbounded
    capacity: Option<usize>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Appends to the tail. A full bounded queue rejects the operation, which
    /// drops it together with its reply channel.
    pub(crate) fn enqueue(&mut self, operation: PendingOperation) -> Result<()> {
        if let Some(capacity) = self.capacity {
            if self.operations.len() >= capacity {
                log::warn!(
                    "Pending queue full, rejecting {}",
                    operation.describe()
                );
                return Err(PersistError::QueueFull(self.operations.len()));
            }
        }

        log::debug!("Queued {} until the session opens", operation.describe());
        self.operations.push_back(operation);
        Ok(())
    }

    /// Removes every queued operation, oldest first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PendingOperation> + '_ {
        self.operations.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(target: &str) -> (PendingOperation, oneshot::Receiver<InFlightCall>) {
        let (ready, ready_rx) = oneshot::channel();
        let operation = PendingOperation::Call {
            target: target.to_owned(),
            args: vec![],
            ready,
        };
        (operation, ready_rx)
    }

    #[test]
    fn test_drain_is_fifo() {
        let mut queue = PendingQueue::new();
        let mut receivers = Vec::new();
        for target in ["a", "b", "c"] {
            let (operation, rx) = call(target);
            queue.enqueue(operation).expect("unbounded queue accepts");
            receivers.push(rx);
        }
        assert_eq!(queue.len(), 3);

        let drained: Vec<String> = queue
            .drain()
            .map(|operation| match operation {
                PendingOperation::Call { target, .. } => target,
                other => panic!("unexpected {}", other.describe()),
            })
            .collect();

        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_queue_rejects_overflow() {
        let mut queue = PendingQueue::new();
        queue.set_capacity(Some(1));
        let (first, _first_rx) = call("first");
        let (second, mut second_rx) = call("second");

        queue.enqueue(first).expect("room for one");
        let err = queue.enqueue(second).expect_err("queue is full");
        assert_eq!(err, PersistError::QueueFull(1));

        // the rejected operation's reply channel is gone
        assert!(second_rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_identical_targets_are_not_coalesced() {
        let mut queue = PendingQueue::new();
        let (a, _a_rx) = call("same");
        let (b, _b_rx) = call("same");
        queue.enqueue(a).expect("enqueue");
        queue.enqueue(b).expect("enqueue");
        assert_eq!(queue.drain().count(), 2);
    }
}
