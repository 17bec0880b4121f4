use std::sync::Arc;

use strum_macros::Display;
use tokio::sync::watch;

use crate::session::Session;

/// Observable connection state.
///
/// `Idle` until the first `connect()`, then `Opening` until the first open
/// event. Later close events land in `Disconnected`, never back in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Idle,
    Opening,
    Connected,
    Disconnected,
}

/// Tracks the `open`/`connected` flags and the live session.
pub(crate) struct StateMachine {
    open: bool,
    session: Option<Arc<dyn Session>>,
    /// Bumped on every open event, identifies the live session
    generation: u64,
    state_sender: watch::Sender<ConnectionState>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (state_sender, _) = watch::channel(ConnectionState::Idle);

        Self {
            open: false,
            session: None,
            generation: 0,
            state_sender,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match (self.open, &self.session) {
            (_, Some(_)) => ConnectionState::Connected,
            (false, None) => ConnectionState::Idle,
            (true, None) if self.generation == 0 => ConnectionState::Opening,
            (true, None) => ConnectionState::Disconnected,
        }
    }

    /// Returns `true` when the caller must ask the connection to open.
    pub(crate) fn begin_open(&mut self) -> bool {
        if self.open {
            return false;
        }
        self.open = true;
        self.publish();
        true
    }

    /// Stores the new session and returns its generation.
    ///
    /// Publication is left to the caller so observers only see `Connected`
    /// once queued work has been released.
    pub(crate) fn opened(&mut self, session: Arc<dyn Session>) -> u64 {
        self.open = true;
        self.session = Some(session);
        self.generation += 1;
        self.generation
    }

    /// Drops the live session. Returns whether one was present.
    pub(crate) fn closed(&mut self) -> bool {
        let was_connected = self.session.take().is_some();
        self.publish();
        was_connected
    }

    pub(crate) fn live_session(&self) -> Option<(Arc<dyn Session>, u64)> {
        self.session
            .as_ref()
            .map(|session| (Arc::clone(session), self.generation))
    }

    pub(crate) fn subscribe_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_sender.subscribe()
    }

    pub(crate) fn publish(&self) {
        let state = self.state();
        let previous = self.state_sender.send_replace(state);
        if previous != state {
            log::debug!("Connection state {previous} -> {state}");
        }
    }
}
