use crate::events::{EventEmitter, Subscription};
use newme_realtime_types::ConnectionState;
use tracing::{debug, info};

/// The caller-facing connection state of a coordinator.
///
/// Only transitions accepted by [`ConnectionState::can_transition_to`] are
/// applied; observers run after the lock is released.
#[derive(Default)]
pub struct SessionStateMachine {
    state: parking_lot::Mutex<ConnectionState>,
    changes: EventEmitter<ConnectionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns whether the state changed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let current = *state;
            if !current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Rejected session state change");
                return false;
            }
            *state = next;
            current
        };
        info!(from = %previous, to = %next, "Session state changed");
        self.changes.emit(&next);
        true
    }

    pub fn on_change<F>(&self, observer: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.changes.subscribe(move |state| observer(*state))
    }
}
