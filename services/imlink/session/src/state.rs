//! Table-driven connection state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::StateError;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectState {
    /// No connection
    Disconnected,
    /// Connect in flight
    Connecting,
    /// Connected and usable
    Connected,
    /// Tearing down
    Disconnecting,
}

impl std::fmt::Display for ConnectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectState::Disconnected => "disconnected",
            ConnectState::Connecting => "connecting",
            ConnectState::Connected => "connected",
            ConnectState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectEvent {
    /// Start connecting
    Connect,
    /// Transport connected
    ConnectSuccess,
    /// Transport connect failed
    ConnectFailure,
    /// Established connection broke
    NetworkError,
    /// Orderly disconnect requested
    Disconnect,
    /// Teardown finished
    DisconnectComplete,
    /// Drop to disconnected from anywhere
    ForceDisconnect,
    /// Reconnect attempt after a loss
    Reconnect,
}

/// Callback for accepted transitions: (old, new)
pub type StateChangeHandler = Box<dyn Fn(ConnectState, ConnectState) + Send + Sync>;

/// Callback for rejected events: (state, event)
pub type InvalidTransitionHandler = Box<dyn Fn(ConnectState, ConnectEvent) + Send + Sync>;

/// Connection state machine with an explicit transition table
pub struct ConnectStateMachine {
    state: ConnectState,
    transitions: HashMap<(ConnectState, ConnectEvent), ConnectState>,
    on_change: Option<StateChangeHandler>,
    on_invalid: Option<InvalidTransitionHandler>,
}

impl ConnectStateMachine {
    /// Create a machine in `Disconnected` with the standard table
    pub fn new() -> Self {
        use ConnectEvent::*;
        use ConnectState::*;

        let mut machine = Self {
            state: Disconnected,
            transitions: HashMap::new(),
            on_change: None,
            on_invalid: None,
        };
        machine.add_transition(Disconnected, Connect, Connecting);
        machine.add_transition(Disconnected, Reconnect, Connecting);
        machine.add_transition(Connecting, ConnectSuccess, Connected);
        machine.add_transition(Connecting, ConnectFailure, Disconnected);
        machine.add_transition(Connected, NetworkError, Disconnecting);
        machine.add_transition(Connected, Disconnect, Disconnecting);
        machine.add_transition(Disconnecting, DisconnectComplete, Disconnected);
        for from in [Disconnected, Connecting, Connected, Disconnecting] {
            machine.add_transition(from, ForceDisconnect, Disconnected);
        }
        machine
    }

    /// Register (or replace) a transition
    pub fn add_transition(&mut self, from: ConnectState, event: ConnectEvent, to: ConnectState) {
        self.transitions.insert((from, event), to);
    }

    /// Install the state-change callback
    pub fn set_state_change_handler(&mut self, handler: StateChangeHandler) {
        self.on_change = Some(handler);
    }

    /// Install the invalid-transition callback
    pub fn set_invalid_transition_handler(&mut self, handler: InvalidTransitionHandler) {
        self.on_invalid = Some(handler);
    }

    /// Current state
    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Whether `event` has a transition from the current state
    pub fn can_handle_event(&self, event: ConnectEvent) -> bool {
        self.transitions.contains_key(&(self.state, event))
    }

    /// Every registered transition
    pub fn transitions(&self) -> Vec<(ConnectState, ConnectEvent, ConnectState)> {
        let mut all: Vec<_> = self
            .transitions
            .iter()
            .map(|(&(from, event), &to)| (from, event, to))
            .collect();
        all.sort_by_key(|&(from, event, _)| (from as u8, event as u8));
        all
    }

    /// Apply `event`. Unregistered pairs are reported and leave the state alone.
    pub fn send_event(&mut self, event: ConnectEvent) -> Result<ConnectState, StateError> {
        let Some(&next) = self.transitions.get(&(self.state, event)) else {
            warn!(state = %self.state, ?event, "invalid connection state transition");
            if let Some(handler) = &self.on_invalid {
                handler(self.state, event);
            }
            return Err(StateError::InvalidTransition {
                state: self.state,
                event,
            });
        };

        let old = self.state;
        self.state = next;
        debug!(from = %old, to = %next, ?event, "connection state changed");
        if let Some(handler) = &self.on_change {
            handler(old, next);
        }
        Ok(next)
    }

    /// Set the state directly; recovery paths only
    pub fn force_state(&mut self, state: ConnectState) {
        let old = self.state;
        if old == state {
            return;
        }
        warn!(from = %old, to = %state, "forcing connection state");
        self.state = state;
        if let Some(handler) = &self.on_change {
            handler(old, state);
        }
    }
}

impl Default for ConnectStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectStateMachine")
            .field("state", &self.state)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_standard_lifecycle() {
        let mut sm = ConnectStateMachine::new();
        assert_eq!(sm.send_event(ConnectEvent::Connect), Ok(ConnectState::Connecting));
        assert_eq!(
            sm.send_event(ConnectEvent::ConnectSuccess),
            Ok(ConnectState::Connected)
        );
        assert_eq!(
            sm.send_event(ConnectEvent::NetworkError),
            Ok(ConnectState::Disconnecting)
        );
        assert_eq!(
            sm.send_event(ConnectEvent::DisconnectComplete),
            Ok(ConnectState::Disconnected)
        );
        assert_eq!(sm.send_event(ConnectEvent::Reconnect), Ok(ConnectState::Connecting));
        assert_eq!(
            sm.send_event(ConnectEvent::ConnectFailure),
            Ok(ConnectState::Disconnected)
        );
    }

    #[test]
    fn test_invalid_transition_reported_not_applied() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sm = ConnectStateMachine::new();
        let s = seen.clone();
        sm.set_invalid_transition_handler(Box::new(move |state, event| {
            s.lock().unwrap().push((state, event));
        }));

        let err = sm.send_event(ConnectEvent::ConnectSuccess).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                state: ConnectState::Disconnected,
                event: ConnectEvent::ConnectSuccess
            }
        );
        assert_eq!(sm.state(), ConnectState::Disconnected);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ConnectState::Disconnected, ConnectEvent::ConnectSuccess)]
        );
    }

    #[test]
    fn test_force_disconnect_from_anywhere() {
        let mut sm = ConnectStateMachine::new();
        for setup in [
            vec![],
            vec![ConnectEvent::Connect],
            vec![ConnectEvent::Connect, ConnectEvent::ConnectSuccess],
            vec![
                ConnectEvent::Connect,
                ConnectEvent::ConnectSuccess,
                ConnectEvent::Disconnect,
            ],
        ] {
            sm.force_state(ConnectState::Disconnected);
            for event in setup {
                sm.send_event(event).unwrap();
            }
            assert!(sm.can_handle_event(ConnectEvent::ForceDisconnect));
            assert_eq!(
                sm.send_event(ConnectEvent::ForceDisconnect),
                Ok(ConnectState::Disconnected)
            );
        }
    }

    #[test]
    fn test_change_handler_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sm = ConnectStateMachine::new();
        let s = seen.clone();
        sm.set_state_change_handler(Box::new(move |old, new| {
            s.lock().unwrap().push((old, new));
        }));

        sm.send_event(ConnectEvent::Connect).unwrap();
        sm.force_state(ConnectState::Connected);
        sm.force_state(ConnectState::Connected);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ConnectState::Disconnected, ConnectState::Connecting),
                (ConnectState::Connecting, ConnectState::Connected),
            ]
        );
    }

    #[test]
    fn test_transition_listing() {
        let sm = ConnectStateMachine::new();
        let all = sm.transitions();
        assert_eq!(all.len(), 11);
        assert!(all.contains(&(
            ConnectState::Connected,
            ConnectEvent::Disconnect,
            ConnectState::Disconnecting
        )));
    }
}
