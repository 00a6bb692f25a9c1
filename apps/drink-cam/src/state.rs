use std::fmt;

use crate::protocol::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Listening,
    Connecting,
    Streaming,
    Stopped,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Idle => "Not connected",
            ConnectionState::Listening => "Waiting for camera",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Streaming => "Streaming",
            ConnectionState::Stopped => "Stopped",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Listening | ConnectionState::Connecting | ConnectionState::Streaming
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Session lifecycle for one role. Each method returns the new state when it applied,
/// or `None` when the trigger does not apply to the current state or role.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    role: Role,
    state: ConnectionState,
}

impl SessionStateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn enter(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            return None;
        }
        tracing::debug!(
            target = "drink_cam::state",
            role = %self.role,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
        Some(next)
    }

    /// Viewer joined the room and waits for an offer.
    pub fn listening(&mut self) -> Option<ConnectionState> {
        match (self.role, self.state) {
            (Role::Viewer, ConnectionState::Idle | ConnectionState::Stopped) => {
                self.enter(ConnectionState::Listening)
            }
            _ => None,
        }
    }

    /// Camera broadcast its offer.
    pub fn offer_sent(&mut self) -> Option<ConnectionState> {
        match self.role {
            Role::Camera => self.enter(ConnectionState::Connecting),
            Role::Viewer => None,
        }
    }

    /// Viewer accepted an offer, including a re-offer on a live stream.
    pub fn offer_received(&mut self) -> Option<ConnectionState> {
        match (self.role, self.state) {
            (Role::Viewer, state) if state.is_active() => {
                self.enter(ConnectionState::Connecting);
                Some(ConnectionState::Connecting)
            }
            _ => None,
        }
    }

    pub fn peer_connected(&mut self) -> Option<ConnectionState> {
        match self.state {
            ConnectionState::Connecting => self.enter(ConnectionState::Streaming),
            _ => None,
        }
    }

    /// The peer connection was closed by a failed negotiation step. A viewer keeps
    /// waiting in the room for the next offer; a camera needs a new Start.
    pub fn connection_lost(&mut self) -> Option<ConnectionState> {
        if !self.state.is_active() {
            return None;
        }
        match self.role {
            Role::Viewer => self.enter(ConnectionState::Listening),
            Role::Camera => self.enter(ConnectionState::Stopped),
        }
    }

    pub fn stopped(&mut self) -> Option<ConnectionState> {
        self.enter(ConnectionState::Stopped)
    }
}
