//! Connection state machine
//!
//! Pure transition function for the broker link, kept free of sockets so the
//! lifecycle can be tested on its own. The session feeds it events and
//! executes the returned effect.

use serde::{Deserialize, Serialize};

/// Current phase of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state, nothing attempted yet
    Idle,
    /// Handshake in flight (registration and/or socket open + ack pending)
    Connecting,
    /// Broker acknowledged the connect frame
    Connected,
    /// Socket lost or deliberately closed
    Disconnected,
}

/// Lifecycle events fed to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Caller asked for a connection
    ConnectRequested,
    /// Broker rejected the registration payload
    RegistrationFailed,
    /// Broker sent the `connected` acknowledgement
    HandshakeAcked,
    /// Socket open or handshake failed before the ack
    HandshakeFailed,
    /// Established socket closed or errored
    ConnectionLost,
    /// Caller asked for a deliberate close
    DisconnectRequested,
    /// Retry timer fired
    RetryElapsed,
}

/// What the session must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Register if needed, open the socket, send the connect frame
    BeginHandshake,
    /// Start processing work and heartbeat frames
    EnterConnectedLoop,
    /// Surface the failure to the caller; no retry is scheduled
    ReportFailure,
    /// Arm the backoff timer for another attempt
    ScheduleRetry,
    /// Close the socket and cancel any pending retry
    SuppressRetry,
    /// Reject the request: a connect attempt is already active
    RejectAlreadyActive,
    /// Event does not apply in this state
    Ignore,
}

/// Result of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effect: Effect,
}

fn transition(next: ConnectionState, effect: Effect) -> Transition {
    Transition { next, effect }
}

/// Map `(current state, event)` to `(next state, effect)`
pub fn step(current: ConnectionState, event: Event) -> Transition {
    use ConnectionState::*;
    use Event::*;

    match (current, event) {
        (Idle | Disconnected, ConnectRequested) => transition(Connecting, Effect::BeginHandshake),
        (Connecting | Connected, ConnectRequested) => {
            transition(current, Effect::RejectAlreadyActive)
        }

        // Registration failure never schedules a retry; the caller decides.
        (Connecting, RegistrationFailed) => transition(Idle, Effect::ReportFailure),

        (Connecting, HandshakeAcked) => transition(Connected, Effect::EnterConnectedLoop),
        (Connecting, HandshakeFailed) => transition(Disconnected, Effect::ScheduleRetry),

        (Connected, ConnectionLost) => transition(Disconnected, Effect::ScheduleRetry),

        (_, DisconnectRequested) => transition(Disconnected, Effect::SuppressRetry),

        (Disconnected, RetryElapsed) => transition(Connecting, Effect::BeginHandshake),

        (state, _) => transition(state, Effect::Ignore),
    }
}
