//! Call session state machine
//!
//! A [`CallSession`] tracks the lifecycle of one call:
//!
//! ```text
//!            ┌──────────┐            ┌──────────────┐
//!   Idle ───►│ Incoming │            │ OutgoingInit │◄─── Idle
//!            └────┬─────┘            └──────┬───────┘
//!                 │        Connected        │
//!                 └──────────►●◄────────────┘
//!                             │
//!                           Ended ───► Released (terminal)
//! ```
//!
//! `Incoming`/`OutgoingInit` may also go straight to `Ended` (early
//! termination), and any non-terminal state may go straight to `Released`
//! (abnormal teardown). `Released` is never left.
//!
//! Every operation returns a [`Transition`] holding the events to emit. An
//! operation requested from the wrong state is a protocol ordering
//! violation: the violation is recorded as the call's error and the call is
//! forced to `Released`, so the transition carries an `Error` event followed
//! by a `Released` event together with the violation itself.
//!
//! ```rust
//! use rvoip_call_core::call::{CallSession, CallState, RemoteParty};
//!
//! let mut call = CallSession::new("call-1".into());
//! assert!(call.on_incoming(RemoteParty::new("sip:alice@example.com")).is_ok());
//! assert!(call.on_connected().is_ok());
//! assert_eq!(call.state(), CallState::Connected);
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallCoreError, CallCoreResult};
use crate::events::CallEvent;

/// Opaque call identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Generate a fresh random call id
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Incoming,
    OutgoingInit,
    Connected,
    Ended,
    Released,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Released)
    }

    /// A call that has started and not yet been released
    pub fn is_live(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Released)
    }

    /// Whether `next` is directly reachable from this state
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, Incoming) | (Idle, OutgoingInit) => true,
            (Incoming, Connected) | (OutgoingInit, Connected) => true,
            (Incoming, Ended) | (OutgoingInit, Ended) | (Connected, Ended) => true,
            // Ended -> Released is the normal path, the rest is abnormal teardown
            (Released, _) => false,
            (_, Released) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "Idle",
            CallState::Incoming => "Incoming",
            CallState::OutgoingInit => "OutgoingInit",
            CallState::Connected => "Connected",
            CallState::Ended => "Ended",
            CallState::Released => "Released",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// The other end of a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParty {
    /// SIP URI of the remote party (e.g., "sip:alice@example.com")
    pub uri: String,
    pub display_name: Option<String>,
    /// Whether the remote side offered video
    pub video: bool,
}

impl RemoteParty {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            display_name: None,
            video: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }
}

/// Why a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorReason {
    Busy,
    IoError,
    NotAcceptable,
    NotFound,
    Forbidden,
    Declined,
    OrderingViolation,
    Unknown,
}

impl ErrorReason {
    /// User-facing description of the reason
    pub fn message(&self) -> &'static str {
        match self {
            ErrorReason::Busy => "User is busy",
            ErrorReason::IoError => "Network I/O error",
            ErrorReason::NotAcceptable => "Incompatible media parameters",
            ErrorReason::NotFound => "User not found",
            ErrorReason::Forbidden => "Forbidden",
            ErrorReason::Declined => "Call declined",
            ErrorReason::OrderingViolation => "Protocol ordering violation",
            ErrorReason::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Error recorded on a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub reason: ErrorReason,
    pub message: String,
}

impl CallFailure {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<ErrorReason> for CallFailure {
    fn from(reason: ErrorReason) -> Self {
        Self::new(reason, reason.message())
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A request to move a call through its lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum CallOperation {
    Incoming(RemoteParty),
    OutgoingInit(RemoteParty),
    Connected,
    End,
    Released,
    Error(CallFailure),
}

impl CallOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CallOperation::Incoming(_) => "on_incoming",
            CallOperation::OutgoingInit(_) => "on_outgoing_init",
            CallOperation::Connected => "on_connected",
            CallOperation::End => "on_end",
            CallOperation::Released => "on_released",
            CallOperation::Error(_) => "on_error",
        }
    }
}

/// Outcome of one call operation: the events to emit and, when the
/// operation was out of order, the violation
#[derive(Debug, Clone)]
#[must_use]
pub struct Transition {
    events: Vec<CallEvent>,
    violation: Option<CallCoreError>,
}

impl Transition {
    fn accepted(event: CallEvent) -> Self {
        Self {
            events: vec![event],
            violation: None,
        }
    }

    fn rejected(events: Vec<CallEvent>, violation: CallCoreError) -> Self {
        Self {
            events,
            violation: Some(violation),
        }
    }

    pub fn events(&self) -> &[CallEvent] {
        &self.events
    }

    pub fn is_ok(&self) -> bool {
        self.violation.is_none()
    }

    pub fn violation(&self) -> Option<&CallCoreError> {
        self.violation.as_ref()
    }

    /// Whether this transition moved the call into `Released`
    pub fn released(&self) -> bool {
        self.events.iter().any(|e| matches!(e, CallEvent::Released(_)))
    }

    pub fn into_parts(self) -> (Vec<CallEvent>, Option<CallCoreError>) {
        (self.events, self.violation)
    }

    pub fn into_result(self) -> CallCoreResult<Vec<CallEvent>> {
        match self.violation {
            Some(err) => Err(err),
            None => Ok(self.events),
        }
    }
}

/// State of a single call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    state: CallState,
    pub direction: Option<CallDirection>,
    pub remote: RemoteParty,
    error: Option<CallFailure>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            state: CallState::Idle,
            direction: None,
            remote: RemoteParty::default(),
            error: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn error(&self) -> Option<&CallFailure> {
        self.error.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn on_incoming(&mut self, remote: RemoteParty) -> Transition {
        self.apply(CallOperation::Incoming(remote))
    }

    pub fn on_outgoing_init(&mut self, remote: RemoteParty) -> Transition {
        self.apply(CallOperation::OutgoingInit(remote))
    }

    pub fn on_connected(&mut self) -> Transition {
        self.apply(CallOperation::Connected)
    }

    pub fn on_end(&mut self) -> Transition {
        self.apply(CallOperation::End)
    }

    pub fn on_released(&mut self) -> Transition {
        self.apply(CallOperation::Released)
    }

    pub fn on_error(&mut self, failure: CallFailure) -> Transition {
        self.apply(CallOperation::Error(failure))
    }

    /// Apply one operation to the call
    pub fn apply(&mut self, op: CallOperation) -> Transition {
        let operation = op.name();
        match op {
            CallOperation::Error(failure) => {
                if self.state.is_terminal() {
                    return self.reject(operation);
                }
                tracing::debug!(call_id = %self.call_id, state = %self.state, error = %failure, "Call error recorded");
                self.error = Some(failure.clone());
                Transition::accepted(CallEvent::Error {
                    call: self.clone(),
                    failure,
                })
            }
            CallOperation::Incoming(remote) => {
                if self.state != CallState::Idle {
                    return self.reject(operation);
                }
                self.remote = remote;
                self.direction = Some(CallDirection::Incoming);
                self.enter(CallState::Incoming);
                Transition::accepted(CallEvent::Incoming(self.clone()))
            }
            CallOperation::OutgoingInit(remote) => {
                if self.state != CallState::Idle {
                    return self.reject(operation);
                }
                self.remote = remote;
                self.direction = Some(CallDirection::Outgoing);
                self.enter(CallState::OutgoingInit);
                Transition::accepted(CallEvent::OutgoingInit(self.clone()))
            }
            CallOperation::Connected => self.step(CallState::Connected, operation),
            CallOperation::End => self.step(CallState::Ended, operation),
            CallOperation::Released => self.step(CallState::Released, operation),
        }
    }

    /// Tear the call down regardless of its current state.
    ///
    /// Emits `Error` (when a failure is given) and `Released`. A call that is
    /// already released is left untouched and nothing is emitted.
    pub fn force_release(&mut self, failure: Option<CallFailure>) -> Transition {
        let mut events = Vec::with_capacity(2);
        if self.state.is_terminal() {
            return Transition { events, violation: None };
        }
        if let Some(failure) = failure {
            self.error = Some(failure.clone());
            events.push(CallEvent::Error {
                call: self.clone(),
                failure,
            });
        }
        self.enter(CallState::Released);
        events.push(CallEvent::Released(self.clone()));
        Transition { events, violation: None }
    }

    fn step(&mut self, next: CallState, operation: &'static str) -> Transition {
        if !self.state.can_transition_to(next) {
            return self.reject(operation);
        }
        self.enter(next);
        let call = self.clone();
        Transition::accepted(match next {
            CallState::Connected => CallEvent::Connected(call),
            CallState::Ended => CallEvent::Ended(call),
            _ => CallEvent::Released(call),
        })
    }

    fn enter(&mut self, next: CallState) {
        tracing::debug!(call_id = %self.call_id, from = %self.state, to = %next, "Call state transition");
        match next {
            CallState::Connected => self.connected_at = Some(Utc::now()),
            CallState::Ended | CallState::Released => {
                if self.ended_at.is_none() {
                    self.ended_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        self.state = next;
    }

    fn reject(&mut self, operation: &'static str) -> Transition {
        let violation = CallCoreError::ordering_violation(self.call_id.clone(), self.state, operation);
        tracing::warn!(call_id = %self.call_id, state = %self.state, operation, "Protocol ordering violation");

        if self.state.is_terminal() {
            return Transition::rejected(Vec::new(), violation);
        }
        let failure = CallFailure::new(ErrorReason::OrderingViolation, violation.to_string());
        let forced = self.force_release(Some(failure));
        Transition::rejected(forced.events, violation)
    }
}
