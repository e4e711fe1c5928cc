//! Events and observer traits
//!
//! Two observer families receive notifications from the engine:
//!
//! - [`CallObserver`] - incoming, outgoing-init, connected, ended, released and error
//! - [`RegistrationObserver`] - none, progress, ok, cleared and failed
//!
//! Every method has a no-op default, so an observer only implements the
//! notifications it cares about. Returning an error from a method marks that
//! observer's delivery as failed; other observers are still notified.
//!
//! ```rust
//! use rvoip_call_core::events::{CallObserver, ObserverResult};
//! use rvoip_call_core::call::CallSession;
//! use async_trait::async_trait;
//!
//! struct Ringer;
//!
//! #[async_trait]
//! impl CallObserver for Ringer {
//!     async fn on_incoming(&self, call: &CallSession) -> ObserverResult {
//!         println!("Incoming call from {}", call.remote.uri);
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallFailure, CallId, CallSession};
use crate::registration::{AccountId, RegistrationState};

/// Result returned by observer callbacks
pub type ObserverResult = anyhow::Result<()>;

/// A call state change, carrying a snapshot of the call after the change
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming(CallSession),
    OutgoingInit(CallSession),
    Connected(CallSession),
    Ended(CallSession),
    Released(CallSession),
    Error { call: CallSession, failure: CallFailure },
}

impl CallEvent {
    pub fn call(&self) -> &CallSession {
        match self {
            CallEvent::Incoming(call)
            | CallEvent::OutgoingInit(call)
            | CallEvent::Connected(call)
            | CallEvent::Ended(call)
            | CallEvent::Released(call) => call,
            CallEvent::Error { call, .. } => call,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call().call_id
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Incoming(_) => "incoming",
            CallEvent::OutgoingInit(_) => "outgoing_init",
            CallEvent::Connected(_) => "connected",
            CallEvent::Ended(_) => "ended",
            CallEvent::Released(_) => "released",
            CallEvent::Error { .. } => "error",
        }
    }
}

/// A registration state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStatusInfo {
    pub account_id: AccountId,
    /// Registered identity (e.g., "sip:alice@example.com")
    pub user_uri: String,
    pub state: RegistrationState,
    pub previous_state: Option<RegistrationState>,
    /// Failure reason or server message, if any
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Receives call notifications
#[async_trait]
pub trait CallObserver: Send + Sync {
    /// A remote party is calling. The call is in `Incoming`.
    async fn on_incoming(&self, _call: &CallSession) -> ObserverResult {
        Ok(())
    }

    /// An outgoing call was started and its INVITE is about to be sent
    async fn on_outgoing_init(&self, _call: &CallSession) -> ObserverResult {
        Ok(())
    }

    /// The call was answered and media can flow
    async fn on_connected(&self, _call: &CallSession) -> ObserverResult {
        Ok(())
    }

    /// Either side hung up. `on_released` follows.
    async fn on_ended(&self, _call: &CallSession) -> ObserverResult {
        Ok(())
    }

    /// The call is gone and its id is free for reuse
    async fn on_released(&self, _call: &CallSession) -> ObserverResult {
        Ok(())
    }

    /// The call failed. `failure` carries the reason and `on_released` follows.
    async fn on_error(&self, _call: &CallSession, _failure: &CallFailure) -> ObserverResult {
        Ok(())
    }

    /// Route an event to the matching callback
    async fn on_call_event(&self, event: &CallEvent) -> ObserverResult {
        match event {
            CallEvent::Incoming(call) => self.on_incoming(call).await,
            CallEvent::OutgoingInit(call) => self.on_outgoing_init(call).await,
            CallEvent::Connected(call) => self.on_connected(call).await,
            CallEvent::Ended(call) => self.on_ended(call).await,
            CallEvent::Released(call) => self.on_released(call).await,
            CallEvent::Error { call, failure } => self.on_error(call, failure).await,
        }
    }
}

/// Receives registration notifications
#[async_trait]
pub trait RegistrationObserver: Send + Sync {
    /// The account was added and has not registered yet
    async fn on_none(&self, _info: &RegistrationStatusInfo) -> ObserverResult {
        Ok(())
    }

    /// A REGISTER is in flight
    async fn on_progress(&self, _info: &RegistrationStatusInfo) -> ObserverResult {
        Ok(())
    }

    /// The registrar accepted the account
    async fn on_ok(&self, _info: &RegistrationStatusInfo) -> ObserverResult {
        Ok(())
    }

    /// The account was unregistered
    async fn on_cleared(&self, _info: &RegistrationStatusInfo) -> ObserverResult {
        Ok(())
    }

    /// The attempt failed. `info.reason` says why.
    async fn on_failed(&self, _info: &RegistrationStatusInfo) -> ObserverResult {
        Ok(())
    }

    /// Route a status change to the matching callback
    async fn on_registration_event(&self, info: &RegistrationStatusInfo) -> ObserverResult {
        match info.state {
            RegistrationState::None => self.on_none(info).await,
            RegistrationState::Progress => self.on_progress(info).await,
            RegistrationState::Ok => self.on_ok(info).await,
            RegistrationState::Cleared => self.on_cleared(info).await,
            RegistrationState::Failed => self.on_failed(info).await,
        }
    }
}

/// Call observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallObserver;

impl CallObserver for NoopCallObserver {}

/// Registration observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrationObserver;

impl RegistrationObserver for NoopRegistrationObserver {}

/// Anything the dispatcher can deliver an event of type `E` to
#[async_trait]
pub trait Observe<E: Send + Sync>: Send + Sync {
    async fn observe(&self, event: &E) -> ObserverResult;
}

#[async_trait]
impl<T: CallObserver + ?Sized> Observe<CallEvent> for T {
    async fn observe(&self, event: &CallEvent) -> ObserverResult {
        self.on_call_event(event).await
    }
}

#[async_trait]
impl<T: RegistrationObserver + ?Sized> Observe<RegistrationStatusInfo> for T {
    async fn observe(&self, event: &RegistrationStatusInfo) -> ObserverResult {
        self.on_registration_event(event).await
    }
}
