//! Error types for call-core
//!
//! Errors are grouped into categories to help callers decide what to do:
//!
//! - **Ordering** - a transition was requested from a state that does not allow it
//! - **Registry** - a call id was reused or looked up after it was released
//! - **Observer** - one observer failed while handling an event
//! - **Transport** - the signaling transport could not carry a request
//! - **Configuration** - invalid engine or account settings
//!
//! None of these abort the process. Ordering violations on a call are also
//! recorded on the session itself, which is then forced to `Released`.
//!
//! ```rust
//! use rvoip_call_core::{CallCoreError, CallId};
//!
//! let err = CallCoreError::not_found(CallId::from("call-1"));
//! assert_eq!(err.category(), "registry");
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

use crate::call::{CallId, CallState};
use crate::registration::{AccountId, RegistrationState};

/// Result type for call-core operations
pub type CallCoreResult<T> = Result<T, CallCoreError>;

/// Errors produced by the call and registration engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallCoreError {
    /// A call transition was requested from a state that does not allow it
    #[error("Protocol ordering violation on call {call_id}: {operation} not allowed in state {state}")]
    ProtocolOrderingViolation {
        call_id: CallId,
        state: CallState,
        operation: &'static str,
    },

    /// A registration transition was requested from a state that does not allow it
    #[error("Registration ordering violation on account {account_id}: {operation} not allowed in state {state}")]
    RegistrationOrderingViolation {
        account_id: AccountId,
        state: RegistrationState,
        operation: &'static str,
    },

    #[error("Session already exists: {call_id}")]
    DuplicateSession { call_id: CallId },

    #[error("Session not found: {call_id}")]
    NotFound { call_id: CallId },

    #[error("Account not found: {account_id}")]
    AccountNotFound { account_id: AccountId },

    /// An observer failed while handling an event; other observers were still notified
    #[error("Observer {observer} failed: {reason}")]
    ObserverFailure { observer: u64, reason: String },

    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    #[error("Request rejected by transport: {reason}")]
    RequestRejected { reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Engine is not running")]
    EngineNotRunning,

    #[error("Engine is already running")]
    EngineAlreadyRunning,
}

impl CallCoreError {
    pub fn ordering_violation(call_id: CallId, state: CallState, operation: &'static str) -> Self {
        Self::ProtocolOrderingViolation { call_id, state, operation }
    }

    pub fn not_found(call_id: CallId) -> Self {
        Self::NotFound { call_id }
    }

    pub fn duplicate_session(call_id: CallId) -> Self {
        Self::DuplicateSession { call_id }
    }

    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed { reason: reason.into() }
    }

    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallCoreError::TransportFailed { .. } |
            CallCoreError::RequestRejected { .. } => true,

            CallCoreError::ProtocolOrderingViolation { .. } |
            CallCoreError::RegistrationOrderingViolation { .. } |
            CallCoreError::DuplicateSession { .. } |
            CallCoreError::NotFound { .. } |
            CallCoreError::AccountNotFound { .. } |
            CallCoreError::ObserverFailure { .. } |
            CallCoreError::InvalidConfiguration { .. } |
            CallCoreError::EngineNotRunning |
            CallCoreError::EngineAlreadyRunning => false,
        }
    }

    pub fn is_ordering_violation(&self) -> bool {
        matches!(
            self,
            CallCoreError::ProtocolOrderingViolation { .. }
                | CallCoreError::RegistrationOrderingViolation { .. }
        )
    }

    /// Category name, useful for grouping errors in logs
    pub fn category(&self) -> &'static str {
        match self {
            CallCoreError::ProtocolOrderingViolation { .. } |
            CallCoreError::RegistrationOrderingViolation { .. } => "ordering",

            CallCoreError::DuplicateSession { .. } |
            CallCoreError::NotFound { .. } |
            CallCoreError::AccountNotFound { .. } => "registry",

            CallCoreError::ObserverFailure { .. } => "observer",

            CallCoreError::TransportFailed { .. } |
            CallCoreError::RequestRejected { .. } => "transport",

            CallCoreError::InvalidConfiguration { .. } => "configuration",

            CallCoreError::EngineNotRunning |
            CallCoreError::EngineAlreadyRunning => "lifecycle",
        }
    }
}
