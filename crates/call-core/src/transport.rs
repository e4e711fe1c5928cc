//! Signaling transport abstraction
//!
//! The engine never talks SIP itself. It sends requests through a
//! [`SignalingTransport`] and receives protocol events as
//! [`TransportEvent`]s over a channel (see
//! [`CallEngine::event_sender`](crate::engine::CallEngine::event_sender)).
//! The transport is expected to deliver events for one call or account
//! serially and in protocol order.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::call::{CallFailure, CallId, ErrorReason, RemoteParty};
use crate::error::{CallCoreError, CallCoreResult};
use crate::registration::{AccountConfig, AccountId};

/// What a request refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestTarget {
    Call(CallId),
    Account(AccountId),
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Call(id) => write!(f, "call {}", id),
            RequestTarget::Account(id) => write!(f, "account {}", id),
        }
    }
}

/// Requests the engine asks the transport to carry out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalingRequest {
    /// Place an outgoing call (INVITE)
    Invite { remote: RemoteParty },
    /// Answer an incoming call (200 OK)
    Accept { video: bool },
    /// Refuse an incoming call, optionally redirecting it (e.g., to voicemail)
    Decline {
        reason: ErrorReason,
        redirect_to: Option<String>,
    },
    /// Hang up (BYE / CANCEL)
    Terminate,
    Register { account: AccountConfig },
    /// REGISTER with expires 0
    Unregister,
}

impl SignalingRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingRequest::Invite { .. } => "invite",
            SignalingRequest::Accept { .. } => "accept",
            SignalingRequest::Decline { .. } => "decline",
            SignalingRequest::Terminate => "terminate",
            SignalingRequest::Register { .. } => "register",
            SignalingRequest::Unregister => "unregister",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOutcome {
    Sent,
    Rejected { reason: String },
}

impl RequestOutcome {
    pub fn into_result(self) -> CallCoreResult<()> {
        match self {
            RequestOutcome::Sent => Ok(()),
            RequestOutcome::Rejected { reason } => Err(CallCoreError::RequestRejected { reason }),
        }
    }
}

/// Outbound side of the signaling stack
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send_request(&self, target: &RequestTarget, request: SignalingRequest) -> CallCoreResult<RequestOutcome>;
}

/// Call progress reported by the signaling stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallSignal {
    IncomingReceived { remote: RemoteParty },
    OutgoingInit { remote: RemoteParty },
    Connected,
    End,
    Released,
    Error { failure: CallFailure },
}

/// Registration progress reported by the signaling stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationSignal {
    Progress,
    Ok,
    Cleared,
    Failed { reason: String },
}

/// Inbound event from the signaling stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    Call { call_id: CallId, signal: CallSignal },
    Registration { account_id: AccountId, signal: RegistrationSignal },
}

impl TransportEvent {
    pub fn call(call_id: impl Into<CallId>, signal: CallSignal) -> Self {
        Self::Call {
            call_id: call_id.into(),
            signal,
        }
    }

    pub fn registration(account_id: impl Into<AccountId>, signal: RegistrationSignal) -> Self {
        Self::Registration {
            account_id: account_id.into(),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_outcome_is_error() {
        assert!(RequestOutcome::Sent.into_result().is_ok());
        let err = RequestOutcome::Rejected {
            reason: "486 Busy Here".to_string(),
        }
        .into_result()
        .unwrap_err();
        assert_eq!(err.category(), "transport");
    }

    #[test]
    fn test_event_json_shape() {
        let event = TransportEvent::call("call-1", CallSignal::Connected);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Call"]["call_id"], "call-1");
        assert_eq!(json["Call"]["signal"], "Connected");
    }
}
