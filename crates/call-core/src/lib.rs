//! Call and registration session engine for VoIP clients
//!
//! `rvoip-call-core` sits between a SIP signaling stack and the application.
//! The stack reports protocol events; the engine validates them against the
//! call and registration state machines, keeps the registry of live calls,
//! and notifies registered observers in order.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │ Application observers     │  CallObserver / RegistrationObserver
//! └────────────▲──────────────┘
//!              │ events (sequential, per call in order)
//! ┌────────────┴──────────────┐
//! │ CallEngine                │  SessionRegistry, RegistrationManager
//! └────────────▲──────────────┘
//!              │ TransportEvent / SignalingRequest
//! ┌────────────┴──────────────┐
//! │ SignalingTransport        │  SIP stack adapter
//! └───────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use rvoip_call_core::{
//!     CallCoreResult, CallEngine, CallObserver, CallSession, EngineConfig, ObserverResult,
//!     RequestOutcome, RequestTarget, SignalingRequest, SignalingTransport,
//! };
//!
//! struct Stack;
//!
//! #[async_trait]
//! impl SignalingTransport for Stack {
//!     async fn send_request(&self, _: &RequestTarget, _: SignalingRequest) -> CallCoreResult<RequestOutcome> {
//!         Ok(RequestOutcome::Sent)
//!     }
//! }
//!
//! struct Ui;
//!
//! #[async_trait]
//! impl CallObserver for Ui {
//!     async fn on_connected(&self, call: &CallSession) -> ObserverResult {
//!         println!("connected to {}", call.remote.uri);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> CallCoreResult<()> {
//! let engine = CallEngine::new(EngineConfig::default(), Arc::new(Stack))?;
//! let ui: Arc<dyn CallObserver> = Arc::new(Ui);
//! engine.add_call_observer(&ui);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod recovery;
pub mod registration;
pub mod registry;
pub mod transport;

pub use call::{CallDirection, CallFailure, CallId, CallOperation, CallSession, CallState, ErrorReason, RemoteParty, Transition};
pub use config::{AutoAnswer, EngineConfig};
pub use dispatcher::{DispatchReport, EventDispatcher, ObserverId};
pub use engine::{CallEngine, EngineStats, IncomingDisposition};
pub use error::{CallCoreError, CallCoreResult};
pub use events::{
    CallEvent, CallObserver, NoopCallObserver, NoopRegistrationObserver, ObserverResult, RegistrationObserver,
    RegistrationStatusInfo,
};
pub use recovery::RetryConfig;
pub use registration::{
    AccountConfig, AccountId, RegistrationAccount, RegistrationManager, RegistrationOperation, RegistrationState,
    RegistrationStats, TransportKind,
};
pub use registry::{SessionHandle, SessionRegistry};
pub use transport::{
    CallSignal, RegistrationSignal, RequestOutcome, RequestTarget, SignalingRequest, SignalingTransport,
    TransportEvent,
};

/// Call-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
