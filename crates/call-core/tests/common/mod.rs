//! Shared fixtures for call-core integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_call_core::{
    CallCoreError, CallCoreResult, CallFailure, CallObserver, CallSession, ObserverResult, RegistrationObserver,
    RegistrationState, RegistrationStatusInfo, RequestOutcome, RequestTarget, SignalingRequest, SignalingTransport,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_call_core=debug")
        .with_test_writer()
        .try_init();
}

/// Transport that records every request and can be told to fail
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<(RequestTarget, SignalingRequest)>>,
    fail_sends: AtomicBool,
    reject_registers: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<(RequestTarget, SignalingRequest)> {
        self.requests.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.requests.lock().iter().map(|(_, r)| r.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.requests.lock().iter().filter(|(_, r)| r.kind() == kind).count()
    }

    /// Every send fails with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// The next `n` REGISTER requests are rejected
    pub fn reject_next_registers(&self, n: usize) {
        self.reject_registers.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn send_request(&self, target: &RequestTarget, request: SignalingRequest) -> CallCoreResult<RequestOutcome> {
        let is_register = matches!(request, SignalingRequest::Register { .. });
        self.requests.lock().push((target.clone(), request));

        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CallCoreError::transport_failed("network unreachable"));
        }
        if is_register {
            let remaining = self.reject_registers.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reject_registers.store(remaining - 1, Ordering::SeqCst);
                return Ok(RequestOutcome::Rejected {
                    reason: "503 Service Unavailable".to_string(),
                });
            }
        }
        Ok(RequestOutcome::Sent)
    }
}

/// Records call events as `"<event>:<call id>"`
#[derive(Default)]
pub struct CallRecorder {
    events: Mutex<Vec<String>>,
    failures: Mutex<Vec<CallFailure>>,
}

impl CallRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn failures(&self) -> Vec<CallFailure> {
        self.failures.lock().clone()
    }

    fn push(&self, name: &str, call: &CallSession) {
        self.events.lock().push(format!("{}:{}", name, call.call_id));
    }
}

#[async_trait]
impl CallObserver for CallRecorder {
    async fn on_incoming(&self, call: &CallSession) -> ObserverResult {
        self.push("incoming", call);
        Ok(())
    }

    async fn on_outgoing_init(&self, call: &CallSession) -> ObserverResult {
        self.push("outgoing_init", call);
        Ok(())
    }

    async fn on_connected(&self, call: &CallSession) -> ObserverResult {
        self.push("connected", call);
        Ok(())
    }

    async fn on_ended(&self, call: &CallSession) -> ObserverResult {
        self.push("ended", call);
        Ok(())
    }

    async fn on_released(&self, call: &CallSession) -> ObserverResult {
        self.push("released", call);
        Ok(())
    }

    async fn on_error(&self, call: &CallSession, failure: &CallFailure) -> ObserverResult {
        self.push("error", call);
        self.failures.lock().push(failure.clone());
        Ok(())
    }
}

/// Records registration states in delivery order
#[derive(Default)]
pub struct RegistrationRecorder {
    states: Mutex<Vec<RegistrationState>>,
    infos: Mutex<Vec<RegistrationStatusInfo>>,
}

impl RegistrationRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<RegistrationState> {
        self.states.lock().clone()
    }

    pub fn infos(&self) -> Vec<RegistrationStatusInfo> {
        self.infos.lock().clone()
    }
}

#[async_trait]
impl RegistrationObserver for RegistrationRecorder {
    async fn on_registration_event(&self, info: &RegistrationStatusInfo) -> ObserverResult {
        self.states.lock().push(info.state);
        self.infos.lock().push(info.clone());
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
