//! Call engine
//!
//! [`CallEngine`] ties the pieces together: it keeps the [`SessionRegistry`]
//! of live calls, drives each call's state machine from transport events and
//! local actions, fans the resulting events out to call observers, and owns
//! the [`RegistrationManager`] for accounts.
//!
//! ```text
//!  SignalingTransport ──TransportEvent──► CallEngine ──CallEvent──► CallObserver(s)
//!         ▲                                  │  │
//!         └──────── SignalingRequest ────────┘  └──RegistrationStatusInfo──► RegistrationObserver(s)
//! ```
//!
//! Transitions on one call are serialized through that call's order lock, and
//! the events of a transition are dispatched before it is released, so each
//! call's observers see its events in order. The call's state is updated
//! under a separate short lock that is never held across an await, so
//! observers may query the engine and use the local call actions
//! (`answer_call`, `decline_call`, `terminate_call`) from inside a callback.
//! Awaiting another transition on the same call from a callback
//! (`force_release`, or driving a transport event inline) would wait on the
//! order lock; spawn a task for that instead.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::call::{CallFailure, CallId, CallOperation, CallSession, CallState, ErrorReason, RemoteParty, Transition};
use crate::config::EngineConfig;
use crate::dispatcher::{EventDispatcher, ObserverId};
use crate::error::{CallCoreError, CallCoreResult};
use crate::events::{CallObserver, RegistrationObserver};
use crate::registration::{AccountConfig, AccountId, RegistrationManager, RegistrationOperation, RegistrationStats};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::transport::{
    CallSignal, RegistrationSignal, RequestOutcome, RequestTarget, SignalingRequest, SignalingTransport,
    TransportEvent,
};

/// What happened to an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDisposition {
    /// A session was created and observers were notified
    Notified,
    /// Another call was live; the call was declined with `Busy`
    RejectedBusy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub is_running: bool,
    pub live_calls: usize,
    pub connected_calls: usize,
    pub total_calls: u64,
    pub registrations: RegistrationStats,
}

struct Pump {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<mpsc::Receiver<TransportEvent>>,
}

pub struct CallEngine {
    config: EngineConfig,
    registry: SessionRegistry,
    call_observers: EventDispatcher<dyn CallObserver>,
    registrations: Arc<RegistrationManager>,
    transport: Arc<dyn SignalingTransport>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: SyncMutex<Option<mpsc::Receiver<TransportEvent>>>,
    pump: Mutex<Option<Pump>>,
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("call_observers", &self.call_observers)
            .field("registrations", &self.registrations)
            .finish()
    }
}

impl CallEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn SignalingTransport>) -> CallCoreResult<Arc<Self>> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let registrations = Arc::new(RegistrationManager::new(
            Arc::clone(&transport),
            config.registration_retry.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            call_observers: EventDispatcher::new("call"),
            registrations,
            transport,
            event_tx,
            event_rx: SyncMutex::new(Some(event_rx)),
            pump: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registrations(&self) -> &Arc<RegistrationManager> {
        &self.registrations
    }

    /// Sender the transport uses to hand protocol events to the engine
    pub fn event_sender(&self) -> mpsc::Sender<TransportEvent> {
        self.event_tx.clone()
    }

    pub fn add_call_observer(&self, observer: &Arc<dyn CallObserver>) -> ObserverId {
        self.call_observers.register(observer)
    }

    pub fn remove_call_observer(&self, id: ObserverId) -> bool {
        self.call_observers.unregister(id)
    }

    pub fn add_registration_observer(&self, observer: &Arc<dyn RegistrationObserver>) -> ObserverId {
        self.registrations.add_observer(observer)
    }

    pub fn remove_registration_observer(&self, id: ObserverId) -> bool {
        self.registrations.remove_observer(id)
    }

    // ===== LIFECYCLE =====

    /// Start pumping transport events from [`event_sender`](Self::event_sender)
    pub async fn start(self: &Arc<Self>) -> CallCoreResult<()> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return Err(CallCoreError::EngineAlreadyRunning);
        }
        let Some(mut rx) = self.event_rx.lock().take() else {
            return Err(CallCoreError::EngineNotRunning);
        };

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let engine = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(engine) = Weak::upgrade(&engine) else { break };
                        engine.process(event).await;
                    }
                }
            }
            rx
        });

        *pump = Some(Pump { shutdown, handle });
        info!("Call engine started");
        Ok(())
    }

    /// Stop the event pump. Events sent afterwards stay queued until the
    /// next [`start`](Self::start).
    pub async fn stop(&self) -> CallCoreResult<()> {
        let Some(pump) = self.pump.lock().await.take() else {
            return Err(CallCoreError::EngineNotRunning);
        };
        let _ = pump.shutdown.send(());
        match pump.handle.await {
            Ok(rx) => *self.event_rx.lock() = Some(rx),
            Err(e) => error!(error = %e, "Event pump ended abnormally"),
        }
        info!("Call engine stopped");
        Ok(())
    }

    /// Stop the pump, hang up and release every live call, and unregister
    /// registered accounts
    pub async fn shutdown(&self) -> CallCoreResult<()> {
        if self.is_running().await {
            self.stop().await?;
        }

        for handle in self.registry.handles() {
            let call_id = handle.call_id().clone();
            if let Err(e) = self.send(&call_id, SignalingRequest::Terminate).await {
                debug!(call_id = %call_id, error = %e, "Terminate during shutdown failed");
            }
            let failure = CallFailure::new(ErrorReason::Unknown, "Engine shut down");
            if let Err(e) = self.release_handle(&handle, Some(failure)).await {
                debug!(call_id = %call_id, error = %e, "Release during shutdown failed");
            }
        }

        for account_id in self.registrations.account_ids() {
            if let Ok(account) = self.registrations.account(&account_id).await {
                if account.state().is_registered() {
                    if let Err(e) = self.registrations.unregister(&account_id).await {
                        warn!(account_id = %account_id, error = %e, "Unregister during shutdown failed");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.pump.lock().await.is_some()
    }

    async fn process(&self, event: TransportEvent) {
        if let Err(e) = self.handle_transport_event(event).await {
            match e {
                CallCoreError::NotFound { .. } => debug!(error = %e, "Transport event for unknown call"),
                e => warn!(error = %e, category = e.category(), "Failed to process transport event"),
            }
        }
    }

    /// Route one protocol event to the call or registration state machine
    pub async fn handle_transport_event(&self, event: TransportEvent) -> CallCoreResult<()> {
        match event {
            TransportEvent::Call { call_id, signal } => match signal {
                CallSignal::IncomingReceived { remote } => self.on_incoming(call_id, remote).await.map(|_| ()),
                CallSignal::OutgoingInit { remote } => self.on_outgoing_init(call_id, remote).await,
                CallSignal::Connected => self.on_connected(&call_id).await,
                CallSignal::End => self.on_end(&call_id).await,
                CallSignal::Released => self.on_released(&call_id).await,
                CallSignal::Error { failure } => self.on_error(&call_id, failure).await,
            },
            TransportEvent::Registration { account_id, signal } => {
                let op = match signal {
                    RegistrationSignal::Progress => RegistrationOperation::Progress,
                    RegistrationSignal::Ok => RegistrationOperation::Ok,
                    RegistrationSignal::Cleared => RegistrationOperation::Cleared,
                    RegistrationSignal::Failed { reason } => RegistrationOperation::Failed(reason),
                };
                self.registrations.drive(&account_id, op).await
            }
        }
    }

    // ===== CALL TRANSITIONS =====

    /// A call arrived from the network
    pub async fn on_incoming(&self, call_id: CallId, remote: RemoteParty) -> CallCoreResult<IncomingDisposition> {
        if self.config.reject_when_busy && self.registry.has_other_than(&call_id) {
            info!(call_id = %call_id, remote = %remote.uri, "Declining incoming call, another call is active");
            self.send(
                &call_id,
                SignalingRequest::Decline {
                    reason: ErrorReason::Busy,
                    redirect_to: None,
                },
            )
            .await?;
            return Ok(IncomingDisposition::RejectedBusy);
        }

        let handle = self.create_or_get(call_id.clone())?;
        let video = remote.video;
        self.drive(&handle, CallOperation::Incoming(remote)).await?;

        if let Some(auto) = self.config.auto_answer {
            if auto.delay.is_zero() {
                info!(call_id = %call_id, "Auto answering call immediately");
                if let Err(e) = self.answer_call(&call_id).await {
                    warn!(call_id = %call_id, error = %e, "Auto answer failed");
                }
            } else {
                self.schedule_auto_answer(call_id, video, auto.delay);
            }
        }
        Ok(IncomingDisposition::Notified)
    }

    /// A call was placed by the signaling stack itself
    pub async fn on_outgoing_init(&self, call_id: CallId, remote: RemoteParty) -> CallCoreResult<()> {
        let handle = self.create_or_get(call_id)?;
        self.drive(&handle, CallOperation::OutgoingInit(remote)).await
    }

    pub async fn on_connected(&self, call_id: &CallId) -> CallCoreResult<()> {
        let handle = self.registry.get(call_id)?;
        self.drive(&handle, CallOperation::Connected).await
    }

    pub async fn on_end(&self, call_id: &CallId) -> CallCoreResult<()> {
        let handle = self.registry.get(call_id)?;
        self.drive(&handle, CallOperation::End).await
    }

    pub async fn on_released(&self, call_id: &CallId) -> CallCoreResult<()> {
        let handle = self.registry.get(call_id)?;
        self.drive(&handle, CallOperation::Released).await
    }

    /// Record a failure; the transport follows up with the terminal transition
    pub async fn on_error(&self, call_id: &CallId, failure: CallFailure) -> CallCoreResult<()> {
        let handle = self.registry.get(call_id)?;
        self.drive(&handle, CallOperation::Error(failure)).await
    }

    /// Tear a call down immediately, whatever its state. Safe to call while
    /// another transition on the same call is in flight.
    pub async fn force_release(&self, call_id: &CallId, failure: Option<CallFailure>) -> CallCoreResult<()> {
        let handle = self.registry.get(call_id)?;
        self.release_handle(&handle, failure).await
    }

    // ===== LOCAL CALL ACTIONS =====

    /// Place a call. The session starts in `OutgoingInit` and an INVITE is
    /// sent; if it cannot be sent the call is released with an I/O error.
    pub async fn start_call(&self, remote: RemoteParty) -> CallCoreResult<CallId> {
        let call_id = CallId::new_random();
        let handle = self.registry.create(call_id.clone())?;
        self.drive(&handle, CallOperation::OutgoingInit(remote.clone())).await?;

        info!(call_id = %call_id, remote = %remote.uri, video = remote.video, "Starting call");
        if let Err(e) = self.send(&call_id, SignalingRequest::Invite { remote }).await {
            let failure = CallFailure::new(ErrorReason::IoError, e.to_string());
            self.release_handle(&handle, Some(failure)).await?;
            return Err(e);
        }
        Ok(call_id)
    }

    /// Answer an incoming call. The call becomes `Connected` when the
    /// transport confirms.
    pub async fn answer_call(&self, call_id: &CallId) -> CallCoreResult<()> {
        let call = self.require_state(call_id, &[CallState::Incoming], "answer_call")?;
        info!(call_id = %call_id, "Answering call");
        self.send(call_id, SignalingRequest::Accept { video: call.remote.video }).await
    }

    /// Decline an incoming call, redirecting it to voicemail when configured
    pub async fn decline_call(&self, call_id: &CallId) -> CallCoreResult<()> {
        self.require_state(call_id, &[CallState::Incoming], "decline_call")?;
        let redirect_to = self.config.decline_redirect().map(str::to_string);
        match &redirect_to {
            Some(uri) => info!(call_id = %call_id, voicemail = %uri, "Redirecting declined call to voicemail"),
            None => info!(call_id = %call_id, "Declining call"),
        }
        self.send(
            call_id,
            SignalingRequest::Decline {
                reason: ErrorReason::Declined,
                redirect_to,
            },
        )
        .await
    }

    /// Hang up a call that has started
    pub async fn terminate_call(&self, call_id: &CallId) -> CallCoreResult<()> {
        self.require_state(
            call_id,
            &[CallState::Incoming, CallState::OutgoingInit, CallState::Connected],
            "terminate_call",
        )?;
        info!(call_id = %call_id, "Terminating call");
        self.send(call_id, SignalingRequest::Terminate).await
    }

    // ===== QUERIES =====

    pub async fn call(&self, call_id: &CallId) -> CallCoreResult<CallSession> {
        Ok(self.registry.get(call_id)?.snapshot())
    }

    pub async fn active_calls(&self) -> Vec<CallSession> {
        self.registry
            .snapshots()
            .into_iter()
            .filter(|c| c.state().is_live())
            .collect()
    }

    pub async fn stats(&self) -> EngineStats {
        let calls = self.registry.snapshots();
        EngineStats {
            is_running: self.is_running().await,
            live_calls: calls.iter().filter(|c| c.state().is_live()).count(),
            connected_calls: calls.iter().filter(|c| c.state() == CallState::Connected).count(),
            total_calls: self.registry.stats().total_created,
            registrations: self.registrations.stats().await,
        }
    }

    // ===== ACCOUNTS =====

    pub async fn add_account(&self, config: AccountConfig) -> CallCoreResult<AccountId> {
        self.registrations.add_account(config).await
    }

    pub async fn register(&self, account_id: &AccountId) -> CallCoreResult<()> {
        self.registrations.register(account_id).await
    }

    pub async fn unregister(&self, account_id: &AccountId) -> CallCoreResult<()> {
        self.registrations.unregister(account_id).await
    }

    // ===== INTERNALS =====

    fn create_or_get(&self, call_id: CallId) -> CallCoreResult<SessionHandle> {
        match self.registry.create(call_id.clone()) {
            Ok(handle) => Ok(handle),
            Err(CallCoreError::DuplicateSession { .. }) => self.registry.get(&call_id),
            Err(e) => Err(e),
        }
    }

    async fn drive(&self, handle: &SessionHandle, op: CallOperation) -> CallCoreResult<()> {
        let _order = handle.order().await;
        let transition = handle.apply(op);
        self.emit(handle.call_id(), transition).await
    }

    async fn release_handle(&self, handle: &SessionHandle, failure: Option<CallFailure>) -> CallCoreResult<()> {
        let _order = handle.order().await;
        let transition = handle.force_release(failure);
        self.emit(handle.call_id(), transition).await
    }

    /// Dispatch a transition's events. Called with the call's order lock held.
    async fn emit(&self, call_id: &CallId, transition: Transition) -> CallCoreResult<()> {
        let released = transition.released();
        let (events, violation) = transition.into_parts();

        for event in &events {
            let report = self.call_observers.dispatch(event).await;
            if !report.is_clean() {
                debug!(
                    call_id = %call_id,
                    event = event.name(),
                    failures = report.failures.len(),
                    "Some observers failed"
                );
            }
        }

        if released {
            self.registry.remove(call_id);
            info!(call_id = %call_id, "Call released");
        }

        match violation {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn require_state(&self, call_id: &CallId, allowed: &[CallState], operation: &'static str) -> CallCoreResult<CallSession> {
        let call = self.registry.get(call_id)?.snapshot();
        if allowed.contains(&call.state()) {
            Ok(call)
        } else {
            Err(CallCoreError::ordering_violation(call_id.clone(), call.state(), operation))
        }
    }

    async fn send(&self, call_id: &CallId, request: SignalingRequest) -> CallCoreResult<()> {
        let kind = request.kind();
        let target = RequestTarget::Call(call_id.clone());
        let result = self
            .transport
            .send_request(&target, request)
            .await
            .and_then(RequestOutcome::into_result);
        if let Err(e) = &result {
            error!(call_id = %call_id, request = kind, error = %e, "Signaling request failed");
        }
        result
    }

    fn schedule_auto_answer(&self, call_id: CallId, video: bool, delay: Duration) {
        info!(call_id = %call_id, delay_ms = delay.as_millis() as u64, "Scheduling auto answer");
        let registry = self.registry.clone();
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(handle) = registry.get(&call_id) else {
                return;
            };
            if handle.state() != CallState::Incoming {
                debug!(call_id = %call_id, "Call no longer ringing, skipping auto answer");
                return;
            }
            info!(call_id = %call_id, "Auto answering call");
            let target = RequestTarget::Call(call_id.clone());
            let result = transport
                .send_request(&target, SignalingRequest::Accept { video })
                .await
                .and_then(RequestOutcome::into_result);
            if let Err(e) = result {
                warn!(call_id = %call_id, error = %e, "Auto answer failed");
            }
        });
    }
}
