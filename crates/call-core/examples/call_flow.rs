//! Drives one registration and one incoming call through the engine with a
//! scripted in-process transport.
//!
//! ```sh
//! RUST_LOG=rvoip_call_core=debug cargo run --example call_flow
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvoip_call_core::{
    AccountConfig, CallCoreResult, CallEngine, CallFailure, CallObserver, CallSession, CallSignal, EngineConfig,
    ObserverResult, RegistrationObserver, RegistrationSignal, RegistrationStatusInfo, RemoteParty, RequestOutcome,
    RequestTarget, SignalingRequest, SignalingTransport, TransportEvent,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Answers every request like a cooperative registrar and peer
struct LoopbackStack {
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl SignalingTransport for LoopbackStack {
    async fn send_request(&self, target: &RequestTarget, request: SignalingRequest) -> CallCoreResult<RequestOutcome> {
        info!(to = %target, request = request.kind(), "Sending request");
        let reply = match (target, &request) {
            (RequestTarget::Account(id), SignalingRequest::Register { .. }) => {
                Some(TransportEvent::registration(id.clone(), RegistrationSignal::Ok))
            }
            (RequestTarget::Account(id), SignalingRequest::Unregister) => {
                Some(TransportEvent::registration(id.clone(), RegistrationSignal::Cleared))
            }
            (RequestTarget::Call(id), SignalingRequest::Accept { .. }) => {
                Some(TransportEvent::call(id.clone(), CallSignal::Connected))
            }
            _ => None,
        };
        if let Some(event) = reply {
            // reply from another task, as a real stack would
            let events = self.events.clone();
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
        Ok(RequestOutcome::Sent)
    }
}

struct Console;

#[async_trait]
impl CallObserver for Console {
    async fn on_incoming(&self, call: &CallSession) -> ObserverResult {
        println!("📞 Incoming call {} from {}", call.call_id, call.remote.uri);
        Ok(())
    }

    async fn on_connected(&self, call: &CallSession) -> ObserverResult {
        println!("✅ Call {} connected", call.call_id);
        Ok(())
    }

    async fn on_ended(&self, call: &CallSession) -> ObserverResult {
        println!("👋 Call {} ended", call.call_id);
        Ok(())
    }

    async fn on_released(&self, call: &CallSession) -> ObserverResult {
        println!("🧹 Call {} released", call.call_id);
        Ok(())
    }

    async fn on_error(&self, call: &CallSession, failure: &CallFailure) -> ObserverResult {
        println!("❌ Call {} failed: {}", call.call_id, failure);
        Ok(())
    }
}

#[async_trait]
impl RegistrationObserver for Console {
    async fn on_registration_event(&self, info: &RegistrationStatusInfo) -> ObserverResult {
        println!("📋 {} is now {}", info.user_uri, info.state);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rvoip_call_core=info")))
        .init();

    // The stack needs the engine's sender and the engine needs the stack, so
    // the stack gets its own channel that is forwarded below.
    let (stack_tx, mut stack_rx) = mpsc::channel(64);
    let stack = Arc::new(LoopbackStack { events: stack_tx.clone() });

    let config = EngineConfig::default().with_auto_answer(Duration::from_millis(200));
    let engine = CallEngine::new(config, stack)?;

    let console = Arc::new(Console);
    let call_observer: Arc<dyn CallObserver> = console.clone();
    let registration_observer: Arc<dyn RegistrationObserver> = console;
    engine.add_call_observer(&call_observer);
    engine.add_registration_observer(&registration_observer);

    engine.start().await?;
    let sender = engine.event_sender();
    tokio::spawn(async move {
        while let Some(event) = stack_rx.recv().await {
            if sender.send(event).await.is_err() {
                break;
            }
        }
    });

    let account = engine
        .add_account(AccountConfig::new("alice", "secret", "example.com"))
        .await?;
    engine.register(&account).await?;

    stack_tx
        .send(TransportEvent::call(
            "demo-call",
            CallSignal::IncomingReceived {
                remote: RemoteParty::new("sip:bob@example.com").with_display_name("Bob"),
            },
        ))
        .await?;

    // ring, auto answer, talk
    tokio::time::sleep(Duration::from_millis(500)).await;
    stack_tx.send(TransportEvent::call("demo-call", CallSignal::End)).await?;
    stack_tx.send(TransportEvent::call("demo-call", CallSignal::Released)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = engine.stats().await;
    info!(live_calls = stats.live_calls, registered = stats.registrations.registered_accounts, "Before shutdown");

    engine.shutdown().await?;
    Ok(())
}
