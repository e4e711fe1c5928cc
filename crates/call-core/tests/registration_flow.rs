//! Integration tests for account registration

mod common;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use common::{init_tracing, wait_until, MockTransport, RegistrationRecorder};
use pretty_assertions::assert_eq;
use rvoip_call_core::{
    AccountConfig, AccountId, CallCoreError, CallCoreResult, CallEngine, EngineConfig, RegistrationObserver,
    RegistrationSignal, RegistrationState, RequestOutcome, RequestTarget, RetryConfig, SignalingRequest,
    SignalingTransport, TransportEvent,
};
use serial_test::serial;

use RegistrationState::{Cleared, Failed, None as Unregistered, Ok as Registered, Progress};

async fn setup(
    config: EngineConfig,
) -> (Arc<CallEngine>, Arc<MockTransport>, Arc<RegistrationRecorder>, AccountId) {
    init_tracing();
    let transport = MockTransport::new();
    let engine = CallEngine::new(config, transport.clone()).unwrap();
    let recorder = RegistrationRecorder::new();
    let observer: Arc<dyn RegistrationObserver> = recorder.clone();
    engine.add_registration_observer(&observer);
    let account = engine
        .add_account(AccountConfig::new("alice", "secret", "example.com"))
        .await
        .unwrap();
    (engine, transport, recorder, account)
}

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(10))
        .without_jitter()
}

#[tokio::test]
async fn test_register_and_unregister() {
    let (engine, transport, recorder, account) = setup(EngineConfig::default()).await;

    engine.register(&account).await.unwrap();
    match &transport.requests()[0] {
        (RequestTarget::Account(id), SignalingRequest::Register { account: config }) => {
            assert_eq!(id, &account);
            assert_eq!(config.sip_uri(), "sip:alice@example.com");
        }
        other => panic!("unexpected request {:?}", other),
    }

    engine
        .handle_transport_event(TransportEvent::registration(account.clone(), RegistrationSignal::Ok))
        .await
        .unwrap();
    engine.unregister(&account).await.unwrap();
    engine
        .handle_transport_event(TransportEvent::registration(account.clone(), RegistrationSignal::Cleared))
        .await
        .unwrap();

    assert_eq!(recorder.states(), vec![Unregistered, Progress, Registered, Cleared]);
    assert_eq!(transport.kinds(), vec!["register", "unregister"]);

    let infos = recorder.infos();
    assert_eq!(infos[0].previous_state, None);
    assert_eq!(infos[2].previous_state, Some(Progress));
    assert_eq!(infos[2].user_uri, "sip:alice@example.com");
}

#[tokio::test]
async fn test_failure_then_success() {
    let (engine, _transport, recorder, account) = setup(EngineConfig::default()).await;
    let manager = engine.registrations();

    manager.registration_progress(&account).await.unwrap();
    manager.registration_failed(&account, "408 Request Timeout").await.unwrap();
    manager.registration_progress(&account).await.unwrap();
    manager.registration_ok(&account).await.unwrap();

    assert_eq!(manager.state(&account).await.unwrap(), Registered);
    assert_eq!(recorder.states(), vec![Unregistered, Progress, Failed, Progress, Registered]);
    assert_eq!(recorder.infos()[2].reason.as_deref(), Some("408 Request Timeout"));

    let details = manager.account(&account).await.unwrap();
    assert_eq!(details.consecutive_failures(), 0);
    assert!(details.last_error().is_none());
}

#[tokio::test]
async fn test_invalid_transition_keeps_state() {
    let (engine, _transport, recorder, account) = setup(EngineConfig::default()).await;
    let manager = engine.registrations();

    let err = manager.registration_ok(&account).await.unwrap_err();
    assert!(matches!(err, CallCoreError::RegistrationOrderingViolation { state: Unregistered, .. }));
    assert_eq!(manager.state(&account).await.unwrap(), Unregistered);
    assert_eq!(recorder.states(), vec![Unregistered]);

    let err = engine.unregister(&account).await.unwrap_err();
    assert!(matches!(err, CallCoreError::RegistrationOrderingViolation { operation: "unregister", .. }));
}

#[tokio::test]
async fn test_rejected_register_fails_without_retry() {
    let (engine, transport, recorder, account) = setup(EngineConfig::default()).await;
    transport.reject_next_registers(1);

    let err = engine.register(&account).await.unwrap_err();
    assert!(matches!(err, CallCoreError::RequestRejected { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.states(), vec![Unregistered, Progress, Failed]);
    assert_eq!(transport.count("register"), 1);
    assert_eq!(engine.registrations().state(&account).await.unwrap(), Failed);
}

#[tokio::test]
#[serial]
async fn test_retry_stops_at_attempt_limit() {
    let (engine, transport, recorder, account) =
        setup(EngineConfig::default().with_registration_retry(retry(3))).await;
    transport.reject_next_registers(10);

    assert!(engine.register(&account).await.is_err());
    assert!(wait_until(Duration::from_secs(2), || transport.count("register") == 3).await);

    // no further attempts once the limit is reached
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.count("register"), 3);
    assert_eq!(
        recorder.states(),
        vec![Unregistered, Progress, Failed, Progress, Failed, Progress, Failed]
    );
    let details = engine.registrations().account(&account).await.unwrap();
    assert_eq!(details.consecutive_failures(), 3);
}

#[tokio::test]
#[serial]
async fn test_retry_recovers() {
    let (engine, transport, recorder, account) =
        setup(EngineConfig::default().with_registration_retry(retry(5))).await;
    transport.reject_next_registers(1);

    assert!(engine.register(&account).await.is_err());
    assert!(wait_until(Duration::from_secs(2), || transport.count("register") == 2).await);

    engine
        .handle_transport_event(TransportEvent::registration(account.clone(), RegistrationSignal::Ok))
        .await
        .unwrap();

    assert_eq!(
        recorder.states(),
        vec![Unregistered, Progress, Failed, Progress, Registered]
    );
    assert_eq!(engine.stats().await.registrations.registered_accounts, 1);
}

#[tokio::test]
async fn test_duplicate_account_rejected() {
    let (engine, _transport, _recorder, _account) = setup(EngineConfig::default()).await;

    let err = engine
        .add_account(AccountConfig::new("alice", "other", "example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "configuration");
    assert_eq!(engine.registrations().account_ids().len(), 1);
}

#[tokio::test]
async fn test_unknown_account() {
    let (engine, _transport, _recorder, _account) = setup(EngineConfig::default()).await;

    let err = engine.register(&"bob@example.com".into()).await.unwrap_err();
    assert!(matches!(err, CallCoreError::AccountNotFound { .. }));
}

#[tokio::test]
#[serial]
async fn test_manual_register_after_exhausted_retries_retries_again() {
    let (engine, transport, _recorder, account) =
        setup(EngineConfig::default().with_registration_retry(retry(2))).await;
    transport.reject_next_registers(10);

    assert!(engine.register(&account).await.is_err());
    assert!(wait_until(Duration::from_secs(2), || transport.count("register") == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.count("register"), 2);

    // a new attempt from the application gets a fresh retry budget
    assert!(engine.register(&account).await.is_err());
    assert!(wait_until(Duration::from_secs(2), || transport.count("register") == 4).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.count("register"), 4);

    let details = engine.registrations().account(&account).await.unwrap();
    assert_eq!(details.state(), Failed);
    assert_eq!(details.consecutive_failures(), 2);
}

/// How [`Registrar`] answers a REGISTER
#[derive(Clone, Copy)]
enum Reply {
    /// Report the outcome to the engine before `send_request` returns
    Inline(bool),
    /// Hold the request for a while and report nothing
    Slow(Duration),
}

/// Registrar that talks back to the engine from inside `send_request`
struct Registrar {
    engine: OnceLock<Weak<CallEngine>>,
    reply: Reply,
}

#[async_trait]
impl SignalingTransport for Registrar {
    async fn send_request(&self, target: &RequestTarget, request: SignalingRequest) -> CallCoreResult<RequestOutcome> {
        let RequestTarget::Account(account_id) = target else {
            return Ok(RequestOutcome::Sent);
        };
        let signal = match (&request, self.reply) {
            (SignalingRequest::Register { .. }, Reply::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                return Ok(RequestOutcome::Sent);
            }
            (SignalingRequest::Register { .. }, Reply::Inline(true)) => RegistrationSignal::Ok,
            (SignalingRequest::Register { .. }, Reply::Inline(false)) => RegistrationSignal::Failed {
                reason: "403 Forbidden".to_string(),
            },
            (SignalingRequest::Unregister, _) => RegistrationSignal::Cleared,
            _ => return Ok(RequestOutcome::Sent),
        };
        let accepted = !matches!(signal, RegistrationSignal::Failed { .. });
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            engine
                .handle_transport_event(TransportEvent::registration(account_id.clone(), signal))
                .await?;
        }
        if accepted {
            Ok(RequestOutcome::Sent)
        } else {
            Ok(RequestOutcome::Rejected {
                reason: "403 Forbidden".to_string(),
            })
        }
    }
}

async fn setup_registrar(reply: Reply) -> (Arc<CallEngine>, Arc<RegistrationRecorder>, AccountId) {
    init_tracing();
    let registrar = Arc::new(Registrar {
        engine: OnceLock::new(),
        reply,
    });
    let engine = CallEngine::new(EngineConfig::default(), registrar.clone()).unwrap();
    registrar.engine.set(Arc::downgrade(&engine)).unwrap();

    let recorder = RegistrationRecorder::new();
    let observer: Arc<dyn RegistrationObserver> = recorder.clone();
    engine.add_registration_observer(&observer);
    let account = engine
        .add_account(AccountConfig::new("alice", "secret", "example.com"))
        .await
        .unwrap();
    (engine, recorder, account)
}

#[tokio::test]
async fn test_registrar_replies_before_send_returns() {
    let (engine, recorder, account) = setup_registrar(Reply::Inline(true)).await;

    let registered = tokio::time::timeout(Duration::from_secs(2), engine.register(&account)).await;
    assert!(registered.expect("register stalled").is_ok());
    assert_eq!(engine.registrations().state(&account).await.unwrap(), Registered);

    let cleared = tokio::time::timeout(Duration::from_secs(2), engine.unregister(&account)).await;
    assert!(cleared.expect("unregister stalled").is_ok());
    assert_eq!(recorder.states(), vec![Unregistered, Progress, Registered, Cleared]);
}

#[tokio::test]
async fn test_registrar_failure_reported_once() {
    let (engine, recorder, account) = setup_registrar(Reply::Inline(false)).await;

    let result = tokio::time::timeout(Duration::from_secs(2), engine.register(&account)).await;
    let err = result.expect("register stalled").unwrap_err();
    assert!(matches!(err, CallCoreError::RequestRejected { .. }));

    assert_eq!(recorder.states(), vec![Unregistered, Progress, Failed]);
    assert_eq!(recorder.infos()[2].reason.as_deref(), Some("403 Forbidden"));
    let details = engine.registrations().account(&account).await.unwrap();
    assert_eq!(details.consecutive_failures(), 1);
}

#[tokio::test]
async fn test_queries_answer_while_register_in_flight() {
    let (engine, _recorder, account) = setup_registrar(Reply::Slow(Duration::from_secs(5))).await;

    let pending = {
        let engine = engine.clone();
        let account = account.clone();
        tokio::spawn(async move { engine.register(&account).await })
    };

    let in_progress = tokio::time::timeout(Duration::from_secs(1), async {
        while engine.registrations().state(&account).await.unwrap() != Progress {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(in_progress.is_ok());

    let stats = tokio::time::timeout(Duration::from_millis(500), engine.stats())
        .await
        .expect("stats waited on the transport");
    assert_eq!(stats.registrations.total_accounts, 1);
    assert_eq!(stats.registrations.registered_accounts, 0);

    let details = tokio::time::timeout(Duration::from_millis(500), engine.registrations().account(&account))
        .await
        .expect("account lookup waited on the transport")
        .unwrap();
    assert_eq!(details.state(), Progress);

    pending.abort();
}
