//! Account registration
//!
//! Each configured account owns a small state machine:
//!
//! ```text
//!   None ──► Progress ──► Ok ──► Cleared
//!              ▲  │        │
//!              │  └──► Failed
//!              └── (from any state)
//! ```
//!
//! `None` is only the initial state. `Progress` can be entered from any
//! state, `Ok` and `Failed` only from `Progress`, and `Cleared` from `Ok` or
//! `Progress`. There is no terminal state, so an account may be registered,
//! fail and be retried indefinitely. Flapping is not rate-limited here.
//!
//! [`RegistrationManager`] owns the accounts, sends REGISTER requests through
//! the signaling transport, and optionally retries failed registrations with
//! exponential backoff.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as StateLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::{EventDispatcher, ObserverId};
use crate::error::{CallCoreError, CallCoreResult};
use crate::events::{RegistrationObserver, RegistrationStatusInfo};
use crate::recovery::RetryConfig;
use crate::transport::{RequestOutcome, RequestTarget, SignalingRequest, SignalingTransport};

/// Opaque account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    None,
    Progress,
    Ok,
    Cleared,
    Failed,
}

impl RegistrationState {
    pub fn can_transition_to(&self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        match (self, next) {
            (_, None) => false,
            (_, Progress) => true,
            (Progress, Ok) | (Progress, Failed) => true,
            (Ok, Cleared) | (Progress, Cleared) => true,
            _ => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Ok)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::None => "None",
            RegistrationState::Progress => "Progress",
            RegistrationState::Ok => "Ok",
            RegistrationState::Cleared => "Cleared",
            RegistrationState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// SIP transport protocol used to reach the registrar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

/// Account settings
///
/// ```rust
/// use rvoip_call_core::registration::{AccountConfig, TransportKind};
///
/// let config = AccountConfig::new("alice", "secret", "example.com:5060")
///     .with_transport(TransportKind::Tcp)
///     .with_expires(1800);
///
/// assert_eq!(config.sip_uri(), "sip:alice@example.com:5060");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Registrar host, optionally with port (e.g., "example.com:5060")
    pub domain: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    /// Registration lifetime in seconds
    #[serde(default = "default_expires")]
    pub expires: u32,
}

fn default_expires() -> u32 {
    3600
}

impl AccountConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            display_name: None,
            transport: TransportKind::Udp,
            expires: default_expires(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Default account id: `username@domain`
    pub fn account_id(&self) -> AccountId {
        AccountId(format!("{}@{}", self.username, self.domain))
    }

    pub fn validate(&self) -> CallCoreResult<()> {
        if self.username.trim().is_empty() {
            return Err(CallCoreError::invalid_configuration("username", "must not be empty"));
        }
        if self.domain.trim().is_empty() {
            return Err(CallCoreError::invalid_configuration("domain", "must not be empty"));
        }
        if self.expires == 0 {
            return Err(CallCoreError::invalid_configuration("expires", "must be greater than zero"));
        }
        Ok(())
    }
}

/// A request to move an account through its registration lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOperation {
    Progress,
    Ok,
    Cleared,
    Failed(String),
}

impl RegistrationOperation {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationOperation::Progress => "registration_progress",
            RegistrationOperation::Ok => "registration_ok",
            RegistrationOperation::Cleared => "registration_cleared",
            RegistrationOperation::Failed(_) => "registration_failed",
        }
    }

    fn target(&self) -> RegistrationState {
        match self {
            RegistrationOperation::Progress => RegistrationState::Progress,
            RegistrationOperation::Ok => RegistrationState::Ok,
            RegistrationOperation::Cleared => RegistrationState::Cleared,
            RegistrationOperation::Failed(_) => RegistrationState::Failed,
        }
    }
}

/// Registration state of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationAccount {
    pub account_id: AccountId,
    pub config: AccountConfig,
    state: RegistrationState,
    last_error: Option<String>,
    consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl RegistrationAccount {
    pub fn new(account_id: AccountId, config: AccountConfig) -> Self {
        Self {
            account_id,
            config,
            state: RegistrationState::None,
            last_error: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Failures since the last successful or caller-started registration
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub(crate) fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn registration_progress(&mut self) -> CallCoreResult<RegistrationStatusInfo> {
        self.apply(RegistrationOperation::Progress)
    }

    pub fn registration_ok(&mut self) -> CallCoreResult<RegistrationStatusInfo> {
        self.apply(RegistrationOperation::Ok)
    }

    pub fn registration_cleared(&mut self) -> CallCoreResult<RegistrationStatusInfo> {
        self.apply(RegistrationOperation::Cleared)
    }

    pub fn registration_failed(&mut self, reason: impl Into<String>) -> CallCoreResult<RegistrationStatusInfo> {
        self.apply(RegistrationOperation::Failed(reason.into()))
    }

    /// Apply an operation. An invalid one leaves the state unchanged and is
    /// recorded as the account's last error.
    pub fn apply(&mut self, op: RegistrationOperation) -> CallCoreResult<RegistrationStatusInfo> {
        let next = op.target();
        if !self.state.can_transition_to(next) {
            let err = CallCoreError::RegistrationOrderingViolation {
                account_id: self.account_id.clone(),
                state: self.state,
                operation: op.name(),
            };
            warn!(account_id = %self.account_id, state = %self.state, operation = op.name(), "Registration ordering violation");
            self.last_error = Some(err.to_string());
            return Err(err);
        }

        let previous = self.state;
        let reason = match op {
            RegistrationOperation::Failed(reason) => {
                self.consecutive_failures += 1;
                self.last_error = Some(reason.clone());
                Some(reason)
            }
            RegistrationOperation::Ok => {
                self.consecutive_failures = 0;
                self.last_error = None;
                None
            }
            _ => None,
        };
        self.state = next;
        self.updated_at = Utc::now();
        debug!(account_id = %self.account_id, from = %previous, to = %next, "Registration state transition");

        Ok(RegistrationStatusInfo {
            account_id: self.account_id.clone(),
            user_uri: self.config.sip_uri(),
            state: next,
            previous_state: Some(previous),
            reason,
            timestamp: self.updated_at,
        })
    }

    fn initial_status(&self) -> RegistrationStatusInfo {
        RegistrationStatusInfo {
            account_id: self.account_id.clone(),
            user_uri: self.config.sip_uri(),
            state: self.state,
            previous_state: None,
            reason: None,
            timestamp: self.updated_at,
        }
    }
}

/// Aggregate registration counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationStats {
    pub total_accounts: usize,
    pub registered_accounts: usize,
    pub failed_accounts: usize,
}

/// One account's state and the lock that orders its transitions
struct AccountSlot {
    order: Mutex<()>,
    account: StateLock<RegistrationAccount>,
}

/// Owns every configured account and drives registration through the transport.
///
/// Transitions on one account are serialized, and their events delivered,
/// under that account's order lock. No lock is held while a request is with
/// the transport, so the transport may report the outcome before
/// `send_request` returns and queries never wait on the network. An
/// observer must not await `register` or a reported outcome for the account
/// whose event it is handling; spawn it instead.
pub struct RegistrationManager {
    accounts: DashMap<AccountId, Arc<AccountSlot>>,
    observers: EventDispatcher<dyn RegistrationObserver>,
    transport: Arc<dyn SignalingTransport>,
    retry: Option<RetryConfig>,
}

impl fmt::Debug for RegistrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationManager")
            .field("accounts", &self.accounts.len())
            .field("observers", &self.observers)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RegistrationManager {
    pub fn new(transport: Arc<dyn SignalingTransport>, retry: Option<RetryConfig>) -> Self {
        Self {
            accounts: DashMap::new(),
            observers: EventDispatcher::new("registration"),
            transport,
            retry,
        }
    }

    pub fn add_observer(&self, observer: &Arc<dyn RegistrationObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Add an account in state `None` and notify observers
    pub async fn add_account(&self, config: AccountConfig) -> CallCoreResult<AccountId> {
        config.validate()?;
        let account_id = config.account_id();
        let account = RegistrationAccount::new(account_id.clone(), config);
        let status = account.initial_status();

        match self.accounts.entry(account_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CallCoreError::invalid_configuration(
                    "account",
                    format!("account {} already configured", account_id),
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(AccountSlot {
                    order: Mutex::new(()),
                    account: StateLock::new(account),
                }));
            }
        }

        info!(account_id = %account_id, "Account added");
        self.observers.dispatch(&status).await;
        Ok(account_id)
    }

    /// Forget an account. Does not send an un-REGISTER.
    pub fn remove_account(&self, account_id: &AccountId) -> bool {
        self.accounts.remove(account_id).is_some()
    }

    pub async fn account(&self, account_id: &AccountId) -> CallCoreResult<RegistrationAccount> {
        Ok(self.entry(account_id)?.account.lock().clone())
    }

    pub async fn state(&self, account_id: &AccountId) -> CallCoreResult<RegistrationState> {
        Ok(self.entry(account_id)?.account.lock().state())
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<_> = self.accounts.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> RegistrationStats {
        let mut stats = RegistrationStats {
            total_accounts: self.accounts.len(),
            ..Default::default()
        };
        for entry in self.accounts.iter() {
            match entry.value().account.lock().state() {
                RegistrationState::Ok => stats.registered_accounts += 1,
                RegistrationState::Failed => stats.failed_accounts += 1,
                _ => {}
            }
        }
        stats
    }

    /// Start a registration attempt: enter `Progress` and send REGISTER.
    ///
    /// A caller-started attempt resets the retry budget. If the transport
    /// cannot send the request and the account is still in `Progress`, the
    /// attempt is marked `Failed` (which may schedule a retry) and the
    /// transport error is returned.
    pub async fn register(self: &Arc<Self>, account_id: &AccountId) -> CallCoreResult<()> {
        self.attempt(account_id, true).await
    }

    /// Send an un-REGISTER. The account moves to `Cleared` when the
    /// transport confirms.
    pub async fn unregister(&self, account_id: &AccountId) -> CallCoreResult<()> {
        let slot = self.entry(account_id)?;
        let state = slot.account.lock().state();
        if !matches!(state, RegistrationState::Ok | RegistrationState::Progress) {
            return Err(CallCoreError::RegistrationOrderingViolation {
                account_id: account_id.clone(),
                state,
                operation: "unregister",
            });
        }
        let target = RequestTarget::Account(account_id.clone());
        self.transport
            .send_request(&target, SignalingRequest::Unregister)
            .await?
            .into_result()
    }

    pub async fn registration_progress(self: &Arc<Self>, account_id: &AccountId) -> CallCoreResult<()> {
        self.drive(account_id, RegistrationOperation::Progress).await
    }

    pub async fn registration_ok(self: &Arc<Self>, account_id: &AccountId) -> CallCoreResult<()> {
        self.drive(account_id, RegistrationOperation::Ok).await
    }

    pub async fn registration_cleared(self: &Arc<Self>, account_id: &AccountId) -> CallCoreResult<()> {
        self.drive(account_id, RegistrationOperation::Cleared).await
    }

    pub async fn registration_failed(
        self: &Arc<Self>,
        account_id: &AccountId,
        reason: impl Into<String>,
    ) -> CallCoreResult<()> {
        self.drive(account_id, RegistrationOperation::Failed(reason.into())).await
    }

    /// Apply an operation reported by the transport
    pub async fn drive(self: &Arc<Self>, account_id: &AccountId, op: RegistrationOperation) -> CallCoreResult<()> {
        let slot = self.entry(account_id)?;
        let _order = slot.order.lock().await;
        match op {
            RegistrationOperation::Failed(reason) => self.fail(&slot, reason).await,
            op => {
                let status = slot.account.lock().apply(op)?;
                self.observers.dispatch(&status).await;
                Ok(())
            }
        }
    }

    async fn attempt(self: &Arc<Self>, account_id: &AccountId, manual: bool) -> CallCoreResult<()> {
        let slot = self.entry(account_id)?;
        let config = {
            let _order = slot.order.lock().await;
            let (status, config) = {
                let mut account = slot.account.lock();
                if manual {
                    account.reset_failures();
                }
                let status = account.registration_progress()?;
                (status, account.config.clone())
            };
            self.observers.dispatch(&status).await;
            config
        };

        let target = RequestTarget::Account(account_id.clone());
        let sent = self
            .transport
            .send_request(&target, SignalingRequest::Register { account: config })
            .await
            .and_then(RequestOutcome::into_result);

        if let Err(e) = sent {
            warn!(account_id = %account_id, error = %e, "REGISTER could not be sent");
            let _order = slot.order.lock().await;
            // the transport may have reported an outcome while sending
            let still_pending = slot.account.lock().state() == RegistrationState::Progress;
            if still_pending {
                self.fail(&slot, e.to_string()).await?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Mark the account `Failed`. Called with the account's order lock held.
    async fn fail(self: &Arc<Self>, slot: &AccountSlot, reason: String) -> CallCoreResult<()> {
        let (status, failures) = {
            let mut account = slot.account.lock();
            let status = account.registration_failed(reason)?;
            (status, account.consecutive_failures())
        };
        self.observers.dispatch(&status).await;
        self.schedule_retry(status.account_id.clone(), failures);
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, account_id: AccountId, failures: u32) {
        let Some(retry) = self.retry.clone() else {
            return;
        };
        if failures >= retry.max_attempts {
            warn!(
                account_id = %account_id,
                attempts = failures,
                "Registration failed after all retry attempts"
            );
            return;
        }

        let delay = retry.delay_for_attempt(failures);
        // Weak so a pending retry does not keep the manager alive
        let manager = Arc::downgrade(self);
        debug!(account_id = %account_id, attempt = failures + 1, delay_ms = delay.as_millis() as u64, "Scheduling registration retry");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Only retry if nothing else moved the account in the meantime
            match manager.state(&account_id).await {
                Ok(RegistrationState::Failed) => {}
                _ => return,
            }
            if let Err(e) = manager.attempt(&account_id, false).await {
                debug!(account_id = %account_id, error = %e, "Registration retry attempt failed");
            }
        });
    }

    fn entry(&self, account_id: &AccountId) -> CallCoreResult<Arc<AccountSlot>> {
        self.accounts
            .get(account_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CallCoreError::AccountNotFound {
                account_id: account_id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> RegistrationAccount {
        let config = AccountConfig::new("alice", "secret", "example.com");
        RegistrationAccount::new(config.account_id(), config)
    }

    #[test]
    fn test_fail_then_retry_ends_ok() {
        let mut acc = account();
        acc.registration_progress().unwrap();
        acc.registration_failed("408 Request Timeout").unwrap();
        assert_eq!(acc.consecutive_failures(), 1);
        acc.registration_progress().unwrap();
        let status = acc.registration_ok().unwrap();

        assert_eq!(acc.state(), RegistrationState::Ok);
        assert_eq!(status.previous_state, Some(RegistrationState::Progress));
        assert_eq!(acc.consecutive_failures(), 0);
        assert!(acc.last_error().is_none());
    }

    #[test]
    fn test_reset_failures_keeps_state() {
        let mut acc = account();
        acc.registration_progress().unwrap();
        acc.registration_failed("503 Service Unavailable").unwrap();
        acc.reset_failures();

        assert_eq!(acc.consecutive_failures(), 0);
        assert_eq!(acc.state(), RegistrationState::Failed);
        assert_eq!(acc.last_error(), Some("503 Service Unavailable"));
    }

    #[test]
    fn test_ok_requires_progress() {
        let mut acc = account();
        let err = acc.registration_ok().unwrap_err();
        assert!(matches!(
            err,
            CallCoreError::RegistrationOrderingViolation { state: RegistrationState::None, .. }
        ));
        assert_eq!(acc.state(), RegistrationState::None);
        assert!(acc.last_error().is_some());
    }

    #[test]
    fn test_cleared_from_ok_and_progress_only() {
        let mut acc = account();
        assert!(acc.registration_cleared().is_err());
        acc.registration_progress().unwrap();
        acc.registration_cleared().unwrap();
        assert!(acc.registration_cleared().is_err());
        acc.registration_progress().unwrap();
        acc.registration_ok().unwrap();
        acc.registration_cleared().unwrap();
        assert_eq!(acc.state(), RegistrationState::Cleared);
    }

    #[test]
    fn test_none_is_never_reentered() {
        for state in [
            RegistrationState::None,
            RegistrationState::Progress,
            RegistrationState::Ok,
            RegistrationState::Cleared,
            RegistrationState::Failed,
        ] {
            assert!(!state.can_transition_to(RegistrationState::None));
            assert!(state.can_transition_to(RegistrationState::Progress));
        }
    }

    #[test]
    fn test_failed_only_from_progress() {
        let mut acc = account();
        assert!(acc.registration_failed("boom").is_err());
        acc.registration_progress().unwrap();
        acc.registration_ok().unwrap();
        assert!(acc.registration_failed("boom").is_err());
        assert_eq!(acc.state(), RegistrationState::Ok);
    }

    #[test]
    fn test_account_config_validation() {
        assert!(AccountConfig::new("", "pw", "example.com").validate().is_err());
        assert!(AccountConfig::new("bob", "pw", " ").validate().is_err());
        assert!(AccountConfig::new("bob", "pw", "example.com").with_expires(0).validate().is_err());
        let config = AccountConfig::new("bob", "pw", "example.com");
        assert_eq!(config.account_id(), AccountId::from("bob@example.com"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let config = AccountConfig::new("bob", "hunter2", "example.com");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        let back: AccountConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.username, "bob");
        assert!(back.password.is_empty());
    }
}
