//! Engine configuration
//!
//! ```rust
//! use rvoip_call_core::config::EngineConfig;
//! use rvoip_call_core::recovery::RetryConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::new()
//!     .with_auto_answer(Duration::from_millis(500))
//!     .with_voicemail("sip:voicemail@example.com")
//!     .with_registration_retry(RetryConfig::quick());
//!
//! assert!(config.validate().is_ok());
//! assert!(config.reject_when_busy);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallCoreError, CallCoreResult};
use crate::recovery::RetryConfig;

/// Answer incoming calls without user interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAnswer {
    /// Wait this long before answering; zero answers immediately
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decline incoming calls with `Busy` while another call is live
    pub reject_when_busy: bool,
    pub auto_answer: Option<AutoAnswer>,
    /// Voicemail address used when declined calls are redirected
    pub voicemail_uri: Option<String>,
    pub redirect_declined_to_voicemail: bool,
    /// Automatic re-registration after failures; disabled when `None`
    pub registration_retry: Option<RetryConfig>,
    /// Capacity of the transport event channel
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reject_when_busy: true,
            auto_answer: None,
            voicemail_uri: None,
            redirect_declined_to_voicemail: false,
            registration_retry: None,
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> CallCoreResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CallCoreError::invalid_configuration("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_reject_when_busy(mut self, reject: bool) -> Self {
        self.reject_when_busy = reject;
        self
    }

    pub fn with_auto_answer(mut self, delay: Duration) -> Self {
        self.auto_answer = Some(AutoAnswer { delay });
        self
    }

    /// Redirect declined calls to `uri`
    pub fn with_voicemail(mut self, uri: impl Into<String>) -> Self {
        self.voicemail_uri = Some(uri.into());
        self.redirect_declined_to_voicemail = true;
        self
    }

    pub fn with_registration_retry(mut self, retry: RetryConfig) -> Self {
        self.registration_retry = Some(retry);
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Redirect target for declined calls, if redirection is enabled
    pub fn decline_redirect(&self) -> Option<&str> {
        if self.redirect_declined_to_voicemail {
            self.voicemail_uri.as_deref()
        } else {
            None
        }
    }

    pub fn validate(&self) -> CallCoreResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(CallCoreError::invalid_configuration(
                "event_channel_capacity",
                "must be greater than zero",
            ));
        }
        if self.redirect_declined_to_voicemail {
            match self.voicemail_uri.as_deref() {
                Some(uri) if !uri.trim().is_empty() => {}
                _ => {
                    return Err(CallCoreError::invalid_configuration(
                        "voicemail_uri",
                        "required when redirect_declined_to_voicemail is set",
                    ))
                }
            }
        }
        if let Some(retry) = &self.registration_retry {
            retry.validate()?;
        }
        Ok(())
    }
}
