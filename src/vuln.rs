//! Vulnerability Policy Layer.
//!
//! The training simulator can selectively break named protocol guarantees.
//! The cryptographic engine stays correct; this layer in front of the
//! dispatcher is the only place a weakness is switched on, and every flag
//! defaults to off.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use crate::audit::{AuditEvent, AuditLogger};
use crate::hsm::errors::{CommandError, HsmError};

/// Payload fields whose presence marks a request body as sensitive enough
/// for the diagnostic leak
const SENSITIVE_FIELDS: [&str; 4] = ["pin", "material", "clearKey", "keyLabel"];

/// Operator-facing switches. Each flag, when enabled, violates exactly one
/// guarantee of the secure engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityConfig {
    /// Key import accepts low-entropy material without rejection
    pub weak_keys_enabled: bool,
    /// Raw request bodies containing key material are written to the
    /// diagnostic log
    pub key_leak_in_logs: bool,
    /// Errors carry internal diagnostic detail instead of being sanitized
    pub verbose_errors: bool,
    /// The nonce replay guard is disabled
    pub allow_replay: bool,
}

impl Default for VulnerabilityConfig {
    /// Secure by default: every guarantee intact
    fn default() -> Self {
        Self {
            weak_keys_enabled: false,
            key_leak_in_logs: false,
            verbose_errors: false,
            allow_replay: false,
        }
    }
}

impl VulnerabilityConfig {
    /// Compact rendering for the audit trail
    pub fn summary(&self) -> String {
        format!(
            "weakKeys={} keyLeakInLogs={} verboseErrors={} allowReplay={}",
            self.weak_keys_enabled, self.key_leak_in_logs, self.verbose_errors, self.allow_replay
        )
    }
}

/// Sliding window of recently seen request nonces
struct ReplayGuard {
    window: VecDeque<u64>,
    window_size: usize,
}

impl ReplayGuard {
    fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn check_and_accept(&mut self, nonce: u64) -> Result<(), HsmError> {
        if self.window.contains(&nonce) {
            return Err(HsmError::ReplayDetected { nonce });
        }
        self.window.push_back(nonce);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        Ok(())
    }
}

/// Pass-through decorator in front of the dispatcher
pub struct PolicyLayer {
    config: RwLock<VulnerabilityConfig>,
    replay: Mutex<ReplayGuard>,
}

impl PolicyLayer {
    pub fn new(config: VulnerabilityConfig) -> Self {
        Self {
            config: RwLock::new(config),
            replay: Mutex::new(ReplayGuard::new(256)),
        }
    }

    pub fn config(&self) -> VulnerabilityConfig {
        *self.config.read().expect("policy lock poisoned")
    }

    pub fn set_config(&self, config: VulnerabilityConfig) {
        *self.config.write().expect("policy lock poisoned") = config;
    }

    /// Runs before the tamper gate: the diagnostic leak and the replay
    /// guard. A request without a nonce is not tracked.
    pub fn pre_dispatch(
        &self,
        code: &str,
        payload: &Value,
        audit: &AuditLogger,
    ) -> Result<(), HsmError> {
        let config = self.config();

        if config.key_leak_in_logs
            && SENSITIVE_FIELDS
                .iter()
                .any(|field| payload.get(field).is_some())
        {
            audit.record(AuditEvent::SensitiveMaterialLeak {
                command: code.to_string(),
                payload: payload.to_string(),
            });
        }

        if !config.allow_replay {
            if let Some(nonce) = payload.get("nonce").and_then(Value::as_u64) {
                self.replay
                    .lock()
                    .expect("policy lock poisoned")
                    .check_and_accept(nonce)?;
            }
        }

        Ok(())
    }

    /// Shape an internal error for the command surface: sanitized unless
    /// verbose errors are switched on
    pub fn decorate_error(&self, error: &HsmError) -> CommandError {
        CommandError::from_hsm_error(error, self.config().verbose_errors)
    }
}

impl Default for PolicyLayer {
    fn default() -> Self {
        Self::new(VulnerabilityConfig::default())
    }
}
