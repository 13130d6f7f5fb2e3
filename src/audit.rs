//! In-memory, hash-chained audit trail.
//!
//! Each entry carries the hash of its predecessor, so editing or deleting
//! an entry is detectable with `verify_chain`. Persistence is out of
//! scope; the trail lives and dies with the device instance. This is also
//! the diagnostic sink the `key_leak_in_logs` vulnerability leaks into.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Mutex;

/// Security-relevant events recorded by the firmware
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AuditEvent {
    /// Device booted and entered OPERATIONAL
    Startup { device_id: String },

    /// A host command finished
    CommandExecuted {
        code: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A key was created with fresh random material
    KeyGenerated { label: String, check_value: String },

    /// A key was imported from caller-supplied material
    KeyImported { label: String, check_value: String },

    /// A key was rotated; the prior key is suspended
    KeyRotated { from: String, to: String },

    /// A single key was zeroized and destroyed
    KeyDestroyed { label: String },

    /// Every key was zeroized
    MassZeroization { keys_destroyed: usize },

    /// The device tripped into the TAMPERED fail state
    TamperTriggered { reason: String },

    /// Vulnerability policy flags changed
    PolicyChanged { flags: String },

    /// Deliberate diagnostic leak: a raw request body containing
    /// sensitive material was written to the log (`key_leak_in_logs`)
    SensitiveMaterialLeak { command: String, payload: String },
}

/// One tamper-evident log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub prev_hash: String,
    pub entry_hash: String,
}

fn entry_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    event: &AuditEvent,
    prev_hash: &str,
) -> String {
    let event_json = serde_json::to_string(event).expect("audit events serialize");
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(event_json.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only audit logger. One per device instance.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        let mut entries = self.entries.lock().expect("audit lock poisoned");
        let sequence = entries.len() as u64;
        let prev_hash = entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_default();
        let timestamp = Utc::now();
        let hash = entry_hash(sequence, &timestamp, &event, &prev_hash);
        entries.push(AuditEntry {
            sequence,
            timestamp,
            event,
            prev_hash,
            entry_hash: hash,
        });
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every hash link; false means the trail was edited
    pub fn verify_chain(&self) -> bool {
        let entries = self.entries.lock().expect("audit lock poisoned");
        let mut prev_hash = String::new();
        for entry in entries.iter() {
            if entry.prev_hash != prev_hash {
                return false;
            }
            let expected =
                entry_hash(entry.sequence, &entry.timestamp, &entry.event, &entry.prev_hash);
            if entry.entry_hash != expected {
                return false;
            }
            prev_hash = entry.entry_hash.clone();
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn forge_last_entry(&self) {
        let mut entries = self.entries.lock().expect("audit lock poisoned");
        if let Some(last) = entries.last_mut() {
            last.event = AuditEvent::Startup {
                device_id: "forged".to_string(),
            };
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}
