//! Tamper / Fail-State Controller.
//!
//! OPERATIONAL transitions to TAMPERED exactly once per process lifetime;
//! the transition zeroizes every key before `trigger` returns. Monitors
//! are pluggable and polled at dispatch time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::keystore::KeyStore;
use crate::types::DeviceState;

/// Why the device tripped into the fail state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TamperReason {
    /// Operator or test asserted the tamper line
    ManualTrigger,
    /// Wall clock moved backwards further than the monitor tolerates
    ClockSkew { regression_secs: i64 },
    /// A self-check found the firmware or state inconsistent
    IntegrityCheckFailed { detail: String },
}

impl fmt::Display for TamperReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TamperReason::ManualTrigger => write!(f, "manual trigger"),
            TamperReason::ClockSkew { regression_secs } => {
                write!(f, "clock moved backwards by {}s", regression_secs)
            }
            TamperReason::IntegrityCheckFailed { detail } => {
                write!(f, "integrity self-check failed: {}", detail)
            }
        }
    }
}

/// The recorded tamper transition
#[derive(Debug, Clone, Serialize)]
pub struct TamperEvent {
    pub reason: TamperReason,
    pub at: DateTime<Utc>,
    /// How many keys held material when the wipe ran
    pub keys_zeroized: usize,
}

/// A pluggable tamper detector, polled before each dispatch
pub trait TamperMonitor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Return a reason to trip the device, or None when all is well
    fn check(&self) -> Option<TamperReason>;
}

/// Trips when the wall clock regresses beyond the allowed skew between
/// two observations
pub struct ClockRegressionMonitor {
    last_seen: Mutex<DateTime<Utc>>,
    max_regression_secs: i64,
}

impl ClockRegressionMonitor {
    pub fn new(max_regression_secs: i64) -> Self {
        Self {
            last_seen: Mutex::new(Utc::now()),
            max_regression_secs,
        }
    }
}

impl TamperMonitor for ClockRegressionMonitor {
    fn name(&self) -> &'static str {
        "clock-regression"
    }

    fn check(&self) -> Option<TamperReason> {
        let now = Utc::now();
        let mut last_seen = self.last_seen.lock().expect("monitor lock poisoned");
        let regression = last_seen.signed_duration_since(now).num_seconds();
        if regression > self.max_regression_secs {
            return Some(TamperReason::ClockSkew {
                regression_secs: regression,
            });
        }
        if now > *last_seen {
            *last_seen = now;
        }
        None
    }
}

/// Gate in front of the dispatcher. Owns the irreversible state machine
/// and the mass-zeroization side effect.
pub struct TamperController {
    keystore: Arc<KeyStore>,
    tampered: AtomicBool,
    event: Mutex<Option<TamperEvent>>,
    monitors: Mutex<Vec<Box<dyn TamperMonitor>>>,
}

impl TamperController {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self {
            keystore,
            tampered: AtomicBool::new(false),
            event: Mutex::new(None),
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn is_tampered(&self) -> bool {
        self.tampered.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeviceState {
        if self.is_tampered() {
            DeviceState::Tampered
        } else {
            DeviceState::Operational
        }
    }

    /// Flip to TAMPERED and zeroize every key before returning. Only the
    /// first call performs the transition; the return value says whether
    /// this call did.
    pub fn trigger(&self, reason: TamperReason) -> bool {
        if self.tampered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let keys_zeroized = self.keystore.zeroize_all();
        let mut event = self.event.lock().expect("tamper lock poisoned");
        *event = Some(TamperEvent {
            reason,
            at: Utc::now(),
            keys_zeroized,
        });
        true
    }

    pub fn register_monitor(&self, monitor: Box<dyn TamperMonitor>) {
        self.monitors
            .lock()
            .expect("tamper lock poisoned")
            .push(monitor);
    }

    /// Poll every monitor; the first tripped one triggers the transition.
    /// Returns the reason when this poll performed the transition.
    pub fn poll_monitors(&self) -> Option<TamperReason> {
        if self.is_tampered() {
            return None;
        }
        let tripped = {
            let monitors = self.monitors.lock().expect("tamper lock poisoned");
            monitors.iter().find_map(|m| m.check())
        };
        match tripped {
            Some(reason) if self.trigger(reason.clone()) => Some(reason),
            _ => None,
        }
    }

    pub fn event(&self) -> Option<TamperEvent> {
        self.event.lock().expect("tamper lock poisoned").clone()
    }
}
