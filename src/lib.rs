pub mod audit;
pub mod crypto;
pub mod hsm;
pub mod keystore;
pub mod types;
pub mod vuln;

pub use audit::{AuditEntry, AuditEvent, AuditLogger};
pub use hsm::core::PaymentHsm;
pub use hsm::errors::{CommandError, HsmError, InputViolation};
pub use hsm::tamper::{ClockRegressionMonitor, TamperEvent, TamperMonitor, TamperReason};
pub use keystore::{KeyMetadata, KeyStore};
pub use types::{
    CommandCode, CommandResponse, CommandTelemetry, DeviceState, DeviceStatus, KeyAlgorithm,
    KeyStatus, KeyType, MacAlgorithm, PinBlockFormat, TraceStep,
};
pub use vuln::{PolicyLayer, VulnerabilityConfig};
