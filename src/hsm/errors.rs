use serde::Serialize;
use std::fmt;

use crate::types::{KeyAlgorithm, KeyStatus};

/// Reasons a request payload is rejected before any key material is touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputViolation {
    /// PIN outside 4-12 digits
    PinLength { len: usize },
    /// PIN contains a non-decimal character
    PinNotNumeric,
    /// PAN outside 13-19 decimal digits
    Pan { reason: &'static str },
    /// A field that must be hex-encoded is not
    NotHex { field: &'static str },
    /// Material or MAC length does not match what the operation needs
    KeyLength { expected: usize, actual: usize },
    /// The named key's cipher family cannot serve this operation
    UnsupportedKeyAlgorithm {
        algorithm: KeyAlgorithm,
        operation: &'static str,
    },
    /// Data is not aligned to the cipher block size
    BlockAlignment { field: &'static str, block: usize },
    /// Imported material failed the low-entropy check
    WeakKey,
    /// MAC algorithm selector is not ALG1/ALG3
    UnknownMacAlgorithm { supplied: String },
    /// PIN block format number is not 0/1
    UnknownPinFormat { supplied: u8 },
    /// Expiry is not 4 digits (YYMM)
    Expiry,
    /// Service code is not 3 digits
    ServiceCode,
    /// Payload failed structural deserialization
    Malformed { detail: String },
}

impl fmt::Display for InputViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputViolation::PinLength { len } => {
                write!(f, "PIN length {} outside 4-12 digits", len)
            }
            InputViolation::PinNotNumeric => write!(f, "PIN must contain only decimal digits"),
            InputViolation::Pan { reason } => write!(f, "invalid PAN: {}", reason),
            InputViolation::NotHex { field } => {
                write!(f, "field '{}' must be hex-encoded", field)
            }
            InputViolation::KeyLength { expected, actual } => {
                write!(f, "key length {} does not match expected {}", actual, expected)
            }
            InputViolation::UnsupportedKeyAlgorithm {
                algorithm,
                operation,
            } => write!(f, "{} keys cannot serve {}", algorithm, operation),
            InputViolation::BlockAlignment { field, block } => {
                write!(f, "field '{}' must be a multiple of {} bytes", field, block)
            }
            InputViolation::WeakKey => write!(f, "key material rejected as low-entropy"),
            InputViolation::UnknownMacAlgorithm { supplied } => {
                write!(f, "MAC algorithm '{}' is not ALG1 or ALG3", supplied)
            }
            InputViolation::UnknownPinFormat { supplied } => {
                write!(f, "PIN block format {} is not supported", supplied)
            }
            InputViolation::Expiry => write!(f, "expiry must be 4 digits (YYMM)"),
            InputViolation::ServiceCode => write!(f, "service code must be 3 digits"),
            InputViolation::Malformed { detail } => write!(f, "malformed payload: {}", detail),
        }
    }
}

/// Error taxonomy of the command core. Handlers surface these unchanged
/// through the dispatcher; only the policy layer decides how much detail
/// crosses the command surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsmError {
    /// No key under the label
    KeyNotFound { label: String },
    /// Label already taken, including suspended/destroyed tombstones
    DuplicateLabel { label: String },
    /// Key exists but is not ACTIVE; its material is not served
    KeyNotActive { label: String, status: KeyStatus },
    /// Request rejected before touching key material
    InvalidInput(InputViolation),
    /// Device is TAMPERED; all key material is gone. Never recoverable
    /// within the process.
    TamperFault,
    /// Command code is not in the dispatch table
    UnknownCommand { code: String },
    /// A previously seen nonce was replayed
    ReplayDetected { nonce: u64 },
}

impl HsmError {
    /// Stable machine-readable code for the command surface
    pub fn wire_code(&self) -> &'static str {
        match self {
            HsmError::KeyNotFound { .. } => "NOT_FOUND",
            HsmError::DuplicateLabel { .. } => "DUPLICATE_LABEL",
            HsmError::KeyNotActive { .. } => "INVALID_KEY",
            HsmError::InvalidInput(_) => "INVALID_INPUT",
            HsmError::TamperFault => "TAMPER_FAULT",
            HsmError::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            HsmError::ReplayDetected { .. } => "REPLAY_DETECTED",
        }
    }

    /// Message safe to return without `verbose_errors`: names the error
    /// class and caller-supplied identifiers, nothing internal.
    pub fn sanitized_message(&self) -> String {
        match self {
            HsmError::KeyNotFound { label } => format!("key '{}' not found", label),
            HsmError::DuplicateLabel { label } => format!("key '{}' already exists", label),
            HsmError::KeyNotActive { label, .. } => format!("key '{}' is not usable", label),
            HsmError::InvalidInput(_) => "invalid input".to_string(),
            HsmError::TamperFault => "device tampered: key material zeroized".to_string(),
            HsmError::UnknownCommand { code } => format!("unknown command code '{}'", code),
            HsmError::ReplayDetected { .. } => "replay detected".to_string(),
        }
    }
}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HsmError::KeyNotFound { label } => write!(f, "key '{}' not found", label),
            HsmError::DuplicateLabel { label } => {
                write!(f, "label '{}' already exists", label)
            }
            HsmError::KeyNotActive { label, status } => {
                write!(f, "key '{}' is {} and cannot be used", label, status)
            }
            HsmError::InvalidInput(violation) => write!(f, "invalid input: {}", violation),
            HsmError::TamperFault => {
                write!(f, "device is TAMPERED; all key material has been zeroized")
            }
            HsmError::UnknownCommand { code } => write!(f, "unknown command code '{}'", code),
            HsmError::ReplayDetected { nonce } => {
                write!(f, "replay detected: nonce {} already seen", nonce)
            }
        }
    }
}

/// Error as it crosses the command surface. `detail` is only populated when
/// the vulnerability policy enables verbose errors.
#[derive(Debug, Clone, Serialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandError {
    pub fn from_hsm_error(error: &HsmError, verbose: bool) -> Self {
        Self {
            code: error.wire_code().to_string(),
            message: error.sanitized_message(),
            detail: if verbose {
                Some(error.to_string())
            } else {
                None
            },
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "[{}] {} ({})", self.code, self.message, detail),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}
