use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key-hierarchy role of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Local Master Key
    #[serde(rename = "LMK")]
    Lmk,
    /// Zone Master Key
    #[serde(rename = "ZMK")]
    Zmk,
    /// Zone PIN Key
    #[serde(rename = "ZPK")]
    Zpk,
    /// Zone Authentication (MAC) Key
    #[serde(rename = "ZAK")]
    Zak,
    /// Card Verification Key
    #[serde(rename = "CVK")]
    Cvk,
    /// Key Encrypting Key
    #[serde(rename = "KEK")]
    Kek,
    /// Data Encrypting Key
    #[serde(rename = "DEK")]
    Dek,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Lmk => "LMK",
            KeyType::Zmk => "ZMK",
            KeyType::Zpk => "ZPK",
            KeyType::Zak => "ZAK",
            KeyType::Cvk => "CVK",
            KeyType::Kek => "KEK",
            KeyType::Dek => "DEK",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cipher family and key length of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Single-length DES (8 bytes)
    #[serde(rename = "DES")]
    Des,
    /// Double-length 3DES (16 bytes), the common payment key size
    #[serde(rename = "3DES")]
    TripleDes2,
    /// Triple-length 3DES (24 bytes)
    #[serde(rename = "3DES-3KEY")]
    TripleDes3,
    #[serde(rename = "AES-128")]
    Aes128,
    #[serde(rename = "AES-256")]
    Aes256,
}

impl KeyAlgorithm {
    /// Raw key material length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            KeyAlgorithm::Des => 8,
            KeyAlgorithm::TripleDes2 => 16,
            KeyAlgorithm::TripleDes3 => 24,
            KeyAlgorithm::Aes128 => 16,
            KeyAlgorithm::Aes256 => 32,
        }
    }

    /// Cipher block size in bytes
    pub fn block_len(&self) -> usize {
        match self {
            KeyAlgorithm::Des | KeyAlgorithm::TripleDes2 | KeyAlgorithm::TripleDes3 => 8,
            KeyAlgorithm::Aes128 | KeyAlgorithm::Aes256 => 16,
        }
    }

    /// DES-family keys carry odd parity and operate on 8-byte blocks
    pub fn is_des_family(&self) -> bool {
        matches!(
            self,
            KeyAlgorithm::Des | KeyAlgorithm::TripleDes2 | KeyAlgorithm::TripleDes3
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Des => "DES",
            KeyAlgorithm::TripleDes2 => "3DES",
            KeyAlgorithm::TripleDes3 => "3DES-3KEY",
            KeyAlgorithm::Aes128 => "AES-128",
            KeyAlgorithm::Aes256 => "AES-256",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    /// Key is usable by protocol handlers
    Active,
    /// Key was rotated out; metadata remains, material is no longer served
    Suspended,
    /// Material has been zeroized; terminal
    Destroyed,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "ACTIVE"),
            KeyStatus::Suspended => write!(f, "SUSPENDED"),
            KeyStatus::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// Process-wide device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Operational,
    /// Terminal: all key material has been zeroized, no recovery in-process
    Tampered,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Operational => write!(f, "OPERATIONAL"),
            DeviceState::Tampered => write!(f, "TAMPERED"),
        }
    }
}

/// Closed set of host command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// B4 - encrypt a PIN block under a ZPK
    PinBlockEncrypt,
    /// C0 - generate an ISO 9797-1 MAC
    MacGenerate,
    /// C2 - verify an ISO 9797-1 MAC
    MacVerify,
    /// A6 - translate key-encrypted data between zone keys
    KeyTranslate,
    /// D4 - generate a card verification value
    CvvGenerate,
}

impl CommandCode {
    /// Map a wire code to a command; unmapped codes are rejected by the dispatcher
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "B4" => Some(CommandCode::PinBlockEncrypt),
            "C0" => Some(CommandCode::MacGenerate),
            "C2" => Some(CommandCode::MacVerify),
            "A6" => Some(CommandCode::KeyTranslate),
            "D4" => Some(CommandCode::CvvGenerate),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CommandCode::PinBlockEncrypt => "B4",
            CommandCode::MacGenerate => "C0",
            CommandCode::MacVerify => "C2",
            CommandCode::KeyTranslate => "A6",
            CommandCode::CvvGenerate => "D4",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// ISO 9564-1 PIN block formats supported by the PIN engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinBlockFormat {
    /// Format 0: PIN field XORed with the PAN field
    Format0,
    /// Format 1: PIN field with random filler, no PAN binding
    Format1,
}

impl PinBlockFormat {
    pub fn number(&self) -> u8 {
        match self {
            PinBlockFormat::Format0 => 0,
            PinBlockFormat::Format1 => 1,
        }
    }
}

/// ISO 9797-1 MAC algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// Algorithm 1: single-key DES CBC-MAC
    Alg1,
    /// Algorithm 3: Retail MAC with a two-key final step
    Alg3,
}

impl MacAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ALG1" => Some(MacAlgorithm::Alg1),
            "ALG3" => Some(MacAlgorithm::Alg3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MacAlgorithm::Alg1 => "ALG1",
            MacAlgorithm::Alg3 => "ALG3",
        }
    }
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One explanatory step in a command trace. Traces justify every
/// transformation the engine applies and are order-stable for identical
/// inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStep {
    pub name: String,
    pub detail: String,
    pub input: String,
    pub output: String,
}

impl TraceStep {
    pub fn new(
        name: impl Into<String>,
        detail: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            detail: detail.into(),
            input: input.into(),
            output: output.into(),
        }
    }
}

// ============================================================================
// Command payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinEncryptRequest {
    pub pin: String,
    pub pan: String,
    /// PIN block format number; defaults to Format 0
    #[serde(default)]
    pub format: Option<u8>,
    pub key_label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacGenerateRequest {
    pub data: String,
    pub key_label: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacVerifyRequest {
    pub data: String,
    pub mac: String,
    pub key_label: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyTranslateRequest {
    pub source_key_label: String,
    pub dest_key_label: String,
    /// Hex-encoded ciphertext, aligned to the cipher block size
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvvGenerateRequest {
    pub pan: String,
    pub expiry: String,
    pub service_code: String,
    pub key_label: String,
}

// ============================================================================
// Command responses and device telemetry
// ============================================================================

/// Successful command result: payload plus the full transformation trace
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_code: String,
    pub result: serde_json::Value,
    pub trace: Vec<TraceStep>,
}

/// Record of the most recent command execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTelemetry {
    pub code: String,
    pub at: DateTime<Utc>,
    pub duration_us: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator-facing device snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub state: DeviceState,
    pub uptime_secs: i64,
    pub keys_loaded: usize,
    pub command_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command: Option<CommandTelemetry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_code_round_trip() {
        for code in ["B4", "C0", "C2", "A6", "D4"] {
            let parsed = CommandCode::parse(code).expect("known code");
            assert_eq!(parsed.code(), code);
        }
        assert!(CommandCode::parse("ZZ").is_none());
    }

    #[test]
    fn test_key_algorithm_lengths() {
        assert_eq!(KeyAlgorithm::Des.key_len(), 8);
        assert_eq!(KeyAlgorithm::TripleDes2.key_len(), 16);
        assert_eq!(KeyAlgorithm::TripleDes3.key_len(), 24);
        assert_eq!(KeyAlgorithm::Aes128.key_len(), 16);
        assert_eq!(KeyAlgorithm::Aes256.key_len(), 32);
        assert_eq!(KeyAlgorithm::TripleDes2.block_len(), 8);
        assert_eq!(KeyAlgorithm::Aes256.block_len(), 16);
    }

    #[test]
    fn test_payload_deserialization() {
        let payload = serde_json::json!({
            "pin": "1234",
            "pan": "4111111111111111",
            "keyLabel": "ZPK-TEST"
        });
        let req: PinEncryptRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(req.pin, "1234");
        assert_eq!(req.format, None);
        assert_eq!(req.key_label, "ZPK-TEST");
    }
}
