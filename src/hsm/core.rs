//! Payment HSM firmware core.
//!
//! `PaymentHsm` is the explicitly constructed device context: it owns the
//! key store, the tamper controller, the vulnerability policy layer and
//! the audit trail, and dispatches the fixed command table. Tests build
//! independent instances; there is no process-wide singleton.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::audit::{AuditEvent, AuditLogger};
use crate::hsm::errors::{CommandError, HsmError, InputViolation};
use crate::hsm::tamper::{TamperController, TamperMonitor, TamperReason};
use crate::hsm::{cvv, mac, pin_block};
use crate::keystore::{KeyMetadata, KeyStore};
use crate::types::{
    CommandCode, CommandResponse, CommandTelemetry, CvvGenerateRequest, DeviceStatus,
    KeyAlgorithm, KeyTranslateRequest, KeyType, MacAlgorithm, MacGenerateRequest,
    MacVerifyRequest, PinBlockFormat, PinEncryptRequest, TraceStep,
};
use crate::vuln::{PolicyLayer, VulnerabilityConfig};

fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, HsmError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        HsmError::InvalidInput(InputViolation::Malformed {
            detail: e.to_string(),
        })
    })
}

fn decode_hex_field(field: &'static str, value: &str) -> Result<Vec<u8>, HsmError> {
    hex::decode(value).map_err(|_| HsmError::InvalidInput(InputViolation::NotHex { field }))
}

/// The simulated HSM firmware. One instance per simulated device.
pub struct PaymentHsm {
    device_id: String,
    keystore: Arc<KeyStore>,
    tamper: TamperController,
    policy: PolicyLayer,
    audit: AuditLogger,
    started_at: DateTime<Utc>,
    command_count: AtomicU64,
    last_command: Mutex<Option<CommandTelemetry>>,
}

impl PaymentHsm {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_policy(device_id, VulnerabilityConfig::default())
    }

    pub fn with_policy(device_id: impl Into<String>, config: VulnerabilityConfig) -> Self {
        let device_id = device_id.into();
        let keystore = Arc::new(KeyStore::new());
        let audit = AuditLogger::new();
        audit.record(AuditEvent::Startup {
            device_id: device_id.clone(),
        });
        Self {
            tamper: TamperController::new(keystore.clone()),
            keystore,
            policy: PolicyLayer::new(config),
            audit,
            device_id,
            started_at: Utc::now(),
            command_count: AtomicU64::new(0),
            last_command: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    // ========================================================================
    // Command surface
    // ========================================================================

    /// Execute one host command. The vulnerability policy wraps the
    /// dispatch; the tamper gate runs before any key material is touched.
    pub fn execute(&self, code: &str, payload: Value) -> Result<CommandResponse, CommandError> {
        let started = Instant::now();
        let outcome = self.dispatch(code, &payload);

        let telemetry = CommandTelemetry {
            code: code.to_string(),
            at: Utc::now(),
            duration_us: started.elapsed().as_micros() as u64,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.wire_code().to_string()),
        };
        self.command_count.fetch_add(1, Ordering::Relaxed);
        self.audit.record(AuditEvent::CommandExecuted {
            code: telemetry.code.clone(),
            success: telemetry.success,
            error: telemetry.error.clone(),
        });
        *self.last_command.lock().expect("telemetry lock poisoned") = Some(telemetry);

        outcome.map_err(|error| self.policy.decorate_error(&error))
    }

    fn dispatch(&self, code: &str, payload: &Value) -> Result<CommandResponse, HsmError> {
        self.policy.pre_dispatch(code, payload, &self.audit)?;

        if let Some(reason) = self.tamper.poll_monitors() {
            self.record_tamper(&reason);
        }
        if self.tamper.is_tampered() {
            return Err(HsmError::TamperFault);
        }

        let command = CommandCode::parse(code).ok_or_else(|| HsmError::UnknownCommand {
            code: code.to_string(),
        })?;

        match command {
            CommandCode::PinBlockEncrypt => self.encrypt_pin_block(payload),
            CommandCode::MacGenerate => self.generate_mac(payload),
            CommandCode::MacVerify => self.verify_mac(payload),
            CommandCode::KeyTranslate => self.translate_data(payload),
            CommandCode::CvvGenerate => self.generate_cvv(payload),
        }
    }

    fn encrypt_pin_block(&self, payload: &Value) -> Result<CommandResponse, HsmError> {
        let request: PinEncryptRequest = parse_payload(payload)?;
        let format = match request.format.unwrap_or(0) {
            0 => PinBlockFormat::Format0,
            1 => PinBlockFormat::Format1,
            other => {
                return Err(HsmError::InvalidInput(InputViolation::UnknownPinFormat {
                    supplied: other,
                }));
            }
        };

        let (clear, mut trace) = match format {
            PinBlockFormat::Format0 => pin_block::build_format0(&request.pin, &request.pan)?,
            PinBlockFormat::Format1 => pin_block::build_format1(&request.pin)?,
        };
        let (encrypted, encrypt_trace) =
            pin_block::encrypt_under(&self.keystore, &request.key_label, clear)?;
        trace.extend(encrypt_trace);

        Ok(CommandResponse {
            command_code: CommandCode::PinBlockEncrypt.code().to_string(),
            result: json!({
                "pinBlock": hex::encode_upper(encrypted),
                "format": format.number(),
                "keyLabel": request.key_label,
            }),
            trace,
        })
    }

    fn parse_mac_algorithm(name: &str) -> Result<MacAlgorithm, HsmError> {
        MacAlgorithm::parse(name).ok_or_else(|| {
            HsmError::InvalidInput(InputViolation::UnknownMacAlgorithm {
                supplied: name.to_string(),
            })
        })
    }

    fn generate_mac(&self, payload: &Value) -> Result<CommandResponse, HsmError> {
        let request: MacGenerateRequest = parse_payload(payload)?;
        let algorithm = Self::parse_mac_algorithm(&request.algorithm)?;
        let (data, encoding) = mac::parse_data(&request.data);

        let mut trace = vec![TraceStep::new(
            "Parse Input",
            "Interpret the data field",
            &request.data,
            format!("{} bytes ({})", data.len(), encoding),
        )];
        let (mac_bytes, mac_trace) =
            mac::generate(&self.keystore, &request.key_label, algorithm, &data)?;
        trace.extend(mac_trace);

        Ok(CommandResponse {
            command_code: CommandCode::MacGenerate.code().to_string(),
            result: json!({
                "mac": hex::encode_upper(mac_bytes),
                "keyLabel": request.key_label,
                "algorithm": algorithm.as_str(),
                "inputEncoding": encoding,
            }),
            trace,
        })
    }

    fn verify_mac(&self, payload: &Value) -> Result<CommandResponse, HsmError> {
        let request: MacVerifyRequest = parse_payload(payload)?;
        let algorithm = Self::parse_mac_algorithm(&request.algorithm)?;
        let supplied_mac = decode_hex_field("mac", &request.mac)?;
        let (data, encoding) = mac::parse_data(&request.data);

        let mut trace = vec![TraceStep::new(
            "Parse Input",
            "Interpret the data field",
            &request.data,
            format!("{} bytes ({})", data.len(), encoding),
        )];
        let (verified, verify_trace) = mac::verify(
            &self.keystore,
            &request.key_label,
            algorithm,
            &data,
            &supplied_mac,
        )?;
        trace.extend(verify_trace);

        Ok(CommandResponse {
            command_code: CommandCode::MacVerify.code().to_string(),
            result: json!({
                "verified": verified,
                "keyLabel": request.key_label,
                "algorithm": algorithm.as_str(),
            }),
            trace,
        })
    }

    fn translate_data(&self, payload: &Value) -> Result<CommandResponse, HsmError> {
        let request: KeyTranslateRequest = parse_payload(payload)?;
        let data = decode_hex_field("data", &request.data)?;
        let (translated, trace) = pin_block::translate(
            &self.keystore,
            &request.source_key_label,
            &request.dest_key_label,
            &data,
        )?;

        Ok(CommandResponse {
            command_code: CommandCode::KeyTranslate.code().to_string(),
            result: json!({
                "translatedData": hex::encode_upper(&translated),
                "sourceKeyLabel": request.source_key_label,
                "destKeyLabel": request.dest_key_label,
                "blocks": translated.len() / 8,
            }),
            trace,
        })
    }

    fn generate_cvv(&self, payload: &Value) -> Result<CommandResponse, HsmError> {
        let request: CvvGenerateRequest = parse_payload(payload)?;
        let (cvv, trace) = cvv::generate(
            &self.keystore,
            &request.key_label,
            &request.pan,
            &request.expiry,
            &request.service_code,
        )?;

        Ok(CommandResponse {
            command_code: CommandCode::CvvGenerate.code().to_string(),
            result: json!({
                "cvv": cvv,
                "expiry": request.expiry,
                "serviceCode": request.service_code,
                "keyLabel": request.key_label,
            }),
            trace,
        })
    }

    // ========================================================================
    // Key administration surface
    // ========================================================================

    fn fail_closed(&self) -> Result<(), HsmError> {
        if self.tamper.is_tampered() {
            Err(HsmError::TamperFault)
        } else {
            Ok(())
        }
    }

    pub fn generate_key(
        &self,
        label: &str,
        key_type: KeyType,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyMetadata, HsmError> {
        self.fail_closed()?;
        let meta = self.keystore.generate(label, key_type, algorithm)?;
        self.audit.record(AuditEvent::KeyGenerated {
            label: meta.label.clone(),
            check_value: meta.check_value.clone(),
        });
        Ok(meta)
    }

    /// Import caller material. The low-entropy check is skipped only when
    /// the vulnerability policy enables weak keys.
    pub fn import_key(
        &self,
        label: &str,
        key_type: KeyType,
        algorithm: KeyAlgorithm,
        material_hex: &str,
    ) -> Result<KeyMetadata, HsmError> {
        self.fail_closed()?;
        let allow_weak = self.policy.config().weak_keys_enabled;
        let meta = self
            .keystore
            .import(label, key_type, algorithm, material_hex, allow_weak)?;
        self.audit.record(AuditEvent::KeyImported {
            label: meta.label.clone(),
            check_value: meta.check_value.clone(),
        });
        Ok(meta)
    }

    pub fn list_keys(&self) -> Vec<KeyMetadata> {
        self.keystore.list()
    }

    pub fn key_metadata(&self, label: &str) -> Result<KeyMetadata, HsmError> {
        self.keystore.metadata(label)
    }

    pub fn rotate_key(&self, label: &str) -> Result<KeyMetadata, HsmError> {
        self.fail_closed()?;
        let meta = self.keystore.rotate(label)?;
        self.audit.record(AuditEvent::KeyRotated {
            from: meta.rotated_from.clone().unwrap_or_default(),
            to: meta.label.clone(),
        });
        Ok(meta)
    }

    pub fn destroy_key(&self, label: &str) -> Result<(), HsmError> {
        self.fail_closed()?;
        self.keystore.destroy(label)?;
        self.audit.record(AuditEvent::KeyDestroyed {
            label: label.trim().to_uppercase(),
        });
        Ok(())
    }

    /// Load the simulator's default key set
    pub fn provision_test_keys(&self) -> Result<Vec<KeyMetadata>, HsmError> {
        self.fail_closed()?;
        let allow_weak = self.policy.config().weak_keys_enabled;
        let provisioned = self.keystore.provision_test_keys(allow_weak)?;
        for meta in &provisioned {
            self.audit.record(AuditEvent::KeyImported {
                label: meta.label.clone(),
                check_value: meta.check_value.clone(),
            });
        }
        Ok(provisioned)
    }

    // ========================================================================
    // Operator surface
    // ========================================================================

    pub fn vuln_config(&self) -> VulnerabilityConfig {
        self.policy.config()
    }

    pub fn set_vuln_config(&self, config: VulnerabilityConfig) {
        self.policy.set_config(config);
        self.audit.record(AuditEvent::PolicyChanged {
            flags: config.summary(),
        });
    }

    pub fn register_monitor(&self, monitor: Box<dyn TamperMonitor>) {
        self.tamper.register_monitor(monitor);
    }

    /// Assert the tamper line. Zeroizes every key before returning.
    pub fn trigger_tamper(&self, reason: TamperReason) {
        if self.tamper.trigger(reason.clone()) {
            self.record_tamper(&reason);
        }
    }

    fn record_tamper(&self, reason: &TamperReason) {
        let keys_zeroized = self
            .tamper
            .event()
            .map(|event| event.keys_zeroized)
            .unwrap_or(0);
        self.audit.record(AuditEvent::TamperTriggered {
            reason: reason.to_string(),
        });
        self.audit.record(AuditEvent::MassZeroization {
            keys_destroyed: keys_zeroized,
        });
    }

    pub fn is_tampered(&self) -> bool {
        self.tamper.is_tampered()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id.clone(),
            state: self.tamper.state(),
            uptime_secs: Utc::now()
                .signed_duration_since(self.started_at)
                .num_seconds(),
            keys_loaded: self.keystore.active_count(),
            command_count: self.command_count.load(Ordering::Relaxed),
            last_command: self
                .last_command
                .lock()
                .expect("telemetry lock poisoned")
                .clone(),
        }
    }
}
