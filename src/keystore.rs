//! Key Store - custody and lifecycle of all cryptographic key material.
//!
//! Every mutation (generate, import, rotate, destroy, zeroize_all) runs
//! behind the single write lock; metadata reads are concurrent. Raw
//! material never leaves the store: protocol handlers borrow it through
//! [`KeyStore::with_material`], which holds the read lock for the duration
//! of the cryptographic work so a concurrent zeroization cannot interleave.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::hsm::errors::{HsmError, InputViolation};
use crate::types::{KeyAlgorithm, KeyStatus, KeyType};

/// Public view of a stored key. Never carries material; `check_value` is
/// the operator's verification fingerprint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub label: String,
    pub key_type: KeyType,
    pub algorithm: KeyAlgorithm,
    pub check_value: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
}

struct KeyRecord {
    meta: KeyMetadata,
    /// Wiped in place on destroy/zeroize and on drop
    material: Zeroizing<Vec<u8>>,
}

/// In-memory key custody. One per device instance.
pub struct KeyStore {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn normalize_label(label: &str) -> String {
        label.trim().to_uppercase()
    }

    /// Create a key with fresh random material of the length the algorithm
    /// implies. Fails with `DuplicateLabel` if the label is taken,
    /// including suspended and destroyed tombstones.
    pub fn generate(
        &self,
        label: &str,
        key_type: KeyType,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyMetadata, HsmError> {
        let material = crypto::generate_material(algorithm);
        self.insert(label, key_type, algorithm, material, None)
    }

    /// Import caller-supplied material (hex). Unless `allow_weak` is set by
    /// the vulnerability policy, low-entropy material is rejected.
    pub fn import(
        &self,
        label: &str,
        key_type: KeyType,
        algorithm: KeyAlgorithm,
        material_hex: &str,
        allow_weak: bool,
    ) -> Result<KeyMetadata, HsmError> {
        let decoded = hex::decode(material_hex).map_err(|_| {
            HsmError::InvalidInput(InputViolation::NotHex { field: "material" })
        })?;
        let material = Zeroizing::new(decoded);
        if material.len() != algorithm.key_len() {
            return Err(HsmError::InvalidInput(InputViolation::KeyLength {
                expected: algorithm.key_len(),
                actual: material.len(),
            }));
        }
        if !allow_weak && crypto::is_weak_material(algorithm, &material) {
            return Err(HsmError::InvalidInput(InputViolation::WeakKey));
        }
        self.insert(label, key_type, algorithm, material, None)
    }

    fn insert(
        &self,
        label: &str,
        key_type: KeyType,
        algorithm: KeyAlgorithm,
        material: Zeroizing<Vec<u8>>,
        rotated_from: Option<String>,
    ) -> Result<KeyMetadata, HsmError> {
        let label = Self::normalize_label(label);
        let check_value = crypto::check_value(algorithm, &material)?;

        let mut keys = self.keys.write().expect("keystore lock poisoned");
        if keys.contains_key(&label) {
            return Err(HsmError::DuplicateLabel { label });
        }

        let meta = KeyMetadata {
            label: label.clone(),
            key_type,
            algorithm,
            check_value,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            rotated_from,
        };
        keys.insert(label, KeyRecord {
            meta: meta.clone(),
            material,
        });
        Ok(meta)
    }

    /// Metadata for one key; material is never part of the answer
    pub fn metadata(&self, label: &str) -> Result<KeyMetadata, HsmError> {
        let label = Self::normalize_label(label);
        let keys = self.keys.read().expect("keystore lock poisoned");
        keys.get(&label)
            .map(|record| record.meta.clone())
            .ok_or(HsmError::KeyNotFound { label })
    }

    /// All key metadata, label-sorted for stable listings
    pub fn list(&self) -> Vec<KeyMetadata> {
        let keys = self.keys.read().expect("keystore lock poisoned");
        let mut out: Vec<KeyMetadata> = keys.values().map(|r| r.meta.clone()).collect();
        out.sort_by(|a, b| a.label.cmp(&b.label));
        out
    }

    /// Run `f` against the key's raw material under the store's read lock.
    /// Only ACTIVE keys are served; the borrow cannot outlive the call, so
    /// no handler holds material across a zeroization.
    pub fn with_material<R>(
        &self,
        label: &str,
        f: impl FnOnce(KeyAlgorithm, &[u8]) -> Result<R, HsmError>,
    ) -> Result<R, HsmError> {
        let label = Self::normalize_label(label);
        let keys = self.keys.read().expect("keystore lock poisoned");
        let record = keys
            .get(&label)
            .ok_or_else(|| HsmError::KeyNotFound {
                label: label.clone(),
            })?;
        if record.meta.status != KeyStatus::Active {
            return Err(HsmError::KeyNotActive {
                label,
                status: record.meta.status,
            });
        }
        f(record.meta.algorithm, &record.material)
    }

    /// Replace the key with a fresh one of identical type/algorithm under a
    /// derived label, suspending the prior key. Returns the new metadata.
    pub fn rotate(&self, label: &str) -> Result<KeyMetadata, HsmError> {
        let label = Self::normalize_label(label);
        let mut keys = self.keys.write().expect("keystore lock poisoned");

        let (key_type, algorithm) = {
            let record = keys.get(&label).ok_or_else(|| HsmError::KeyNotFound {
                label: label.clone(),
            })?;
            if record.meta.status != KeyStatus::Active {
                return Err(HsmError::KeyNotActive {
                    label,
                    status: record.meta.status,
                });
            }
            (record.meta.key_type, record.meta.algorithm)
        };

        let new_label = Self::rotation_label(&label, &keys);
        let material = crypto::generate_material(algorithm);
        let check_value = crypto::check_value(algorithm, &material)?;
        let meta = KeyMetadata {
            label: new_label.clone(),
            key_type,
            algorithm,
            check_value,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            rotated_from: Some(label.clone()),
        };
        keys.insert(new_label, KeyRecord {
            meta: meta.clone(),
            material,
        });

        if let Some(old) = keys.get_mut(&label) {
            old.meta.status = KeyStatus::Suspended;
        }
        Ok(meta)
    }

    /// Derive `{base}-V{n}` with the version suffix of the source label
    /// stripped, picking the first free slot
    fn rotation_label(label: &str, keys: &HashMap<String, KeyRecord>) -> String {
        let base = match label.rfind("-V") {
            Some(pos) if label[pos + 2..].chars().all(|c| c.is_ascii_digit()) => &label[..pos],
            _ => label,
        };
        let mut version = 2u32;
        loop {
            let candidate = format!("{}-V{}", base, version);
            if !keys.contains_key(&candidate) {
                return candidate;
            }
            version += 1;
        }
    }

    /// Zeroize the key's material in place and mark it DESTROYED.
    /// Destroying a DESTROYED key is a no-op, not an error.
    pub fn destroy(&self, label: &str) -> Result<(), HsmError> {
        let label = Self::normalize_label(label);
        let mut keys = self.keys.write().expect("keystore lock poisoned");
        let record = keys.get_mut(&label).ok_or(HsmError::KeyNotFound { label })?;
        if record.meta.status == KeyStatus::Destroyed {
            return Ok(());
        }
        record.material.zeroize();
        record.meta.status = KeyStatus::Destroyed;
        Ok(())
    }

    /// Destroy every key atomically under the single write lock. Used by
    /// the tamper controller; irreversible. Returns how many keys held
    /// material before the wipe.
    pub fn zeroize_all(&self) -> usize {
        let mut keys = self.keys.write().expect("keystore lock poisoned");
        let mut wiped = 0;
        for record in keys.values_mut() {
            if record.meta.status != KeyStatus::Destroyed {
                wiped += 1;
            }
            record.material.zeroize();
            record.meta.status = KeyStatus::Destroyed;
        }
        wiped
    }

    /// Number of keys currently serving material
    pub fn active_count(&self) -> usize {
        let keys = self.keys.read().expect("keystore lock poisoned");
        keys.values()
            .filter(|r| r.meta.status == KeyStatus::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.keys.read().expect("keystore lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the simulator's default key set (test provisioning only)
    pub fn provision_test_keys(&self, allow_weak: bool) -> Result<Vec<KeyMetadata>, HsmError> {
        let defaults: [(&str, KeyType, KeyAlgorithm, &str); 5] = [
            (
                "ZMK-TEST",
                KeyType::Zmk,
                KeyAlgorithm::TripleDes2,
                "0123456789ABCDEF0123456789ABCDEF",
            ),
            (
                "ZPK-TEST",
                KeyType::Zpk,
                KeyAlgorithm::TripleDes2,
                "00112233445566778899AABBCCDDEEFF",
            ),
            (
                "ZAK-TEST",
                KeyType::Zak,
                KeyAlgorithm::TripleDes2,
                "A1B2C3D4E5F6A7B8C9D0E1F2A3B4C5D6",
            ),
            (
                "CVK-TEST",
                KeyType::Cvk,
                KeyAlgorithm::TripleDes2,
                "0123456789ABCDEFFEDCBA9876543210",
            ),
            (
                "LMK-TEST",
                KeyType::Lmk,
                KeyAlgorithm::Aes256,
                "0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF",
            ),
        ];

        let mut provisioned = Vec::with_capacity(defaults.len());
        for (label, key_type, algorithm, material) in defaults {
            provisioned.push(self.import(label, key_type, algorithm, material, allow_weak)?);
        }
        Ok(provisioned)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_metadata() {
        let store = KeyStore::new();
        let meta = store
            .generate("zpk-001", KeyType::Zpk, KeyAlgorithm::TripleDes2)
            .unwrap();
        assert_eq!(meta.label, "ZPK-001");
        assert_eq!(meta.status, KeyStatus::Active);
        assert_eq!(meta.check_value.len(), 6);

        let fetched = store.metadata("ZPK-001").unwrap();
        assert_eq!(fetched.check_value, meta.check_value);
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let store = KeyStore::new();
        store
            .generate("ZPK-001", KeyType::Zpk, KeyAlgorithm::TripleDes2)
            .unwrap();
        let result = store.generate("zpk-001", KeyType::Zpk, KeyAlgorithm::TripleDes2);
        assert!(matches!(result, Err(HsmError::DuplicateLabel { .. })));
    }

    #[test]
    fn test_import_rejects_weak_material() {
        let store = KeyStore::new();
        let weak = "11111111111111111111111111111111";
        let result = store.import("ZPK-WEAK", KeyType::Zpk, KeyAlgorithm::TripleDes2, weak, false);
        assert_eq!(
            result.unwrap_err(),
            HsmError::InvalidInput(InputViolation::WeakKey)
        );

        // the policy layer can wave it through
        let meta = store
            .import("ZPK-WEAK", KeyType::Zpk, KeyAlgorithm::TripleDes2, weak, true)
            .unwrap();
        assert_eq!(meta.status, KeyStatus::Active);
    }

    #[test]
    fn test_import_rejects_wrong_length() {
        let store = KeyStore::new();
        let result = store.import(
            "ZPK-SHORT",
            KeyType::Zpk,
            KeyAlgorithm::TripleDes2,
            "0123456789ABCDEF",
            false,
        );
        assert!(matches!(
            result,
            Err(HsmError::InvalidInput(InputViolation::KeyLength {
                expected: 16,
                actual: 8
            }))
        ));
    }

    #[test]
    fn test_rotate_suspends_prior_key() {
        let store = KeyStore::new();
        let old = store
            .generate("ZPK-001", KeyType::Zpk, KeyAlgorithm::TripleDes2)
            .unwrap();
        let new = store.rotate("ZPK-001").unwrap();

        assert_eq!(new.label, "ZPK-001-V2");
        assert_eq!(new.key_type, KeyType::Zpk);
        assert_eq!(new.algorithm, KeyAlgorithm::TripleDes2);
        assert_eq!(new.rotated_from.as_deref(), Some("ZPK-001"));
        assert_ne!(new.check_value, old.check_value);

        let prior = store.metadata("ZPK-001").unwrap();
        assert_eq!(prior.status, KeyStatus::Suspended);

        // suspended keys no longer serve material
        let result = store.with_material("ZPK-001", |_, _| Ok(()));
        assert!(matches!(result, Err(HsmError::KeyNotActive { .. })));

        // rotating the rotated key continues the version chain
        let third = store.rotate("ZPK-001-V2").unwrap();
        assert_eq!(third.label, "ZPK-001-V3");
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let store = KeyStore::new();
        store
            .generate("ZPK-001", KeyType::Zpk, KeyAlgorithm::TripleDes2)
            .unwrap();
        store.destroy("ZPK-001").unwrap();
        store.destroy("ZPK-001").unwrap();

        let meta = store.metadata("ZPK-001").unwrap();
        assert_eq!(meta.status, KeyStatus::Destroyed);
        assert!(matches!(
            store.with_material("ZPK-001", |_, _| Ok(())),
            Err(HsmError::KeyNotActive { .. })
        ));
        assert!(matches!(
            store.destroy("ZPK-MISSING"),
            Err(HsmError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_zeroize_all_destroys_everything() {
        let store = KeyStore::new();
        store.provision_test_keys(false).unwrap();
        assert_eq!(store.active_count(), 5);

        let wiped = store.zeroize_all();
        assert_eq!(wiped, 5);
        assert_eq!(store.active_count(), 0);
        for meta in store.list() {
            assert_eq!(meta.status, KeyStatus::Destroyed);
        }
    }

    #[test]
    fn test_listing_never_contains_material() {
        let store = KeyStore::new();
        store.provision_test_keys(false).unwrap();
        for meta in store.list() {
            let serialized = serde_json::to_string(&meta).unwrap();
            assert!(!serialized.contains("material"));
            assert!(serialized.contains("checkValue"));
        }
    }

    #[test]
    fn test_known_kcv_for_default_cvk() {
        // KCV must be stable across repeated computation
        let store = KeyStore::new();
        store.provision_test_keys(false).unwrap();
        let first = store.metadata("CVK-TEST").unwrap().check_value;

        let other = KeyStore::new();
        other.provision_test_keys(false).unwrap();
        assert_eq!(first, other.metadata("CVK-TEST").unwrap().check_value);
    }
}
