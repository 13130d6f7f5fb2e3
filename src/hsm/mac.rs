//! MAC Engine - ISO 9797-1 Algorithm 1 (single-key CBC-MAC) and
//! Algorithm 3 (Retail MAC). DES is the block cipher; the retail final
//! step exists to resist truncation/extension attacks on a plain CBC-MAC.

use subtle::ConstantTimeEq;

use crate::crypto;
use crate::hsm::errors::{HsmError, InputViolation};
use crate::keystore::KeyStore;
use crate::types::{MacAlgorithm, TraceStep};

const BLOCK: usize = 8;

/// ISO 9797-1 padding method 2: always append 0x80, zero-fill to the next
/// multiple of the block size
pub fn pad(data: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + BLOCK);
    padded.extend_from_slice(data);
    padded.push(0x80);
    while padded.len() % BLOCK != 0 {
        padded.push(0x00);
    }
    padded
}

/// Split stored material into the two single-DES keys of the retail
/// construction. A 16-byte double-length key splits in half; an 8-byte key
/// degenerates to A = B (test-fixture behavior).
fn split_keys(material: &[u8]) -> Result<([u8; 8], [u8; 8]), HsmError> {
    match material.len() {
        8 => {
            let k: [u8; 8] = material.try_into().expect("length matched");
            Ok((k, k))
        }
        16 => {
            let ka: [u8; 8] = material[..8].try_into().expect("length matched");
            let kb: [u8; 8] = material[8..].try_into().expect("length matched");
            Ok((ka, kb))
        }
        other => Err(HsmError::InvalidInput(InputViolation::KeyLength {
            expected: 16,
            actual: other,
        })),
    }
}

fn cbc_chain(key_a: &[u8; 8], padded: &[u8]) -> [u8; 8] {
    let mut state = [0u8; 8];
    for chunk in padded.chunks(BLOCK) {
        let block: [u8; 8] = chunk.try_into().expect("padded to block size");
        state = crypto::des_encrypt_block(key_a, crypto::xor_block(state, block));
    }
    state
}

/// Interpret the caller's data field: even-length hex decodes as hex,
/// anything else is taken as UTF-8 bytes. Returns the bytes and the name
/// of the chosen encoding for the trace.
pub fn parse_data(data: &str) -> (Vec<u8>, &'static str) {
    if !data.is_empty() && data.len() % 2 == 0 {
        if let Ok(bytes) = hex::decode(data) {
            return (bytes, "hex");
        }
    }
    (data.as_bytes().to_vec(), "utf8")
}

/// Compute the MAC over `data` with the named key
pub fn generate(
    store: &KeyStore,
    key_label: &str,
    algorithm: MacAlgorithm,
    data: &[u8],
) -> Result<([u8; 8], Vec<TraceStep>), HsmError> {
    store.with_material(key_label, |key_algorithm, material| {
        if !key_algorithm.is_des_family() {
            return Err(HsmError::InvalidInput(
                InputViolation::UnsupportedKeyAlgorithm {
                    algorithm: key_algorithm,
                    operation: "MAC computation",
                },
            ));
        }
        let mut trace = Vec::new();

        let (key_a, key_b) = split_keys(material)?;
        trace.push(TraceStep::new(
            "Key Split",
            "Derive single-DES keys A and B from the stored key",
            format!("'{}' ({} bytes)", key_label, material.len()),
            "KA, KB (withheld)",
        ));

        let padded = pad(data);
        trace.push(TraceStep::new(
            "Padding",
            "ISO 9797-1 method 2: append 0x80 then zero-fill to a block boundary",
            format!("{} bytes", data.len()),
            format!("{} bytes ({} blocks)", padded.len(), padded.len() / BLOCK),
        ));

        let chained = cbc_chain(&key_a, &padded);
        trace.push(TraceStep::new(
            "CBC Chain",
            "Chain every block through single-DES CBC under key A",
            format!("{} blocks", padded.len() / BLOCK),
            hex::encode_upper(chained),
        ));

        let mac = match algorithm {
            MacAlgorithm::Alg1 => chained,
            MacAlgorithm::Alg3 => {
                let decrypted = crypto::des_decrypt_block(&key_b, chained);
                let mac = crypto::des_encrypt_block(&key_a, decrypted);
                trace.push(TraceStep::new(
                    "Retail Final Step",
                    "Decrypt under key B then encrypt under key A",
                    hex::encode_upper(chained),
                    hex::encode_upper(mac),
                ));
                mac
            }
        };

        Ok((mac, trace))
    })
}

/// Recompute the MAC and compare against the supplied value with a
/// constant-time, equal-length scan
pub fn verify(
    store: &KeyStore,
    key_label: &str,
    algorithm: MacAlgorithm,
    data: &[u8],
    supplied_mac: &[u8],
) -> Result<(bool, Vec<TraceStep>), HsmError> {
    let (expected, mut trace) = generate(store, key_label, algorithm, data)?;

    let verified = supplied_mac.len() == expected.len()
        && bool::from(expected.as_slice().ct_eq(supplied_mac));
    trace.push(TraceStep::new(
        "Constant-Time Compare",
        "Equal-length scan that does not short-circuit on the first mismatch",
        hex::encode_upper(supplied_mac),
        if verified { "match" } else { "mismatch" },
    ));

    Ok((verified, trace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyAlgorithm, KeyType};

    fn store_with_zak() -> KeyStore {
        let store = KeyStore::new();
        store
            .import(
                "ZAK-TEST",
                KeyType::Zak,
                KeyAlgorithm::TripleDes2,
                "A1B2C3D4E5F6A7B8C9D0E1F2A3B4C5D6",
                false,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_padding_always_appends_delimiter() {
        assert_eq!(pad(b"").len(), 8);
        assert_eq!(pad(b"1234567").len(), 8);
        // a full block still gains a whole padding block
        assert_eq!(pad(b"12345678").len(), 16);
        let padded = pad(b"abc");
        assert_eq!(&padded[..3], b"abc");
        assert_eq!(padded[3], 0x80);
        assert!(padded[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_alg3_is_deterministic() {
        let store = store_with_zak();
        let (first, _) =
            generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"Transaction data").unwrap();
        let (second, _) =
            generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"Transaction data").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_bit_change_changes_mac() {
        let store = store_with_zak();
        let mut data = b"Transaction data".to_vec();
        let (original, _) = generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, &data).unwrap();
        data[0] ^= 0x01;
        let (flipped, _) = generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, &data).unwrap();
        assert_ne!(original, flipped);
    }

    #[test]
    fn test_alg1_and_alg3_differ() {
        let store = store_with_zak();
        let (alg1, _) = generate(&store, "ZAK-TEST", MacAlgorithm::Alg1, b"payload").unwrap();
        let (alg3, _) = generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"payload").unwrap();
        assert_ne!(alg1, alg3);
    }

    #[test]
    fn test_single_length_key_degenerates() {
        // with an 8-byte key, A = B and the retail step collapses into the
        // plain CBC-MAC
        let store = KeyStore::new();
        store
            .import(
                "ZAK-SINGLE",
                KeyType::Zak,
                KeyAlgorithm::Des,
                "FEDCBA9876543210",
                false,
            )
            .unwrap();
        let (alg1, _) = generate(&store, "ZAK-SINGLE", MacAlgorithm::Alg1, b"payload").unwrap();
        let (alg3, _) = generate(&store, "ZAK-SINGLE", MacAlgorithm::Alg3, b"payload").unwrap();
        assert_eq!(alg1, alg3);
    }

    #[test]
    fn test_verify_round_trip() {
        let store = store_with_zak();
        let (mac, _) = generate(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"settle batch 42").unwrap();

        let (verified, _) =
            verify(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"settle batch 42", &mac).unwrap();
        assert!(verified);

        let mut wrong = mac;
        wrong[7] ^= 0xFF;
        let (verified, _) =
            verify(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"settle batch 42", &wrong).unwrap();
        assert!(!verified);

        // a truncated MAC never verifies
        let (verified, _) =
            verify(&store, "ZAK-TEST", MacAlgorithm::Alg3, b"settle batch 42", &mac[..4]).unwrap();
        assert!(!verified);
    }

    #[test]
    fn test_triple_length_key_rejected() {
        let store = KeyStore::new();
        store
            .generate("ZAK-LONG", KeyType::Zak, KeyAlgorithm::TripleDes3)
            .unwrap();
        assert!(matches!(
            generate(&store, "ZAK-LONG", MacAlgorithm::Alg3, b"data"),
            Err(HsmError::InvalidInput(InputViolation::KeyLength {
                expected: 16,
                actual: 24
            }))
        ));
    }

    #[test]
    fn test_parse_data_encodings() {
        let (bytes, encoding) = parse_data("FEDCBA9876543210");
        assert_eq!(encoding, "hex");
        assert_eq!(bytes.len(), 8);

        let (bytes, encoding) = parse_data("Transaction data");
        assert_eq!(encoding, "utf8");
        assert_eq!(bytes, b"Transaction data");
    }
}
