//! CVV Engine - Visa-style card verification values. The CVK is a 16-byte
//! double-length DES key; its halves act as CVK-A and CVK-B.

use crate::crypto;
use crate::hsm::errors::{HsmError, InputViolation};
use crate::hsm::pin_block::validate_pan;
use crate::keystore::KeyStore;
use crate::types::TraceStep;

fn validate_expiry(expiry: &str) -> Result<(), HsmError> {
    if expiry.len() != 4 || !expiry.chars().all(|c| c.is_ascii_digit()) {
        return Err(HsmError::InvalidInput(InputViolation::Expiry));
    }
    Ok(())
}

fn validate_service_code(service_code: &str) -> Result<(), HsmError> {
    if service_code.len() != 3 || !service_code.chars().all(|c| c.is_ascii_digit()) {
        return Err(HsmError::InvalidInput(InputViolation::ServiceCode));
    }
    Ok(())
}

fn split_cvk(material: &[u8]) -> Result<([u8; 8], [u8; 8]), HsmError> {
    if material.len() != 16 {
        return Err(HsmError::InvalidInput(InputViolation::KeyLength {
            expected: 16,
            actual: material.len(),
        }));
    }
    let cvk_a: [u8; 8] = material[..8].try_into().expect("length matched");
    let cvk_b: [u8; 8] = material[8..].try_into().expect("length matched");
    Ok((cvk_a, cvk_b))
}

/// Two-pass decimalization: keep decimal digits left to right, then map
/// A-F to 0-5 until three digits are assembled
fn decimalize(digest_hex: &str) -> String {
    let mut cvv = String::new();
    for c in digest_hex.chars() {
        if c.is_ascii_digit() && cvv.len() < 3 {
            cvv.push(c);
        }
    }
    if cvv.len() < 3 {
        for c in digest_hex.chars() {
            if ('A'..='F').contains(&c) && cvv.len() < 3 {
                let mapped = c.to_digit(16).expect("hex digit") - 10;
                cvv.push(char::from_digit(mapped, 10).expect("0-5"));
            }
        }
    }
    cvv
}

fn masked_pan(pan: &str) -> String {
    format!("{}******{}", &pan[..6], &pan[pan.len() - 4..])
}

/// Derive the CVV for (PAN, expiry, service code) under the named CVK
pub fn generate(
    store: &KeyStore,
    key_label: &str,
    pan: &str,
    expiry: &str,
    service_code: &str,
) -> Result<(String, Vec<TraceStep>), HsmError> {
    validate_pan(pan)?;
    validate_expiry(expiry)?;
    validate_service_code(service_code)?;

    store.with_material(key_label, |algorithm, material| {
        if !algorithm.is_des_family() {
            return Err(HsmError::InvalidInput(
                InputViolation::UnsupportedKeyAlgorithm {
                    algorithm,
                    operation: "CVV generation",
                },
            ));
        }
        let (cvk_a, cvk_b) = split_cvk(material)?;
        let mut trace = Vec::new();

        let mut data = format!("{}{}{}", pan, expiry, service_code);
        while data.len() < 32 {
            data.push('0');
        }
        trace.push(TraceStep::new(
            "Assemble Validation Data",
            "PAN + expiry + service code, zero-padded to 32 hex characters",
            format!("{} {} {}", masked_pan(pan), expiry, service_code),
            &data,
        ));

        let block1: [u8; 8] = hex::decode(&data[..16])
            .map_err(|_| HsmError::InvalidInput(InputViolation::NotHex { field: "pan" }))?
            .try_into()
            .expect("16 hex chars");
        let block2: [u8; 8] = hex::decode(&data[16..32])
            .map_err(|_| HsmError::InvalidInput(InputViolation::NotHex { field: "pan" }))?
            .try_into()
            .expect("16 hex chars");

        let encrypted1 = crypto::des_encrypt_block(&cvk_a, block1);
        trace.push(TraceStep::new(
            "Encrypt Block 1",
            "Single-DES encryption of the first block under CVK-A",
            &data[..16],
            hex::encode_upper(encrypted1),
        ));

        let xored = crypto::xor_block(encrypted1, block2);
        trace.push(TraceStep::new(
            "XOR Block 2",
            "XOR the result with the second block",
            format!("{} ^ {}", hex::encode_upper(encrypted1), &data[16..32]),
            hex::encode_upper(xored),
        ));

        let digest = crypto::des_encrypt_block(
            &cvk_a,
            crypto::des_decrypt_block(&cvk_b, crypto::des_encrypt_block(&cvk_a, xored)),
        );
        let digest_hex = hex::encode_upper(digest);
        trace.push(TraceStep::new(
            "Retail Transform",
            "Encrypt under CVK-A, decrypt under CVK-B, encrypt under CVK-A",
            hex::encode_upper(xored),
            &digest_hex,
        ));

        let cvv = decimalize(&digest_hex);
        trace.push(TraceStep::new(
            "Decimalize",
            "First pass keeps 0-9; second pass maps A-F to 0-5",
            &digest_hex,
            &cvv,
        ));

        Ok((cvv, trace))
    })
}
