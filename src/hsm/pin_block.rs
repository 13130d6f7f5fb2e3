//! PIN Block Engine - ISO 9564-1 Format 0/1 assembly, encryption and
//! translation. State-free; key material is borrowed from the Key Store
//! for the duration of each operation only.

use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto;
use crate::hsm::errors::{HsmError, InputViolation};
use crate::keystore::KeyStore;
use crate::types::{KeyAlgorithm, TraceStep};

pub fn validate_pin(pin: &str) -> Result<(), HsmError> {
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(HsmError::InvalidInput(InputViolation::PinNotNumeric));
    }
    if pin.len() < 4 || pin.len() > 12 {
        return Err(HsmError::InvalidInput(InputViolation::PinLength {
            len: pin.len(),
        }));
    }
    Ok(())
}

pub fn validate_pan(pan: &str) -> Result<(), HsmError> {
    if !pan.chars().all(|c| c.is_ascii_digit()) {
        return Err(HsmError::InvalidInput(InputViolation::Pan {
            reason: "PAN must contain only decimal digits",
        }));
    }
    if pan.len() < 13 {
        return Err(HsmError::InvalidInput(InputViolation::Pan {
            reason: "PAN shorter than 13 digits",
        }));
    }
    if pan.len() > 19 {
        return Err(HsmError::InvalidInput(InputViolation::Pan {
            reason: "PAN longer than 19 digits",
        }));
    }
    Ok(())
}

/// PAN field for Format 0: four zero nibbles followed by the rightmost 12
/// PAN digits excluding the check digit
fn pan_field(pan: &str) -> String {
    let body = &pan[..pan.len() - 1];
    let start = body.len().saturating_sub(12);
    format!("0000{}", &body[start..])
}

fn decode_block(field: &'static str, hex_str: &str) -> Result<[u8; 8], HsmError> {
    let bytes =
        hex::decode(hex_str).map_err(|_| HsmError::InvalidInput(InputViolation::NotHex { field }))?;
    bytes
        .try_into()
        .map_err(|_| HsmError::InvalidInput(InputViolation::BlockAlignment { field, block: 8 }))
}

/// Build the clear ISO 9564-1 Format 0 PIN block: the PIN field
/// `0 | len | PIN | F..F` XORed with the PAN field
pub fn build_format0(pin: &str, pan: &str) -> Result<([u8; 8], Vec<TraceStep>), HsmError> {
    validate_pin(pin)?;
    validate_pan(pan)?;
    let mut trace = Vec::new();

    let mut pin_field = format!("0{:X}{}", pin.len(), pin);
    while pin_field.len() < 16 {
        pin_field.push('F');
    }
    trace.push(TraceStep::new(
        "Format PIN",
        "PIN field: control nibble 0, length nibble, PIN digits, F filler",
        pin,
        &pin_field,
    ));

    let pan_field = pan_field(pan);
    trace.push(TraceStep::new(
        "Format PAN",
        "PAN field: 0000 plus rightmost 12 PAN digits excluding check digit",
        pan,
        &pan_field,
    ));

    let pin_block = decode_block("pin", &pin_field)?;
    let pan_block = decode_block("pan", &pan_field)?;
    let clear = crypto::xor_block(pin_block, pan_block);
    trace.push(TraceStep::new(
        "XOR Fields",
        "XOR PIN field with PAN field to form the clear PIN block",
        format!("{} ^ {}", pin_field, pan_field),
        hex::encode_upper(clear),
    ));

    Ok((clear, trace))
}

/// Build the clear Format 1 PIN block: `1 | len | PIN | random filler`.
/// No PAN binding; explicitly weaker and only used on request.
pub fn build_format1(pin: &str) -> Result<([u8; 8], Vec<TraceStep>), HsmError> {
    validate_pin(pin)?;

    let mut field = format!("1{:X}{}", pin.len(), pin);
    while field.len() < 16 {
        let nibble = (OsRng.next_u32() & 0x0F) as u8;
        field.push(char::from_digit(nibble as u32, 16).expect("nibble").to_ascii_uppercase());
    }

    let clear = decode_block("pin", &field)?;
    let trace = vec![TraceStep::new(
        "Format 1 Construction",
        "PIN field: control nibble 1, length nibble, PIN digits, random filler (no PAN binding)",
        pin,
        &field,
    )];
    Ok((clear, trace))
}

/// Recover the PIN from a clear Format 0 block by reversing the XOR and
/// parsing the length nibble
pub fn recover_format0(clear: [u8; 8], pan: &str) -> Result<(String, Vec<TraceStep>), HsmError> {
    validate_pan(pan)?;
    let mut trace = Vec::new();

    let pan_field = pan_field(pan);
    let pan_block = decode_block("pan", &pan_field)?;
    let pin_field = crypto::xor_block(clear, pan_block);
    let pin_hex = hex::encode_upper(pin_field);
    trace.push(TraceStep::new(
        "Reverse XOR",
        "XOR the clear block with the PAN field to recover the PIN field",
        format!("{} ^ {}", hex::encode_upper(clear), pan_field),
        &pin_hex,
    ));

    let not_format0 = || {
        HsmError::InvalidInput(InputViolation::Malformed {
            detail: "recovered block is not a valid Format 0 PIN block".to_string(),
        })
    };

    let chars: Vec<char> = pin_hex.chars().collect();
    if chars[0] != '0' {
        return Err(not_format0());
    }
    let len = chars[1].to_digit(16).ok_or_else(not_format0)? as usize;
    if !(4..=12).contains(&len) {
        return Err(not_format0());
    }
    let pin: String = chars[2..2 + len].iter().collect();
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(not_format0());
    }
    trace.push(TraceStep::new(
        "Extract PIN",
        format!("Length nibble {} selects the PIN digits", len),
        &pin_hex,
        &pin,
    ));

    Ok((pin, trace))
}

fn require_des_family(
    algorithm: KeyAlgorithm,
    operation: &'static str,
) -> Result<(), HsmError> {
    if algorithm.is_des_family() {
        Ok(())
    } else {
        Err(HsmError::InvalidInput(
            InputViolation::UnsupportedKeyAlgorithm {
                algorithm,
                operation,
            },
        ))
    }
}

/// Encrypt a clear PIN block under the named key in single-block mode.
/// The PIN block is exactly one DES block; AES keys are refused.
pub fn encrypt_under(
    store: &KeyStore,
    key_label: &str,
    clear: [u8; 8],
) -> Result<([u8; 8], Vec<TraceStep>), HsmError> {
    store.with_material(key_label, |algorithm, material| {
        require_des_family(algorithm, "PIN block encryption")?;
        let encrypted = crypto::ecb_encrypt(algorithm, material, &clear)?;
        let step = TraceStep::new(
            "Encrypt PIN Block",
            format!("Single-block {} encryption under '{}'", algorithm, key_label),
            hex::encode_upper(clear),
            hex::encode_upper(&encrypted),
        );
        Ok((encrypted.try_into().expect("one block in, one block out"), vec![step]))
    })
}

/// Decrypt an encrypted PIN block under the named key
pub fn decrypt_under(
    store: &KeyStore,
    key_label: &str,
    encrypted: [u8; 8],
) -> Result<([u8; 8], Vec<TraceStep>), HsmError> {
    store.with_material(key_label, |algorithm, material| {
        require_des_family(algorithm, "PIN block decryption")?;
        let clear = crypto::ecb_decrypt(algorithm, material, &encrypted)?;
        let step = TraceStep::new(
            "Decrypt PIN Block",
            format!("Single-block {} decryption under '{}'", algorithm, key_label),
            hex::encode_upper(encrypted),
            hex::encode_upper(&clear),
        );
        Ok((clear.try_into().expect("one block in, one block out"), vec![step]))
    })
}

/// Decrypt ciphertext under the source key and re-encrypt under the
/// destination key. The clear data lives only in a wiped buffer inside
/// this call; the trace never shows it.
pub fn translate(
    store: &KeyStore,
    source_label: &str,
    dest_label: &str,
    data: &[u8],
) -> Result<(Vec<u8>, Vec<TraceStep>), HsmError> {
    if data.is_empty() || data.len() % 8 != 0 {
        return Err(HsmError::InvalidInput(InputViolation::BlockAlignment {
            field: "data",
            block: 8,
        }));
    }
    let mut trace = Vec::new();

    let clear = store.with_material(source_label, |algorithm, material| {
        require_des_family(algorithm, "data translation")?;
        let clear = zeroize::Zeroizing::new(crypto::ecb_decrypt(algorithm, material, data)?);
        trace.push(TraceStep::new(
            "Decrypt Under Source",
            format!("{} decryption under '{}'", algorithm, source_label),
            hex::encode_upper(data),
            format!("<{} clear bytes withheld>", clear.len()),
        ));
        Ok(clear)
    })?;

    let translated = store.with_material(dest_label, |algorithm, material| {
        require_des_family(algorithm, "data translation")?;
        let out = crypto::ecb_encrypt(algorithm, material, &clear)?;
        trace.push(TraceStep::new(
            "Encrypt Under Destination",
            format!("{} encryption under '{}'", algorithm, dest_label),
            format!("<{} clear bytes withheld>", clear.len()),
            hex::encode_upper(&out),
        ));
        Ok(out)
    })?;

    Ok((translated, trace))
}
