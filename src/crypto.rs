//! Block-cipher wrappers for the protocol engines.
//!
//! The payment protocols compose DES, two/three-key 3DES and AES as black
//! boxes in raw single-block (ECB) mode; this module is the only place the
//! RustCrypto cipher types appear.

use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use des::{Des, TdesEde2, TdesEde3};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::hsm::errors::{HsmError, InputViolation};
use crate::types::KeyAlgorithm;

/// Known single-DES weak keys (odd parity applied)
const DES_WEAK_KEYS: [[u8; 8]; 4] = [
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE],
    [0xE0, 0xE0, 0xE0, 0xE0, 0xF1, 0xF1, 0xF1, 0xF1],
    [0x1F, 0x1F, 0x1F, 0x1F, 0x0E, 0x0E, 0x0E, 0x0E],
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum EcbOp {
    Encrypt,
    Decrypt,
}

fn run_ecb<C>(key: &[u8], data: &mut [u8], op: EcbOp)
where
    C: BlockEncrypt + BlockDecrypt + KeyInit,
{
    let cipher = C::new_from_slice(key).expect("key length validated by caller");
    let block_size = C::block_size();
    for chunk in data.chunks_mut(block_size) {
        let block = GenericArray::from_mut_slice(chunk);
        match op {
            EcbOp::Encrypt => cipher.encrypt_block(block),
            EcbOp::Decrypt => cipher.decrypt_block(block),
        }
    }
}

fn ecb(
    algorithm: KeyAlgorithm,
    key: &[u8],
    data: &[u8],
    op: EcbOp,
) -> Result<Vec<u8>, HsmError> {
    if key.len() != algorithm.key_len() {
        return Err(HsmError::InvalidInput(InputViolation::KeyLength {
            expected: algorithm.key_len(),
            actual: key.len(),
        }));
    }
    let block = algorithm.block_len();
    if data.is_empty() || data.len() % block != 0 {
        return Err(HsmError::InvalidInput(InputViolation::BlockAlignment {
            field: "data",
            block,
        }));
    }

    let mut out = data.to_vec();
    match algorithm {
        KeyAlgorithm::Des => run_ecb::<Des>(key, &mut out, op),
        KeyAlgorithm::TripleDes2 => run_ecb::<TdesEde2>(key, &mut out, op),
        KeyAlgorithm::TripleDes3 => run_ecb::<TdesEde3>(key, &mut out, op),
        KeyAlgorithm::Aes128 => run_ecb::<Aes128>(key, &mut out, op),
        KeyAlgorithm::Aes256 => run_ecb::<Aes256>(key, &mut out, op),
    }
    Ok(out)
}

/// Encrypt whole blocks under the key's native cipher, no padding
pub fn ecb_encrypt(
    algorithm: KeyAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, HsmError> {
    ecb(algorithm, key, data, EcbOp::Encrypt)
}

/// Decrypt whole blocks under the key's native cipher, no padding
pub fn ecb_decrypt(
    algorithm: KeyAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, HsmError> {
    ecb(algorithm, key, data, EcbOp::Decrypt)
}

/// Single-DES encryption of one 8-byte block under an 8-byte key.
/// Building block for the CBC chains in the MAC and CVV engines.
pub(crate) fn des_encrypt_block(key: &[u8; 8], block: [u8; 8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("8-byte DES key");
    let mut out = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Single-DES decryption of one 8-byte block under an 8-byte key
pub(crate) fn des_decrypt_block(key: &[u8; 8], block: [u8; 8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("8-byte DES key");
    let mut out = GenericArray::clone_from_slice(&block);
    cipher.decrypt_block(&mut out);
    out.into()
}

/// Byte-wise XOR of two 8-byte blocks
pub(crate) fn xor_block(a: [u8; 8], b: [u8; 8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Key Check Value: encrypt an all-zero block under the key's native
/// cipher, keep the first 3 ciphertext bytes as 6 uppercase hex characters.
/// Lets an operator confirm a key was entered or derived correctly without
/// exposing the key.
pub fn check_value(algorithm: KeyAlgorithm, key: &[u8]) -> Result<String, HsmError> {
    let zeros = vec![0u8; algorithm.block_len()];
    let encrypted = ecb_encrypt(algorithm, key, &zeros)?;
    Ok(hex::encode_upper(&encrypted[..3]))
}

/// Set every byte of a DES-family key to odd parity
pub fn apply_odd_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        if byte.count_ones() % 2 == 0 {
            *byte ^= 1;
        }
    }
}

/// Fresh random key material of the length the algorithm implies.
/// DES-family material is parity-adjusted.
pub fn generate_material(algorithm: KeyAlgorithm) -> Zeroizing<Vec<u8>> {
    let mut material = Zeroizing::new(vec![0u8; algorithm.key_len()]);
    OsRng.fill_bytes(&mut material);
    if algorithm.is_des_family() {
        apply_odd_parity(&mut material);
    }
    material
}

/// Low-entropy detection for imported material: a single repeated byte, or
/// any DES-family 8-byte component matching a known weak key.
pub fn is_weak_material(algorithm: KeyAlgorithm, material: &[u8]) -> bool {
    let first = material[0];
    if material.iter().all(|b| *b == first) {
        return true;
    }
    if algorithm.is_des_family() {
        for component in material.chunks(8) {
            if DES_WEAK_KEYS.iter().any(|weak| weak == component) {
                return true;
            }
        }
    }
    false
}
