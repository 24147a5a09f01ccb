//! Nested-HMAC key derivation used throughout V-MESS.
//!
//! V-MESS derives every subkey (AuthID AES key, response header AEAD
//! key/IV, per-direction request/response AEAD keys) through a recursive
//! HMAC-of-HMAC construction: the outermost HMAC-SHA256 is keyed by the
//! literal string `"VMess AEAD KDF"`; each path element then builds a new
//! HMAC keyed by that element, but using the *previous HMAC instance* in
//! place of the underlying hash primitive, rather than SHA-256 directly.
//! The final key is obtained by running the resulting nested hash once
//! more over the real input key material.
//!
//! This is not a simple `HMAC(prev_result, segment)` chain, and it cannot
//! be expressed through the `hmac` crate's `SimpleHmac<D: Digest>` API
//! (which fixes the hash at the type level to a concrete `Digest`). It is
//! hand-rolled here directly against SHA-256's 64-byte block size as the
//! one unavoidable exception to using the crate's HMAC type; every other
//! keyed hash in this codebase still goes through `hmac`/`sha2`.

use sha2::{Digest, Sha256};

const ROOT_SALT: &[u8] = b"VMess AEAD KDF";
const BLOCK_SIZE: usize = 64;
const OUTPUT_SIZE: usize = 32;

fn sha256_hash(data: &[u8]) -> [u8; OUTPUT_SIZE] {
    Sha256::digest(data).into()
}

/// HMAC construction generalized over an arbitrary hash primitive `hash`,
/// assuming a 64-byte block size and 32-byte output (true both for SHA-256
/// and for any HMAC instance built from it, which is what lets the nesting
/// work).
fn hmac_generic(
    hash: &dyn Fn(&[u8]) -> [u8; OUTPUT_SIZE],
    key: &[u8],
    msg: &[u8],
) -> [u8; OUTPUT_SIZE] {
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        key_block[..OUTPUT_SIZE].copy_from_slice(&hash(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key_block[i];
        opad[i] ^= key_block[i];
    }

    let mut inner_input = Vec::with_capacity(BLOCK_SIZE + msg.len());
    inner_input.extend_from_slice(&ipad);
    inner_input.extend_from_slice(msg);
    let inner = hash(&inner_input);

    let mut outer_input = Vec::with_capacity(BLOCK_SIZE + OUTPUT_SIZE);
    outer_input.extend_from_slice(&opad);
    outer_input.extend_from_slice(&inner);
    hash(&outer_input)
}

/// Derive a 32-byte key by nesting HMACs over `path`: the zeroth level is
/// real HMAC-SHA256 keyed with `"VMess AEAD KDF"`, and each subsequent
/// `path[i]` rekeys a new HMAC level using the previous level as its hash
/// primitive. `input_key` is the message hashed by the final (deepest)
/// level.
pub fn kdf(input_key: &[u8], path: &[&[u8]]) -> [u8; OUTPUT_SIZE] {
    let mut level: Box<dyn Fn(&[u8]) -> [u8; OUTPUT_SIZE]> = Box::new(sha256_hash);
    let mut key = ROOT_SALT.to_vec();

    for segment in path {
        let prev_level = level;
        let prev_key = key.clone();
        level = Box::new(move |data: &[u8]| hmac_generic(&*prev_level, &prev_key, data));
        key = segment.to_vec();
    }

    hmac_generic(&*level, &key, input_key)
}

/// Same as [`kdf`] but truncated to 16 bytes, the size most V-MESS subkeys
/// need (AES-128 keys, GCM keys).
pub fn kdf16(input_key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let full = kdf(input_key, path);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

pub const SALT_AUTH_ID_ENCRYPTION: &[u8] = b"AES Auth ID Encryption";
pub const SALT_AEAD_RESP_HEADER_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub const SALT_AEAD_RESP_HEADER_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
pub const SALT_AEAD_RESP_HEADER_PAYLOAD_KEY: &[u8] = b"AEAD Resp Header Key";
pub const SALT_AEAD_RESP_HEADER_PAYLOAD_IV: &[u8] = b"AEAD Resp Header IV";
pub const SALT_HEADER_PAYLOAD_AEAD_KEY: &[u8] = b"VMess Header AEAD Key";
pub const SALT_HEADER_PAYLOAD_AEAD_IV: &[u8] = b"VMess Header AEAD Nonce";
pub const SALT_HEADER_PAYLOAD_LENGTH_AEAD_KEY: &[u8] = b"VMess Header AEAD Key_Length";
pub const SALT_HEADER_PAYLOAD_LENGTH_AEAD_IV: &[u8] = b"VMess Header AEAD Nonce_Length";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_is_deterministic() {
        let key = [7u8; 16];
        let a = kdf(&key, &[SALT_AUTH_ID_ENCRYPTION]);
        let b = kdf(&key, &[SALT_AUTH_ID_ENCRYPTION]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kdf_domain_separation() {
        let key = [7u8; 16];
        let a = kdf(&key, &[SALT_AUTH_ID_ENCRYPTION]);
        let b = kdf(&key, &[SALT_AEAD_RESP_HEADER_LEN_KEY]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_path_order_matters() {
        let key = [1u8; 16];
        let a = kdf(&key, &[b"a", b"b"]);
        let b = kdf(&key, &[b"b", b"a"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf16_truncates() {
        let key = [3u8; 16];
        let full = kdf(&key, &[SALT_AUTH_ID_ENCRYPTION]);
        let truncated = kdf16(&key, &[SALT_AUTH_ID_ENCRYPTION]);
        assert_eq!(&full[..16], &truncated[..]);
    }

}
