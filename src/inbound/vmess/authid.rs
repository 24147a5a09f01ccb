//! AuthID codec (C2): a time-bound, AES-encrypted 16-byte authenticator
//! V-MESS clients send in place of a plaintext UUID.
//!
//! Plaintext layout (16 bytes): `BE i64 unix_time(8) ++ random(4) ++ BE u32
//! crc32_ieee(plaintext[..12])(4)`. The plaintext is encrypted with a
//! single AES-128 ECB block using a key derived from the user's command key
//! via [`kdf::kdf16`] under the `"AES Auth ID Encryption"` salt.

use super::kdf;
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

/// Window, in seconds, within which an AuthID's embedded timestamp must
/// fall relative to "now" to be accepted.
pub const TIME_WINDOW_SECS: i64 = 120;

/// Derive the AES-128 cipher used to seal/open AuthIDs for a given user
/// command key.
pub fn auth_id_cipher(cmd_key: &[u8; 16]) -> Aes128 {
    let key = kdf::kdf16(cmd_key, &[kdf::SALT_AUTH_ID_ENCRYPTION]);
    Aes128::new_from_slice(&key).expect("AES-128 key must be 16 bytes")
}

/// Build the 16-byte AuthID ciphertext for the given command key and unix
/// timestamp, using `random` as the 4 random bytes (callers pull these from
/// an RNG; exposed as a parameter so tests can fix them).
pub fn create_auth_id_with_random(cmd_key: &[u8; 16], time: i64, random: [u8; 4]) -> [u8; 16] {
    let mut plaintext = [0u8; 16];
    plaintext[0..8].copy_from_slice(&time.to_be_bytes());
    plaintext[8..12].copy_from_slice(&random);
    let checksum = crc32fast::hash(&plaintext[0..12]);
    plaintext[12..16].copy_from_slice(&checksum.to_be_bytes());

    let cipher = auth_id_cipher(cmd_key);
    let mut block = GenericArray::clone_from_slice(&plaintext);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Same as [`create_auth_id_with_random`] but pulls its random bytes from
/// the OS RNG, for real client-facing use (this crate is a server, but
/// keeping parity with the codec lets tests build end-to-end fixtures).
pub fn create_auth_id(cmd_key: &[u8; 16], time: i64) -> [u8; 16] {
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    create_auth_id_with_random(cmd_key, time, random)
}

/// Attempt to open a 16-byte AuthID ciphertext against `cipher`. Returns the
/// embedded unix timestamp on success; `None` covers both a CRC mismatch and
/// a timestamp outside `now ± TIME_WINDOW_SECS` — both are reported
/// identically so a probing client cannot distinguish "wrong user" from
/// "right user, stale clock" by timing or response shape.
pub fn try_match_auth_id(cipher: &Aes128, ciphertext: &[u8; 16], now: i64) -> Option<i64> {
    let mut block = GenericArray::clone_from_slice(ciphertext);
    cipher.decrypt_block(&mut block);
    let plaintext: [u8; 16] = block.into();

    let time = i64::from_be_bytes(plaintext[0..8].try_into().unwrap());
    let checksum = u32::from_be_bytes(plaintext[12..16].try_into().unwrap());

    if checksum != crc32fast::hash(&plaintext[0..12]) {
        return None;
    }
    if (time - now).abs() > TIME_WINDOW_SECS {
        return None;
    }

    Some(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_id_round_trip() {
        let cmd_key = [5u8; 16];
        let now = 1_700_000_000i64;
        let id = create_auth_id_with_random(&cmd_key, now, [1, 2, 3, 4]);

        let cipher = auth_id_cipher(&cmd_key);
        let matched = try_match_auth_id(&cipher, &id, now);
        assert_eq!(matched, Some(now));
    }

    #[test]
    fn test_auth_id_rejects_wrong_key() {
        let cmd_key = [5u8; 16];
        let wrong_key = [6u8; 16];
        let now = 1_700_000_000i64;
        let id = create_auth_id_with_random(&cmd_key, now, [1, 2, 3, 4]);

        let cipher = auth_id_cipher(&wrong_key);
        assert!(try_match_auth_id(&cipher, &id, now).is_none());
    }

    #[test]
    fn test_auth_id_rejects_stale_timestamp() {
        let cmd_key = [5u8; 16];
        let now = 1_700_000_000i64;
        let id = create_auth_id_with_random(&cmd_key, now - 121, [1, 2, 3, 4]);

        let cipher = auth_id_cipher(&cmd_key);
        assert!(try_match_auth_id(&cipher, &id, now).is_none());
    }

    #[test]
    fn test_auth_id_accepts_edge_of_window() {
        let cmd_key = [5u8; 16];
        let now = 1_700_000_000i64;
        let id = create_auth_id_with_random(&cmd_key, now - 120, [1, 2, 3, 4]);

        let cipher = auth_id_cipher(&cmd_key);
        assert_eq!(try_match_auth_id(&cipher, &id, now), Some(now - 120));
    }
}
