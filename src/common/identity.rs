//! Shared identity registry for V-LESS and V-MESS inbound users.
//!
//! Both protocols authenticate against a small, rarely-changing set of
//! UUID-identified users. V-LESS only needs O(1) lookup by the raw UUID
//! bytes found on the wire; V-MESS additionally needs to scan every user's
//! precomputed AES cipher against an AuthID ciphertext, since the AuthID
//! does not reveal which user encrypted it.

use aes::Aes128;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

/// A registered user, identified by UUID.
#[derive(Debug, Clone)]
pub struct User {
    pub uuid: Uuid,
}

impl User {
    pub fn new(uuid: Uuid) -> Self {
        User { uuid }
    }

    pub fn uuid_bytes(&self) -> [u8; 16] {
        *self.uuid.as_bytes()
    }
}

/// A user plus the AES-128 block cipher keyed for AuthID decryption, kept
/// alongside each other so the V-MESS scan path never recomputes the key
/// schedule per connection attempt.
#[derive(Clone)]
struct AuthEntry {
    user: User,
    auth_cipher: Aes128,
}

/// Concurrent map of UUID -> User plus an ordered scan list for AuthID
/// matching.
///
/// `by_uuid` backs the O(1) V-LESS lookup path (`DashMap`, matching the
/// sharded-lock pattern `statistic::StatisticManager` uses for its
/// connection table). `scan_list` backs the O(N) V-MESS AuthID scan, which
/// must preserve insertion order and allows concurrent reads without
/// blocking registrations; it is rarely mutated so a `parking_lot::RwLock`
/// guarding a plain `Vec` is sufficient.
pub struct IdentityRegistry {
    by_uuid: DashMap<[u8; 16], User>,
    scan_list: RwLock<Vec<AuthEntry>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        IdentityRegistry {
            by_uuid: DashMap::new(),
            scan_list: RwLock::new(Vec::new()),
        }
    }

    /// Register a user alongside its precomputed AuthID AES cipher. The
    /// cipher's key schedule is protocol-specific (V-MESS derives it from
    /// the user's command key via a nested-HMAC KDF), so callers build it
    /// and hand it in rather than this registry knowing how.
    pub fn add_user(&self, uuid: Uuid, auth_cipher: Aes128) {
        let user = User::new(uuid);
        self.by_uuid.insert(user.uuid_bytes(), user.clone());
        self.scan_list.write().push(AuthEntry { user, auth_cipher });
    }

    pub fn remove_user(&self, uuid: &Uuid) {
        let bytes = *uuid.as_bytes();
        self.by_uuid.remove(&bytes);
        self.scan_list.write().retain(|e| e.user.uuid != *uuid);
    }

    /// O(1) lookup used by the V-LESS handshake.
    pub fn get_by_uuid_bytes(&self, bytes: &[u8]) -> Option<User> {
        if bytes.len() < 16 {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes[..16]);
        self.by_uuid.get(&key).map(|r| r.value().clone())
    }

    /// Scan every registered user's AuthID cipher against a single AES
    /// block, in registration order, invoking `decrypt` for each candidate
    /// until it returns `Some`. Returns the matching user and the decrypted
    /// block.
    pub fn scan_auth_id<F>(&self, ciphertext: &[u8; 16], mut decrypt: F) -> Option<(User, [u8; 16])>
    where
        F: FnMut(&Aes128, &[u8; 16]) -> Option<[u8; 16]>,
    {
        let list = self.scan_list.read();
        for entry in list.iter() {
            if let Some(plain) = decrypt(&entry.auth_cipher, ciphertext) {
                return Some((entry.user.clone(), plain));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::KeyInit;

    fn test_cipher(byte: u8) -> Aes128 {
        Aes128::new_from_slice(&[byte; 16]).unwrap()
    }

    #[test]
    fn test_add_and_lookup() {
        let reg = IdentityRegistry::new();
        let uuid = Uuid::new_v4();
        reg.add_user(uuid, test_cipher(0));

        assert_eq!(reg.len(), 1);
        let found = reg.get_by_uuid_bytes(uuid.as_bytes()).unwrap();
        assert_eq!(found.uuid, uuid);

        let other = Uuid::new_v4();
        assert!(reg.get_by_uuid_bytes(other.as_bytes()).is_none());
    }

    #[test]
    fn test_remove_user() {
        let reg = IdentityRegistry::new();
        let uuid = Uuid::new_v4();
        reg.add_user(uuid, test_cipher(1));
        assert_eq!(reg.len(), 1);

        reg.remove_user(&uuid);
        assert_eq!(reg.len(), 0);
        assert!(reg.get_by_uuid_bytes(uuid.as_bytes()).is_none());
    }

    #[test]
    fn test_scan_auth_id_order_and_miss() {
        let reg = IdentityRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.add_user(a, test_cipher(2));
        reg.add_user(b, test_cipher(3));

        let ciphertext = [9u8; 16];
        let result = reg.scan_auth_id(&ciphertext, |_cipher, _ct| None);
        assert!(result.is_none());

        let result = reg.scan_auth_id(&ciphertext, |_cipher, _ct| Some([0u8; 16]));
        assert_eq!(result.unwrap().0.uuid, a);
    }
}
