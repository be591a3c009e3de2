//! Session key schedule.
//!
//! Each session exchanges two fresh 8-byte nonces (client and server) during
//! the handshake. HKDF-SHA256 keyed with the pre-shared key expands
//! `label || client_nonce || server_nonce` into one 32-byte AEAD key and one
//! 4-byte nonce salt per direction. The direction labels bind the key to its
//! role, so the two directions never share a (key, nonce) pair even at equal
//! counters.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::psk::PreSharedKey;

/// Length of the per-session handshake nonces.
pub const SESSION_NONCE_LEN: usize = 8;

/// Length of a directional AEAD key.
pub const KEY_LEN: usize = 32;

/// Length of the per-direction nonce salt.
pub const SALT_LEN: usize = 4;

/// Error type for key-schedule operations.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("system RNG failed")]
    Rng,
}

/// Key material for one direction of the tunnel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub key: [u8; KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

/// Both directions' key material for one session.
pub struct SessionKeys {
    /// Client-to-server direction.
    pub c2s: DirectionKeys,
    /// Server-to-client direction.
    pub s2c: DirectionKeys,
}

impl SessionKeys {
    /// Derive the session keys from the PSK and both handshake nonces.
    ///
    /// Deterministic: both peers call this with the same arguments and obtain
    /// identical key material.
    pub fn derive(
        psk: &PreSharedKey,
        client_nonce: &[u8; SESSION_NONCE_LEN],
        server_nonce: &[u8; SESSION_NONCE_LEN],
    ) -> Self {
        let hk = Hkdf::<Sha256>::new(None, psk.as_bytes());

        let mut c2s = DirectionKeys {
            key: [0u8; KEY_LEN],
            salt: [0u8; SALT_LEN],
        };
        let mut s2c = c2s.clone();

        expand(&hk, b"c2s", client_nonce, server_nonce, &mut c2s.key);
        expand(&hk, b"s2c", client_nonce, server_nonce, &mut s2c.key);
        expand(&hk, b"c2s-salt", client_nonce, server_nonce, &mut c2s.salt);
        expand(&hk, b"s2c-salt", client_nonce, server_nonce, &mut s2c.salt);

        Self { c2s, s2c }
    }
}

fn expand(
    hk: &Hkdf<Sha256>,
    label: &[u8],
    client_nonce: &[u8; SESSION_NONCE_LEN],
    server_nonce: &[u8; SESSION_NONCE_LEN],
    out: &mut [u8],
) {
    let mut info = Vec::with_capacity(label.len() + 2 * SESSION_NONCE_LEN);
    info.extend_from_slice(label);
    info.extend_from_slice(client_nonce);
    info.extend_from_slice(server_nonce);
    // Output lengths are fixed at compile time and well below the HKDF limit.
    hk.expand(&info, out).expect("hkdf expand");
    info.zeroize();
}

/// Generate a fresh handshake nonce from the system RNG.
pub fn fresh_session_nonce() -> Result<[u8; SESSION_NONCE_LEN], ScheduleError> {
    let mut nonce = [0u8; SESSION_NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| ScheduleError::Rng)?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_psk() -> PreSharedKey {
        PreSharedKey::from_hex(&"11".repeat(32)).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let nc = [1u8; SESSION_NONCE_LEN];
        let ns = [2u8; SESSION_NONCE_LEN];
        let a = SessionKeys::derive(&test_psk(), &nc, &ns);
        let b = SessionKeys::derive(&test_psk(), &nc, &ns);
        assert_eq!(a.c2s.key, b.c2s.key);
        assert_eq!(a.c2s.salt, b.c2s.salt);
        assert_eq!(a.s2c.key, b.s2c.key);
        assert_eq!(a.s2c.salt, b.s2c.salt);
    }

    #[test]
    fn directions_get_distinct_material() {
        let keys = SessionKeys::derive(&test_psk(), &[1u8; 8], &[2u8; 8]);
        assert_ne!(keys.c2s.key, keys.s2c.key);
        assert_ne!(keys.c2s.salt, keys.s2c.salt);
    }

    #[test]
    fn nonces_change_the_schedule() {
        let a = SessionKeys::derive(&test_psk(), &[1u8; 8], &[2u8; 8]);
        let b = SessionKeys::derive(&test_psk(), &[1u8; 8], &[3u8; 8]);
        let c = SessionKeys::derive(&test_psk(), &[9u8; 8], &[2u8; 8]);
        assert_ne!(a.c2s.key, b.c2s.key);
        assert_ne!(a.c2s.key, c.c2s.key);
    }

    #[test]
    fn psk_changes_the_schedule() {
        let other = PreSharedKey::from_hex(&"22".repeat(32)).unwrap();
        let a = SessionKeys::derive(&test_psk(), &[1u8; 8], &[2u8; 8]);
        let b = SessionKeys::derive(&other, &[1u8; 8], &[2u8; 8]);
        assert_ne!(a.c2s.key, b.c2s.key);
        assert_ne!(a.s2c.key, b.s2c.key);
    }

    #[test]
    fn fresh_nonces_differ() {
        let a = fresh_session_nonce().unwrap();
        let b = fresh_session_nonce().unwrap();
        assert_ne!(a, b);
    }
}
