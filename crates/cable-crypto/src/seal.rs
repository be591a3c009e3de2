//! Directional AEAD sealing.
//!
//! One ChaCha20-Poly1305 state per direction. The sender side owns the
//! monotonic frame counter; the receiver side owns the replay window. The
//! AEAD nonce is the 4-byte direction salt followed by the counter in
//! little-endian, and the wire header (length + counter) is bound as
//! associated data, so neither field can be altered without failing the tag.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::replay::{FrameCounter, ReplayError, ReplayFilter};
use crate::schedule::{DirectionKeys, SALT_LEN};

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Length of the frame counter as carried on the wire.
pub const WIRE_NONCE_LEN: usize = 8;

/// Largest sealable payload. The 2-byte wire length field minus the framing
/// overhead (length + counter + tag) bounds what a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 65536 - 2 - WIRE_NONCE_LEN - TAG_LEN;

/// Error type for the sending direction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SealError {
    #[error("outbound frame counter exhausted")]
    CounterExhausted,
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
    #[error("encryption failed")]
    Encrypt,
}

/// Error type for the receiving direction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("frame authentication failed")]
    Auth,
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// One sealed frame, ready for the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    /// Plaintext length (0 = heartbeat).
    pub plaintext_len: u16,
    /// The counter this frame consumed; carried explicitly on the wire.
    pub counter: u64,
    /// AEAD output: ciphertext followed by the tag.
    pub ciphertext: Vec<u8>,
}

fn aead_nonce(salt: &[u8; SALT_LEN], counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..SALT_LEN].copy_from_slice(salt);
    nonce[SALT_LEN..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// The associated data is exactly the unencrypted wire header.
fn frame_aad(plaintext_len: u16, counter: u64) -> [u8; 2 + WIRE_NONCE_LEN] {
    let mut aad = [0u8; 2 + WIRE_NONCE_LEN];
    aad[..2].copy_from_slice(&plaintext_len.to_be_bytes());
    aad[2..].copy_from_slice(&counter.to_be_bytes());
    aad
}

/// Sending half of one direction.
pub struct Sealer {
    aead: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    counter: FrameCounter,
}

impl Sealer {
    pub fn new(keys: &DirectionKeys) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&keys.key)),
            salt: keys.salt,
            counter: FrameCounter::new(),
        }
    }

    /// Seal one payload (empty = heartbeat), consuming the next counter.
    pub fn seal(&mut self, payload: &[u8]) -> Result<SealedFrame, SealError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SealError::PayloadTooLarge(payload.len()));
        }
        let counter = self.counter.next().ok_or(SealError::CounterExhausted)?;
        let plaintext_len = payload.len() as u16;
        let nonce = aead_nonce(&self.salt, counter);
        let aad = frame_aad(plaintext_len, counter);
        let ciphertext = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::Encrypt)?;
        Ok(SealedFrame {
            plaintext_len,
            counter,
            ciphertext,
        })
    }

    /// The counter the next frame would consume.
    pub fn next_counter(&self) -> u64 {
        self.counter.current()
    }

    #[cfg(test)]
    pub(crate) fn with_counter(mut self, counter: FrameCounter) -> Self {
        self.counter = counter;
        self
    }
}

/// Receiving half of one direction.
pub struct Opener {
    aead: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    replay: ReplayFilter,
}

impl Opener {
    pub fn new(keys: &DirectionKeys) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&keys.key)),
            salt: keys.salt,
            replay: ReplayFilter::new(),
        }
    }

    /// Authenticate and decrypt one frame.
    ///
    /// The replay window is consulted before decryption and committed only
    /// after the tag verifies; a forged counter therefore cannot displace
    /// legitimate state.
    pub fn open(
        &mut self,
        plaintext_len: u16,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, OpenError> {
        self.replay.peek(counter)?;
        let nonce = aead_nonce(&self.salt, counter);
        let aad = frame_aad(plaintext_len, counter);
        let plaintext = self
            .aead
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| OpenError::Auth)?;
        debug_assert_eq!(plaintext.len(), plaintext_len as usize);
        self.replay
            .check_and_update(counter)
            .map_err(OpenError::Replay)?;
        Ok(plaintext)
    }

    /// Highest counter accepted from the peer so far.
    pub fn highest_counter(&self) -> u64 {
        self.replay.highest()
    }
}
