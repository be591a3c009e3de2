//! Length-prefixed framing for encrypted frames.
//!
//! On-wire layout, repeated for the life of the session:
//!
//! ```plain
//! +-----------+------------+----------------------+
//! | len_be16  |  nonce_be8 |  ciphertext + tag    |
//! +-----------+------------+----------------------+
//! |     2     |      8     |      len + 16        |
//! +-----------+------------+----------------------+
//! ```
//!
//! `len` is the plaintext length; 0 encodes a heartbeat. The header is not
//! encrypted but is bound as AEAD associated data, so tampering with it fails
//! the frame. The length is validated before the body is awaited so an
//! attacker cannot make the receiver buffer more than one frame.

use bytes::{Buf, BufMut, BytesMut};

use cable_crypto::seal::{SealedFrame, MAX_PAYLOAD_LEN, TAG_LEN, WIRE_NONCE_LEN};

/// Largest plaintext an encrypted frame may carry.
pub const MAX_PACKET_SIZE: usize = MAX_PAYLOAD_LEN;

/// Bytes of header preceding the ciphertext.
pub const HEADER_LEN: usize = 2 + WIRE_NONCE_LEN;

/// Framing error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame length {0} exceeds the maximum of {MAX_PACKET_SIZE}")]
    TooLarge(usize),
    #[error("ciphertext length {got} does not match declared length {expected}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Encoder/decoder for the frame envelope.
pub struct FrameCodec;

impl FrameCodec {
    /// Append one sealed frame to `dst`.
    pub fn encode(frame: &SealedFrame, dst: &mut BytesMut) -> Result<(), FramingError> {
        let len = frame.plaintext_len as usize;
        if len > MAX_PACKET_SIZE {
            return Err(FramingError::TooLarge(len));
        }
        if frame.ciphertext.len() != len + TAG_LEN {
            return Err(FramingError::LengthMismatch {
                expected: len + TAG_LEN,
                got: frame.ciphertext.len(),
            });
        }
        dst.reserve(HEADER_LEN + frame.ciphertext.len());
        dst.put_u16(frame.plaintext_len);
        dst.put_u64(frame.counter);
        dst.extend_from_slice(&frame.ciphertext);
        Ok(())
    }

    /// Pull the next complete frame out of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `src`; an incomplete frame leaves `src` untouched.
    pub fn decode_stream(src: &mut BytesMut) -> Result<Option<SealedFrame>, FramingError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > MAX_PACKET_SIZE {
            return Err(FramingError::TooLarge(len));
        }
        let body = len + TAG_LEN;
        if src.len() < HEADER_LEN + body {
            return Ok(None);
        }
        src.advance(2);
        let counter = src.get_u64();
        let ciphertext = src.split_to(body).to_vec();
        Ok(Some(SealedFrame {
            plaintext_len: len as u16,
            counter,
            ciphertext,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(len: usize, counter: u64) -> SealedFrame {
        SealedFrame {
            plaintext_len: len as u16,
            counter,
            ciphertext: vec![0xAA; len + TAG_LEN],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut buf = BytesMut::new();
        let original = frame(20, 7);
        FrameCodec::encode(&original, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 20 + TAG_LEN);
        let decoded = FrameCodec::decode_stream(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn heartbeat_frame_is_header_plus_tag() {
        let mut buf = BytesMut::new();
        FrameCodec::encode(&frame(0, 3), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + TAG_LEN);
        let decoded = FrameCodec::decode_stream(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.plaintext_len, 0);
        assert_eq!(decoded.counter, 3);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut wire = BytesMut::new();
        FrameCodec::encode(&frame(100, 1), &mut wire).unwrap();

        let mut acc = BytesMut::new();
        acc.extend_from_slice(&wire[..HEADER_LEN - 1]);
        assert_eq!(FrameCodec::decode_stream(&mut acc).unwrap(), None);

        acc.extend_from_slice(&wire[HEADER_LEN - 1..HEADER_LEN + 50]);
        assert_eq!(FrameCodec::decode_stream(&mut acc).unwrap(), None);

        acc.extend_from_slice(&wire[HEADER_LEN + 50..]);
        let decoded = FrameCodec::decode_stream(&mut acc).unwrap().unwrap();
        assert_eq!(decoded.plaintext_len, 100);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        FrameCodec::encode(&frame(5, 0), &mut buf).unwrap();
        FrameCodec::encode(&frame(9, 1), &mut buf).unwrap();
        assert_eq!(
            FrameCodec::decode_stream(&mut buf).unwrap().unwrap().counter,
            0
        );
        assert_eq!(
            FrameCodec::decode_stream(&mut buf).unwrap().unwrap().counter,
            1
        );
        assert_eq!(FrameCodec::decode_stream(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_declared_length_rejected_before_body() {
        let mut buf = BytesMut::new();
        buf.put_u16(u16::MAX); // 65535 > MAX_PACKET_SIZE
        buf.put_u64(0);
        assert_eq!(
            FrameCodec::decode_stream(&mut buf),
            Err(FramingError::TooLarge(u16::MAX as usize))
        );
    }

    #[test]
    fn encode_rejects_mismatched_ciphertext() {
        let mut buf = BytesMut::new();
        let bad = SealedFrame {
            plaintext_len: 10,
            counter: 0,
            ciphertext: vec![0; 5],
        };
        assert!(matches!(
            FrameCodec::encode(&bad, &mut buf),
            Err(FramingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn max_packet_size_accounts_for_overhead() {
        assert_eq!(MAX_PACKET_SIZE + HEADER_LEN + TAG_LEN, 65536);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            len in 0usize..=2000,
            counter in any::<u64>(),
            fill in any::<u8>()
        ) {
            let original = SealedFrame {
                plaintext_len: len as u16,
                counter,
                ciphertext: vec![fill; len + TAG_LEN],
            };
            let mut buf = BytesMut::new();
            FrameCodec::encode(&original, &mut buf)?;
            let decoded = FrameCodec::decode_stream(&mut buf)?.unwrap();
            prop_assert_eq!(decoded, original);
            prop_assert!(buf.is_empty());
        }
    }
}
