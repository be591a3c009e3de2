//! TLS-shaped cover preamble.
//!
//! Before any encrypted frame, each side sends one block shaped like the
//! first flight of a TLS handshake (ClientHello out, ServerHello back) so
//! that passive DPI classifies the flow as TLS. The block is neither
//! encrypted nor authenticated; its only cryptographic role is carrying the
//! sender's 8-byte session nonce, split across the Random and SessionID
//! fields where it is indistinguishable from the surrounding randomness.
//! Tampering makes the two sides derive different keys, so the first real
//! frame fails authentication and the session dies.

use cable_crypto::schedule::SESSION_NONCE_LEN;

/// TLS record header: content type, version, body length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Upper bound we accept for a hello body; real ones are under 100 bytes.
pub const MAX_BODY_LEN: usize = 512;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const RECORD_VERSION: [u8; 2] = [0x03, 0x01];
const LEGACY_VERSION: [u8; 2] = [0x03, 0x03];
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const RANDOM_OFFSET: usize = 6;
const SESSION_ID_LEN_OFFSET: usize = 38;
const SESSION_ID_OFFSET: usize = 39;
const FIXED_PREFIX_LEN: usize = 71; // through the end of SessionID

/// Suites a mainstream TLS 1.2/1.3 client would offer; only the shape matters.
const CLIENT_CIPHER_SUITES: [u8; 16] = [
    0x13, 0x01, 0x13, 0x02, 0x13, 0x03, 0xc0, 0x2b, 0xc0, 0x2f, 0xc0, 0x2c, 0xc0, 0x30, 0x00,
    0xff,
];
const SERVER_CIPHER_SUITE: [u8; 2] = [0x13, 0x01];

/// Which hello shape a preamble takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloRole {
    Client,
    Server,
}

impl HelloRole {
    fn handshake_type(self) -> u8 {
        match self {
            HelloRole::Client => HANDSHAKE_CLIENT_HELLO,
            HelloRole::Server => HANDSHAKE_SERVER_HELLO,
        }
    }
}

/// Error type for preamble handling.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PreambleError {
    #[error("system RNG failed")]
    Rng,
    #[error("not a TLS handshake record")]
    BadRecord,
    #[error("unexpected hello shape")]
    BadShape,
}

/// Build the full preamble (record header + hello body) for `role`,
/// embedding `nonce` in the Random and SessionID fields.
pub fn encode(role: HelloRole, nonce: &[u8; SESSION_NONCE_LEN]) -> Result<Vec<u8>, PreambleError> {
    let mut body = Vec::with_capacity(96);
    body.push(role.handshake_type());
    body.extend_from_slice(&[0, 0, 0]); // handshake length, patched below
    body.extend_from_slice(&LEGACY_VERSION);

    let mut random = [0u8; 32];
    getrandom::getrandom(&mut random).map_err(|_| PreambleError::Rng)?;
    random[..4].copy_from_slice(&nonce[..4]);
    body.extend_from_slice(&random);

    body.push(32);
    let mut session_id = [0u8; 32];
    getrandom::getrandom(&mut session_id).map_err(|_| PreambleError::Rng)?;
    session_id[..4].copy_from_slice(&nonce[4..]);
    body.extend_from_slice(&session_id);

    match role {
        HelloRole::Client => {
            body.extend_from_slice(&(CLIENT_CIPHER_SUITES.len() as u16).to_be_bytes());
            body.extend_from_slice(&CLIENT_CIPHER_SUITES);
            body.push(1); // one compression method
            body.push(0); // null
            body.extend_from_slice(&[0, 0]); // empty extensions
        }
        HelloRole::Server => {
            body.extend_from_slice(&SERVER_CIPHER_SUITE);
            body.push(0); // null compression
            body.extend_from_slice(&[0, 0]); // empty extensions
        }
    }

    let handshake_len = (body.len() - 4) as u32;
    body[1..4].copy_from_slice(&handshake_len.to_be_bytes()[1..]);

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    out.push(CONTENT_TYPE_HANDSHAKE);
    out.extend_from_slice(&RECORD_VERSION);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Validate a record header and return the declared body length.
pub fn body_len(header: &[u8; RECORD_HEADER_LEN]) -> Result<usize, PreambleError> {
    if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 0x03 || header[2] > 0x04 {
        return Err(PreambleError::BadRecord);
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if !(FIXED_PREFIX_LEN..=MAX_BODY_LEN).contains(&len) {
        return Err(PreambleError::BadRecord);
    }
    Ok(len)
}

/// Extract the session nonce from a hello body (record header removed).
pub fn decode_body(
    role: HelloRole,
    body: &[u8],
) -> Result<[u8; SESSION_NONCE_LEN], PreambleError> {
    if body.len() < FIXED_PREFIX_LEN {
        return Err(PreambleError::BadShape);
    }
    if body[0] != role.handshake_type() {
        return Err(PreambleError::BadShape);
    }
    let declared = u32::from_be_bytes([0, body[1], body[2], body[3]]) as usize;
    if declared != body.len() - 4 {
        return Err(PreambleError::BadShape);
    }
    if body[4..6] != LEGACY_VERSION || body[SESSION_ID_LEN_OFFSET] != 32 {
        return Err(PreambleError::BadShape);
    }
    let mut nonce = [0u8; SESSION_NONCE_LEN];
    nonce[..4].copy_from_slice(&body[RANDOM_OFFSET..RANDOM_OFFSET + 4]);
    nonce[4..].copy_from_slice(&body[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4]);
    Ok(nonce)
}
