//! One tunnel session: handshake, then the packet shuttle.
//!
//! A session is born from a TCP stream (or anything byte-stream shaped) by
//! running the handshake: exchange cover preambles carrying the two session
//! nonces, derive the directional keys, then trade one heartbeat in each
//! direction. From there [`Session::run`] shuttles packets between the
//! tunnel endpoint and the socket until something kills it. Every exit is
//! an error, and the caller decides whether to reconnect (client) or go
//! back to listening (server).
//!
//! Backpressure is drop-based: at most one encrypted frame is staged for the
//! socket, and a tunnel packet arriving while the stage is occupied is
//! discarded. The inner IP traffic retransmits on its own; queueing here
//! would only add latency and unbounded memory.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::trace;

use cable_crypto::psk::PreSharedKey;
use cable_crypto::schedule::{fresh_session_nonce, SessionKeys, SESSION_NONCE_LEN};
use cable_crypto::seal::{Opener, SealedFrame, Sealer};
use cable_transport::connection::{SessionState, SessionTracker};
use cable_transport::framing::{FrameCodec, MAX_PACKET_SIZE};
use cable_transport::io::{read_exact, write_all, IO_TIMEOUT};
use cable_transport::preamble::{self, HelloRole, RECORD_HEADER_LEN};

use crate::config::{Role, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, PEER_SILENCE_LIMIT};
use crate::errors::{Error, Result};

/// Packet endpoint the session shuttles against: the tunnel device in
/// production, an in-memory pair in tests.
#[async_trait]
pub trait PacketIo: Send {
    /// Read one IP packet into `buf`; returns its length. No deadline: an
    /// idle tunnel must not fail the session.
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Inject one IP packet.
    async fn send(&mut self, packet: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl PacketIo for cable_platform::TunDevice {
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        cable_platform::TunDevice::recv(self, buf)
            .await
            .map_err(tun_io_error)
    }

    async fn send(&mut self, packet: &[u8]) -> std::io::Result<()> {
        cable_platform::TunDevice::send(self, packet)
            .await
            .map_err(tun_io_error)
    }
}

fn tun_io_error(e: cable_platform::TunError) -> std::io::Error {
    match e {
        cable_platform::TunError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}

/// A live tunnel session over byte stream `S`.
pub struct Session<S> {
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    sealer: Sealer,
    opener: Opener,
    /// Raw bytes from the socket, drained frame by frame.
    inbound: BytesMut,
    /// At most one encoded frame waiting for the socket to accept it.
    outbound: BytesMut,
    last_outbound: Instant,
    last_inbound: Instant,
    packet_buf_len: usize,
    tracker: Arc<SessionTracker>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Client side: send our hello, read the server's, prove the keys work.
    pub async fn connect(
        stream: S,
        psk: &PreSharedKey,
        mtu: u16,
        tracker: Arc<SessionTracker>,
    ) -> Result<Self> {
        Self::establish(stream, psk, mtu, Role::Client, tracker).await
    }

    /// Server side: read the client's hello first, then answer.
    pub async fn accept(
        stream: S,
        psk: &PreSharedKey,
        mtu: u16,
        tracker: Arc<SessionTracker>,
    ) -> Result<Self> {
        Self::establish(stream, psk, mtu, Role::Server, tracker).await
    }

    async fn establish(
        stream: S,
        psk: &PreSharedKey,
        mtu: u16,
        role: Role,
        tracker: Arc<SessionTracker>,
    ) -> Result<Self> {
        tracker.transition(SessionState::Handshaking);
        let result = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::handshake(stream, psk, mtu, role, Arc::clone(&tracker)),
        )
        .await
        .unwrap_or(Err(Error::HandshakeTimeout));
        match result {
            Ok(session) => {
                tracker.transition(SessionState::Live);
                Ok(session)
            }
            Err(e) => {
                tracker.transition(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn handshake(
        stream: S,
        psk: &PreSharedKey,
        mtu: u16,
        role: Role,
        tracker: Arc<SessionTracker>,
    ) -> Result<Self> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let ours = fresh_session_nonce()?;

        let (sealer, opener) = match role {
            Role::Client => {
                let hello = preamble::encode(HelloRole::Client, &ours)?;
                write_all(&mut wr, &hello, IO_TIMEOUT).await?;
                let theirs = read_hello(&mut rd, HelloRole::Server).await?;
                let keys = SessionKeys::derive(psk, &ours, &theirs);
                (Sealer::new(&keys.c2s), Opener::new(&keys.s2c))
            }
            Role::Server => {
                let theirs = read_hello(&mut rd, HelloRole::Client).await?;
                let hello = preamble::encode(HelloRole::Server, &ours)?;
                write_all(&mut wr, &hello, IO_TIMEOUT).await?;
                let keys = SessionKeys::derive(psk, &theirs, &ours);
                (Sealer::new(&keys.s2c), Opener::new(&keys.c2s))
            }
        };

        let now = Instant::now();
        let mut session = Self {
            rd,
            wr,
            sealer,
            opener,
            inbound: BytesMut::with_capacity(2 * MAX_PACKET_SIZE.min(mtu as usize + 64)),
            outbound: BytesMut::new(),
            last_outbound: now,
            last_inbound: now,
            packet_buf_len: (mtu as usize).min(MAX_PACKET_SIZE),
            tracker,
        };
        session.exchange_initial_heartbeats().await?;
        Ok(session)
    }

    /// Both sides send one heartbeat and must see one back; this is where a
    /// PSK mismatch or a tampered preamble surfaces as `AuthFail`.
    async fn exchange_initial_heartbeats(&mut self) -> Result<()> {
        let heartbeat = self.sealer.seal(&[])?;
        let mut wire = BytesMut::new();
        FrameCodec::encode(&heartbeat, &mut wire)?;
        write_all(&mut self.wr, &wire, IO_TIMEOUT).await?;

        let frame = self.read_frame().await?;
        let payload = self
            .opener
            .open(frame.plaintext_len, frame.counter, &frame.ciphertext)?;
        if !payload.is_empty() {
            return Err(Error::protocol("expected an initial heartbeat"));
        }
        let now = Instant::now();
        self.last_inbound = now;
        self.last_outbound = now;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<SealedFrame> {
        loop {
            if let Some(frame) = FrameCodec::decode_stream(&mut self.inbound)? {
                return Ok(frame);
            }
            let n = self.rd.read_buf(&mut self.inbound).await.map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::Eof);
            }
        }
    }

    /// Shuttle packets until the session dies. This never returns `Ok`; the
    /// error says why the session ended.
    pub async fn run<T: PacketIo>(&mut self, tun: &mut T) -> Result<()> {
        let res = self.shuttle(tun).await;
        self.tracker.transition(SessionState::Closing);
        self.tracker.transition(SessionState::Closed);
        res
    }

    async fn shuttle<T: PacketIo>(&mut self, tun: &mut T) -> Result<()> {
        let mut packet = vec![0u8; self.packet_buf_len];
        loop {
            // Drain every complete inbound frame before waiting again;
            // frames are processed strictly in arrival order.
            while let Some(frame) = FrameCodec::decode_stream(&mut self.inbound)? {
                let payload =
                    self.opener
                        .open(frame.plaintext_len, frame.counter, &frame.ciphertext)?;
                self.last_inbound = Instant::now();
                if payload.is_empty() {
                    trace!("heartbeat from peer");
                    continue;
                }
                self.tracker.record_received();
                tun.send(&payload).await.map_err(Error::Io)?;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                // Staged frame draining into the socket.
                res = self.wr.write_buf(&mut self.outbound), if !self.outbound.is_empty() => {
                    if res.map_err(Error::Io)? == 0 {
                        return Err(Error::Eof);
                    }
                }

                // Ciphertext arriving from the peer.
                res = self.rd.read_buf(&mut self.inbound) => {
                    let n = res.map_err(Error::Io)?;
                    if n == 0 {
                        return Err(Error::Eof);
                    }
                }

                // A packet leaving through the tunnel.
                res = tun.recv(&mut packet) => {
                    let n = res.map_err(Error::Io)?;
                    if n > 0 {
                        self.stage_packet(&packet[..n])?;
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    self.on_timer()?;
                }
            }
        }
    }

    /// Encrypt and stage one tunnel packet, or drop it if the socket is
    /// still chewing on the previous frame.
    fn stage_packet(&mut self, packet: &[u8]) -> Result<()> {
        if !self.outbound.is_empty() {
            self.tracker.record_dropped();
            trace!(len = packet.len(), "socket congested, packet dropped");
            return Ok(());
        }
        let frame = self.sealer.seal(packet)?;
        FrameCodec::encode(&frame, &mut self.outbound)?;
        self.last_outbound = Instant::now();
        self.tracker.record_sent();
        Ok(())
    }

    fn on_timer(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_inbound) >= PEER_SILENCE_LIMIT {
            return Err(Error::PeerSilent);
        }
        if self.outbound.is_empty()
            && now.duration_since(self.last_outbound) >= KEEPALIVE_INTERVAL
        {
            let heartbeat = self.sealer.seal(&[])?;
            FrameCodec::encode(&heartbeat, &mut self.outbound)?;
            self.last_outbound = now;
            trace!("heartbeat sent");
        }
        Ok(())
    }

    /// The next instant the timer arm must wake at. While a frame is staged
    /// the keepalive deadline is ignored (emitting another heartbeat would
    /// mean queueing); the silence limit still bounds the wait.
    fn next_deadline(&self) -> Instant {
        let silent = self.last_inbound + PEER_SILENCE_LIMIT;
        if self.outbound.is_empty() {
            silent.min(self.last_outbound + KEEPALIVE_INTERVAL)
        } else {
            silent
        }
    }

    /// Counter the next outbound frame would consume.
    pub fn next_counter(&self) -> u64 {
        self.sealer.next_counter()
    }

    /// Highest counter accepted from the peer.
    pub fn peer_counter(&self) -> u64 {
        self.opener.highest_counter()
    }
}

async fn read_hello<R>(rd: &mut R, role: HelloRole) -> Result<[u8; SESSION_NONCE_LEN]>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    read_exact(rd, &mut header, IO_TIMEOUT).await?;
    let len = preamble::body_len(&header)?;
    let mut body = vec![0u8; len];
    read_exact(rd, &mut body, IO_TIMEOUT).await?;
    Ok(preamble::decode_body(role, &body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_psk() -> PreSharedKey {
        PreSharedKey::from_hex(&"00".repeat(32)).unwrap()
    }

    fn tracker() -> Arc<SessionTracker> {
        Arc::new(SessionTracker::new())
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let psk = zero_psk();
        let (client, server) = tokio::join!(
            Session::connect(client_io, &psk, 9000, tracker()),
            Session::accept(server_io, &psk, 9000, tracker()),
        );
        let client = client.unwrap();
        let server = server.unwrap();
        // The initial heartbeat consumed counter 0 on each direction.
        assert_eq!(client.next_counter(), 1);
        assert_eq!(server.next_counter(), 1);
        assert_eq!(client.peer_counter(), 0);
        assert_eq!(server.peer_counter(), 0);
    }

    #[tokio::test]
    async fn handshake_reports_live_state() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let psk = zero_psk();
        let client_tracker = tracker();
        let (client, _server) = tokio::join!(
            Session::connect(client_io, &psk, 9000, Arc::clone(&client_tracker)),
            Session::accept(server_io, &psk, 9000, tracker()),
        );
        client.unwrap();
        assert_eq!(client_tracker.state(), SessionState::Live);
        assert_eq!(client_tracker.stats().sessions_established, 1);
    }

    #[tokio::test]
    async fn mismatched_psks_fail_with_auth_error() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let client_psk = zero_psk();
        let server_psk = PreSharedKey::from_hex(&"ff".repeat(32)).unwrap();
        let (client, server) = tokio::join!(
            Session::connect(client_io, &client_psk, 9000, tracker()),
            Session::accept(server_io, &server_psk, 9000, tracker()),
        );
        let client_err = match client {
            Err(e) => e,
            Ok(_) => panic!("expected client handshake to fail"),
        };
        let server_err = match server {
            Err(e) => e,
            Ok(_) => panic!("expected server handshake to fail"),
        };
        assert!(matches!(client_err, Error::AuthFail));
        assert!(matches!(server_err, Error::AuthFail));
    }

    #[tokio::test]
    async fn garbage_preamble_fails_the_server_handshake() {
        let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
        let psk = zero_psk();
        let (sent, accepted) = tokio::join!(
            async { client_io.write_all(&[0u8; 64]).await },
            Session::accept(server_io, &psk, 9000, tracker()),
        );
        sent.unwrap();
        let accepted_err = match accepted {
            Err(e) => e,
            Ok(_) => panic!("expected accept to fail"),
        };
        assert!(matches!(accepted_err, Error::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_the_handshake_with_timeout() {
        let (client_io, _server_io) = tokio::io::duplex(1 << 16);
        let psk = zero_psk();
        let err = match Session::connect(client_io, &psk, 9000, tracker()).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail"),
        };
        assert!(matches!(
            err,
            Error::HandshakeTimeout | Error::Timeout
        ));
    }

    #[tokio::test]
    async fn closed_stream_fails_the_handshake_with_eof() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        drop(server_io);
        let psk = zero_psk();
        let err = match Session::connect(client_io, &psk, 9000, tracker()).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail"),
        };
        assert!(matches!(err, Error::Eof | Error::Io(_)));
    }
}
