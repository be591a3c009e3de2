//! Server session manager.
//!
//! Binds once and keeps exactly one session alive. While a session runs, the
//! listener stays armed: a new client that completes its handshake replaces
//! the active session on the spot (last writer wins) and the old socket is
//! closed. That is the recovery path for a client whose NAT state expired:
//! it simply connects again and takes over. A connection that fails its
//! handshake changes nothing.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use cable_crypto::psk::PreSharedKey;
use cable_transport::connection::SessionTracker;
use cable_transport::sockopt;

use crate::errors::{Error, Result};
use crate::session::{PacketIo, Session};

pub struct Server {
    listener: TcpListener,
    psk: PreSharedKey,
    mtu: u16,
    tracker: Arc<SessionTracker>,
}

impl Server {
    /// Bind the listening socket. Failure here is fatal setup failure.
    pub async fn bind(addr: &str, psk: PreSharedKey, mtu: u16) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("cannot bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            psk,
            mtu,
            tracker: Arc::new(SessionTracker::new()),
        })
    }

    /// The bound address; useful when the port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Io)
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept and serve clients forever. The tunnel endpoint outlives every
    /// session, so packets queued in the device flow into whichever session
    /// is active next.
    pub async fn run<T: PacketIo>(&mut self, tun: &mut T) -> Result<()> {
        loop {
            let mut session = self.accept_session().await;
            loop {
                tokio::select! {
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if let Some(new) = self.handshake(stream, peer).await {
                                    info!("new client supersedes the active session");
                                    session = new;
                                }
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                    res = session.run(tun) => {
                        if let Err(e) = res {
                            info!(error = %e, "session ended");
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Block until some client completes a handshake.
    async fn accept_session(&self) -> Session<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Some(session) = self.handshake(stream, peer).await {
                        return session;
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Option<Session<TcpStream>> {
        sockopt::tune(&stream);
        match Session::accept(stream, &self.psk, self.mtu, Arc::clone(&self.tracker)).await {
            Ok(session) => {
                info!(%peer, "session established");
                Some(session)
            }
            Err(e) => {
                warn!(%peer, error = %e, "handshake failed");
                None
            }
        }
    }
}
