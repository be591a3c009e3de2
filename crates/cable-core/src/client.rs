//! Client reconnect controller.
//!
//! Connect, handshake, run, and when anything kills the session: close the
//! socket, wait out the fixed backoff, try again. The tunnel device and its
//! routes are configured once and survive every reconnect; only the TCP
//! session and its keys are renewed.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{info, warn};

use cable_crypto::psk::PreSharedKey;
use cable_transport::connection::{ReconnectPacer, SessionTracker};
use cable_transport::sockopt;

use crate::errors::{Error, Result};
use crate::session::{PacketIo, Session};

pub struct Client {
    server_addr: String,
    psk: PreSharedKey,
    mtu: u16,
    pacer: ReconnectPacer,
    tracker: Arc<SessionTracker>,
}

impl Client {
    pub fn new(server_addr: String, psk: PreSharedKey, mtu: u16) -> Self {
        Self {
            server_addr,
            psk,
            mtu,
            pacer: ReconnectPacer::default(),
            tracker: Arc::new(SessionTracker::new()),
        }
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Keep a session alive against the server, forever.
    pub async fn run<T: PacketIo>(&self, tun: &mut T) -> Result<()> {
        loop {
            match self.establish().await {
                Ok(mut session) => {
                    info!(server = %self.server_addr, "session established");
                    self.pacer.reset();
                    if let Err(e) = session.run(tun).await {
                        warn!(error = %e, "session ended");
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }
            self.pacer.wait().await;
        }
    }

    async fn establish(&self) -> Result<Session<TcpStream>> {
        let stream = TcpStream::connect(&self.server_addr)
            .await
            .map_err(Error::Io)?;
        sockopt::tune(&stream);
        Session::connect(stream, &self.psk, self.mtu, Arc::clone(&self.tracker)).await
    }
}
