//! In-memory packet endpoints for tests.
//!
//! [`memory_tun`] builds a fake tunnel device: the [`MemoryTun`] half plugs
//! into a session as its [`PacketIo`], and the [`TunHandle`] half plays the
//! kernel: injecting packets the session should encrypt, and collecting
//! packets the session decrypted.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::session::PacketIo;

/// Create a fake tunnel device and its test-side handle.
pub fn memory_tun() -> (MemoryTun, TunHandle) {
    let (to_tun, inbound) = mpsc::channel(64);
    let (outbound, from_tun) = mpsc::channel(64);
    (
        MemoryTun { inbound, outbound },
        TunHandle { to_tun, from_tun },
    )
}

/// The session-facing half of a fake tunnel device.
pub struct MemoryTun {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl PacketIo for MemoryTun {
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let packet = self
            .inbound
            .recv()
            .await
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

/// The kernel-side half of a fake tunnel device.
pub struct TunHandle {
    to_tun: mpsc::Sender<Vec<u8>>,
    from_tun: mpsc::Receiver<Vec<u8>>,
}

impl TunHandle {
    /// Hand the session a packet, as if it had been routed into the device.
    pub async fn inject(&self, packet: &[u8]) {
        self.to_tun
            .send(packet.to_vec())
            .await
            .expect("session side of the memory tun is gone");
    }

    /// Next packet the session wrote to the device.
    pub async fn collect(&mut self) -> Option<Vec<u8>> {
        self.from_tun.recv().await
    }
}
