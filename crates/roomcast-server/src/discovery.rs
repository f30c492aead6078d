//! LAN discovery beacon.
//!
//! A UDP responder so headsets can find the relay without configuration:
//! any datagram carrying the exact probe payload is answered with the
//! relay's ports and advertised name.

use std::net::SocketAddr;

use tokio::{net::UdpSocket, sync::watch};

use crate::error::ServerError;

/// Probe payload clients broadcast.
pub const DISCOVERY_REQUEST: &[u8] = b"STYLY-NETSYNC-DISCOVER";

/// Reply prefix; the full reply is `PREFIX|<dealer>|<pub>|<name>`.
pub const DISCOVERY_REPLY_PREFIX: &str = "STYLY-NETSYNC";

/// The UDP discovery responder.
pub struct DiscoveryBeacon {
    socket: UdpSocket,
    reply: Vec<u8>,
}

impl DiscoveryBeacon {
    /// Bind the beacon and bake its reply.
    pub async fn bind(
        addr: SocketAddr,
        dealer_port: u16,
        pub_port: u16,
        server_name: &str,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("discovery bind {addr}: {e}")))?;
        tracing::info!("discovery beacon bound to {}", socket.local_addr()?);
        let reply =
            format!("{DISCOVERY_REPLY_PREFIX}|{dealer_port}|{pub_port}|{server_name}").into_bytes();
        Ok(Self { socket, reply })
    }

    /// Local address the beacon is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer probes until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if &buf[..len] == DISCOVERY_REQUEST {
                            if let Err(e) = self.socket.send_to(&self.reply, peer).await {
                                tracing::debug!(%peer, "discovery reply failed: {e}");
                            }
                        }
                    },
                    Err(e) => tracing::warn!("discovery receive error: {e}"),
                },
            }
        }
        tracing::debug!("discovery beacon stopped");
    }
}
