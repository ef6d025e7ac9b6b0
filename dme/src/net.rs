//! # Summary
//!
//! Datagram transport between sites. Each process binds one UDP socket at its
//! configured endpoint; sends go straight out from inside event handlers,
//! receives run in a separate task that posts every inbound datagram as a
//! `PacketIn` event. Delivery is best-effort: the network may lose packets
//! and the protocols are expected to cope. Send failures are reported to the
//! caller, never retried.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use crate::config::{Config, SiteId, SUPERVISOR_ID};
use crate::error::Error;
use crate::event::{EventKind, Queue};
use crate::message::MAX_DATAGRAM;

/// The sending half of the transport, as seen by the protocol engines. The
/// in-memory implementations used by tests live next to the tests.
pub trait Net: Send {
    /// Sends the buffer to one site.
    fn send(&self, dest: SiteId, datagram: &[u8]) -> Result<(), Error>;

    /// Sends the buffer to every peer site except the local one. The
    /// supervisor is never part of a broadcast.
    fn broadcast(&self, datagram: &[u8]) -> Result<(), Error>;
}

/// The real transport: one bound socket, one receiver task.
pub struct UdpNet {
    socket: Arc<UdpSocket>,
    config: Config,
}

impl UdpNet {
    /// Binds the local site's configured endpoint.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        let socket = UdpSocket::bind(config.local().addr).await?;
        info!("site {} listening on {}", config.id(), config.local().addr);
        Ok(UdpNet {
            socket: Arc::new(socket),
            config,
        })
    }

    /// Spawns the receiver task: every inbound datagram is posted onto the
    /// event queue as `PacketIn` and demultiplexed inside the dispatch loop.
    pub fn spawn_receiver(&self, queue: Queue) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("{} bytes in from {}", len, from);
                        queue.post(EventKind::PacketIn, Some(buf[..len].to_vec()));
                    }
                    Err(err) => {
                        // Transient receive errors are dropped like lost
                        // packets; the loop keeps listening.
                        warn!("recv failed: {}", err);
                    }
                }
            }
        });
    }
}

impl Net for UdpNet {
    fn send(&self, dest: SiteId, datagram: &[u8]) -> Result<(), Error> {
        let site = self.config.site(dest).ok_or(Error::BadSite(dest))?;
        self.socket.try_send_to(datagram, site.addr)?;
        Ok(())
    }

    fn broadcast(&self, datagram: &[u8]) -> Result<(), Error> {
        for site in self.config.peers() {
            debug_assert_ne!(site.id, SUPERVISOR_ID);
            self.send(site.id, datagram)?;
        }
        Ok(())
    }
}
