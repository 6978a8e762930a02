use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// The sender's egress seam: one operation, "put this datagram on the wire".
///  Tests swap in a recording double and decode exactly the packets that
///  would have gone out.
///
/// Send failures are logged, never returned - a chunk that does not make it
///  onto the wire is indistinguishable from a chunk the network lost, and
///  the NAK machinery recovers both the same way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        match self.send_to(datagram, to).await {
            Ok(sent) if sent == datagram.len() => {
                trace!("sent {} byte datagram to {:?}", sent, to);
            }
            Ok(sent) => {
                warn!("short send to {:?}: {} of {} bytes", to, sent, datagram.len());
            }
            Err(e) => {
                warn!("failed to send {} byte datagram to {:?}: {}", datagram.len(), to, e);
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("a bound socket has a local address")
    }
}
