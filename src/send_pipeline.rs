use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::segment::Segment;

/// Abstraction for sending a datagram, introduced to facilitate mocking the
///  I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The outbound half shared by every connection on an endpoint.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_segment(&self, to: SocketAddr, segment: &Segment) -> std::io::Result<()> {
        self.socket.do_send_packet(to, &segment.to_datagram()).await
    }
}
