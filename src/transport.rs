use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::host::Host;

/// The datagram socket as the core sees it: non-blocking, best-effort, no
///  ordering. Introduced as a trait to mock the I/O away for testing.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    /// Queues one datagram; returns the number of bytes accepted.
    fn send(&self, to: Host, datagram: &[u8]) -> io::Result<usize>;

    /// Returns at most one pending datagram, or `None` when nothing is
    ///  waiting. Never blocks.
    fn recv(&self) -> io::Result<Option<(Host, BytesMut)>>;
}

const RECEIVE_BUFFER_SIZE: usize = 65536;

/// UDP-backed transport. The socket must be bound from within a tokio
///  runtime; all subsequent I/O goes through the non-blocking `try_` calls,
///  so the driver tick itself never suspends.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn local_host(&self) -> io::Result<Host> {
        self.local_addr().map(Host::from)
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: Host, datagram: &[u8]) -> io::Result<usize> {
        trace!(?to, len = datagram.len(), "sending datagram");
        self.socket.try_send_to(datagram, to.socket_addr())
    }

    fn recv(&self) -> io::Result<Option<(Host, BytesMut)>> {
        let mut buf = BytesMut::zeroed(RECEIVE_BUFFER_SIZE);
        match self.socket.try_recv_from(&mut buf) {
            Ok((len, from)) => {
                buf.truncate(len);
                trace!(?from, len, "received datagram");
                Ok(Some((Host::from(from), buf)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let sent = a.send(b.local_host().unwrap(), b"datagram").unwrap();
        assert_eq!(sent, 8);

        // poll until the datagram arrives
        let mut received = None;
        for _ in 0..100 {
            if let Some(datagram) = b.recv().unwrap() {
                received = Some(datagram);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let (from, data) = received.expect("datagram should arrive on loopback");
        assert_eq!(from, a.local_host().unwrap());
        assert_eq!(data.as_ref(), b"datagram");
    }

    #[tokio::test]
    async fn test_recv_on_idle_socket_is_empty() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(transport.recv().unwrap().is_none());
    }
}
