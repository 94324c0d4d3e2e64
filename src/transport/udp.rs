//! [`Conn`] over a connected UDP socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::Conn;

/// A connected UDP socket used as the association's datagram pipe.
#[derive(Debug)]
pub struct UdpConn {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl UdpConn {
    /// Wrap a socket that is already connected to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Bind to `local` and connect to `remote`.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self::new(socket))
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Connected peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp conn closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Conn for UdpConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.socket.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let closed = self.close_notify.notified();
        self.check_open()?;
        tokio::select! {
            res = self.socket.recv(buf) => res,
            _ = closed => Err(io::Error::new(io::ErrorKind::NotConnected, "udp conn closed")),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn pair() -> (UdpConn, UdpConn) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (UdpConn::new(a), UdpConn::new(b))
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (a, b) = pair().await;
        assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());

        a.send(b"hello sctp").await.unwrap();
        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello sctp");
    }

    #[tokio::test]
    async fn test_close_wakes_recv() {
        let (a, _b) = pair().await;
        let a = Arc::new(a);

        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                a.recv(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await.unwrap();

        let res = reader.await.unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(a.send(b"late").await.is_err());
    }
}
