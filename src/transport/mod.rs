//! Datagram transport underneath the association.
//!
//! The association only needs a connected, best-effort datagram pipe. DTLS,
//! ICE or plain UDP all fit behind [`Conn`]; [`UdpConn`] is the adapter
//! for a connected tokio [`UdpSocket`](tokio::net::UdpSocket).
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Streams / application            │
//! ├─────────────────────────────────────────┤
//! │           Association                   │
//! │  handshake, SACK, rtx, reconfig         │
//! ├─────────────────────────────────────────┤
//! │           Conn                          │  ← This module
//! ├─────────────────────────────────────────┤
//! │     DTLS / UDP / in-memory pipe         │
//! └─────────────────────────────────────────┘
//! ```

mod udp;

use std::io;

use async_trait::async_trait;

pub use udp::*;

/// A connected, unreliable datagram transport.
///
/// Each `send` carries exactly one SCTP packet and each `recv` returns
/// exactly one. Implementations must be usable from several tasks at once:
/// the association reads and writes concurrently.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Send one datagram, returning the number of bytes written.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the transport. Pending and later `recv` calls fail.
    async fn close(&self) -> io::Result<()>;
}
