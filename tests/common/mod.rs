//! In-memory datagram network for association tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use sctp_engine::association::{Association, AssociationError, Config};
use sctp_engine::chunk::ChunkType;
use sctp_engine::packet::Packet;
use sctp_engine::transport::Conn;

/// Install a tracing subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Drops outbound packets carrying selected chunk types.
#[derive(Debug, Clone, Default)]
pub struct DropFilter {
    rules: Arc<Mutex<Vec<(u8, usize)>>>,
}

impl DropFilter {
    /// Drop the next `count` packets that contain a chunk of `typ`.
    pub fn drop_next(&self, typ: ChunkType, count: usize) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((typ.as_byte(), count));
        }
    }

    fn should_drop(&self, raw: &[u8]) -> bool {
        let Ok(packet) = Packet::unmarshal(&Bytes::copy_from_slice(raw)) else {
            return false;
        };
        let Ok(mut rules) = self.rules.lock() else {
            return false;
        };
        for (typ, remaining) in rules.iter_mut() {
            if *remaining > 0 && packet.chunks.iter().any(|c| c.type_byte() == *typ) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

/// One end of an in-memory datagram pipe.
#[derive(Debug)]
pub struct PipeConn {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    filter: DropFilter,
    closed: watch::Sender<bool>,
}

impl PipeConn {
    /// Filter applied to packets this end sends.
    pub fn filter(&self) -> DropFilter {
        self.filter.clone()
    }
}

#[async_trait]
impl Conn for PipeConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if *self.closed.borrow() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pipe closed"));
        }
        if !self.filter.should_drop(buf) {
            // A vanished peer is just loss.
            let _ = self.outbound.send(Bytes::copy_from_slice(buf));
        }
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            datagram = inbound.recv() => {
                let datagram = datagram
                    .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            _ = closed.wait_for(|closed| *closed) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "pipe closed"))
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// A connected pair of pipe ends.
pub fn pipe() -> (Arc<PipeConn>, Arc<PipeConn>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let end = |outbound, inbound| {
        Arc::new(PipeConn {
            outbound,
            inbound: tokio::sync::Mutex::new(inbound),
            filter: DropFilter::default(),
            closed: watch::channel(false).0,
        })
    };
    (end(a_tx, b_rx), end(b_tx, a_rx))
}

pub fn config(name: &str) -> Config {
    Config {
        name: name.to_string(),
        ..Config::default()
    }
}

/// Run client and server handshakes concurrently over `a` and `b`.
pub async fn connect(
    a: Arc<PipeConn>,
    b: Arc<PipeConn>,
    client_config: Config,
    server_config: Config,
) -> Result<(Association, Association), AssociationError> {
    let (client, server) = tokio::join!(
        Association::client(a, client_config),
        Association::server(b, server_config)
    );
    Ok((client?, server?))
}
