//! The association: handshake, reliable delivery, shutdown and stream reset.
//!
//! An association is owned by a single tokio task (the driver). Every
//! mutation is serialised through it:
//!
//! ```text
//!   Association / Stream handles ──commands──┐
//!   Conn::recv (reader task) ──datagrams─────┼──▶ driver ──▶ Conn::send
//!   RtxTimer / AckTimer tasks ──timer events─┘
//! ```
//!
//! After each input the driver re-evaluates parked readers, writers and
//! acceptors, then gathers and sends whatever packets the new state calls
//! for. Handles talk to the driver over a command channel and never touch
//! association state directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sctp_engine::association::{Association, ConfigBuilder};
//! use sctp_engine::transport::UdpConn;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Arc::new(UdpConn::connect("0.0.0.0:5000".parse()?, "10.0.0.2:5000".parse()?).await?);
//! let config = ConfigBuilder::new().name("server").build()?;
//! let assoc = Association::server(conn, config).await?;
//!
//! let stream = assoc.accept_stream().await?;
//! let mut buf = vec![0u8; 65536];
//! let n = stream.read(&mut buf).await?;
//! println!("stream {} got {} bytes", stream.stream_id(), n);
//! assoc.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod cookie;
mod data;
mod driver;
mod error;
mod internal;
mod reconfig;
mod stats;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub use config::{AckMode, Config, ConfigBuilder};
pub use cookie::{CookieError, CookieSigner, StateCookie};
pub use error::AssociationError;
pub use stats::{AssociationStats, Counters};

use crate::chunk::PayloadProtocolIdentifier;
use crate::stream::{ReliabilityType, Stream, StreamStatus};
use crate::transport::Conn;
use driver::Driver;

/// Commands queued between handles and the driver.
const COMMAND_QUEUE_SIZE: usize = 64;

/// Association lifecycle states (RFC 4960 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No association, or the association has ended.
    Closed,
    /// INIT sent, waiting for INIT-ACK.
    CookieWait,
    /// COOKIE-ECHO sent, waiting for COOKIE-ACK.
    CookieEchoed,
    /// Data may flow.
    Established,
    /// Local shutdown requested; draining outstanding data.
    ShutdownPending,
    /// SHUTDOWN sent.
    ShutdownSent,
    /// SHUTDOWN received; draining outstanding data.
    ShutdownReceived,
    /// SHUTDOWN-ACK sent.
    ShutdownAckSent,
}

impl AssociationState {
    /// Whether a shutdown is in progress.
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            Self::ShutdownPending
                | Self::ShutdownSent
                | Self::ShutdownReceived
                | Self::ShutdownAckSent
        )
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, AssociationError>>;

/// Requests from handles to the driver.
pub(crate) enum Command {
    OpenStream {
        stream_id: u16,
        ppi: PayloadProtocolIdentifier,
        reply: Reply<()>,
    },
    AcceptStream {
        reply: Reply<u16>,
    },
    /// Resolves with an empty payload at end of stream.
    Read {
        stream_id: u16,
        capacity: usize,
        reply: Reply<(Bytes, PayloadProtocolIdentifier)>,
    },
    Write {
        stream_id: u16,
        data: Bytes,
        ppi: Option<PayloadProtocolIdentifier>,
        reply: Reply<usize>,
    },
    SetReliability {
        stream_id: u16,
        unordered: bool,
        reliability: ReliabilityType,
        value: u32,
        reply: Reply<()>,
    },
    CloseStream {
        stream_id: u16,
        reply: Reply<()>,
    },
    StreamStatus {
        stream_id: u16,
        reply: Reply<StreamStatus>,
    },
    BufferedAmount {
        stream_id: u16,
        reply: Reply<usize>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<AssociationStats>,
    },
}

/// Send a command and wait for its reply. A driver that has gone away
/// reads as a closed association.
pub(crate) async fn request<T>(
    cmd_tx: &mpsc::Sender<Command>,
    build: impl FnOnce(Reply<T>) -> Command,
) -> Result<T, AssociationError> {
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(build(tx))
        .await
        .map_err(|_| AssociationError::Closed)?;
    rx.await.map_err(|_| AssociationError::Closed)?
}

/// Handle to a running association. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Association {
    name: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Association {
    /// Start an association as the initiator and wait until it is
    /// established.
    pub async fn client(conn: Arc<dyn Conn>, config: Config) -> Result<Self, AssociationError> {
        Self::create(conn, config, true).await
    }

    /// Wait for a peer to initiate an association over `conn`.
    pub async fn server(conn: Arc<dyn Conn>, config: Config) -> Result<Self, AssociationError> {
        Self::create(conn, config, false).await
    }

    async fn create(
        conn: Arc<dyn Conn>,
        config: Config,
        is_client: bool,
    ) -> Result<Self, AssociationError> {
        config.validate().map_err(|e| match e {
            crate::core::Error::Config(reason) => AssociationError::InvalidConfig(reason),
            other => AssociationError::InvalidConfig(other.to_string()),
        })?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let driver = Driver::new(conn, config, cmd_rx, handshake_tx);
        tokio::spawn(driver.run(is_client));

        handshake_rx.await.map_err(|_| AssociationError::Closed)??;
        Ok(Self { name, cmd_tx })
    }

    /// Name given in the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open an outbound stream. Fails if `stream_id` is already in use.
    pub async fn open_stream(
        &self,
        stream_id: u16,
        ppi: PayloadProtocolIdentifier,
    ) -> Result<Stream, AssociationError> {
        request(&self.cmd_tx, |reply| Command::OpenStream {
            stream_id,
            ppi,
            reply,
        })
        .await?;
        Ok(Stream::new(stream_id, self.cmd_tx.clone()))
    }

    /// Wait for the peer to start sending on a new stream.
    pub async fn accept_stream(&self) -> Result<Stream, AssociationError> {
        let stream_id = request(&self.cmd_tx, |reply| Command::AcceptStream { reply }).await?;
        Ok(Stream::new(stream_id, self.cmd_tx.clone()))
    }

    /// Gracefully shut the association down: outstanding data is delivered,
    /// then SHUTDOWN / SHUTDOWN-ACK / SHUTDOWN-COMPLETE are exchanged.
    /// Resolves once the association is closed.
    pub async fn shutdown(&self) -> Result<(), AssociationError> {
        request(&self.cmd_tx, |reply| Command::Shutdown { reply }).await
    }

    /// Abort the association immediately. Idempotent.
    pub async fn close(&self) -> Result<(), AssociationError> {
        match request(&self.cmd_tx, |reply| Command::Close { reply }).await {
            Err(AssociationError::Closed) => Ok(()),
            other => other,
        }
    }

    /// Snapshot of the association's state and counters.
    pub async fn stats(&self) -> Result<AssociationStats, AssociationError> {
        request(&self.cmd_tx, |reply| Command::Stats { reply }).await
    }
}
