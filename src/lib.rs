//! # sctp-engine
//!
//! A user-space implementation of an SCTP-class association: many independent,
//! ordered or unordered message streams multiplexed over one unreliable
//! datagram connection, each stream fully or partially reliable.
//!
//! The crate covers the association reliability engine:
//!
//! - **Chunk codec**: [`chunk`], [`param`], [`error_cause`] and [`packet`]
//!   marshal/unmarshal every chunk type, parameter and error cause
//! - **Reassembly**: [`reassembly`] turns DATA fragments back into messages
//! - **Timing**: [`timer`] holds the RTO estimator and the retransmission timers
//! - **Congestion control**: [`congestion`] gates transmission on cwnd/rwnd
//! - **Association**: [`association`] runs the handshake, SACK processing,
//!   shutdown and stream reset as a single-owner task
//! - **Streams**: [`stream`] exposes per-stream read/write handles
//!
//! The datagram layer underneath (DTLS, ICE, plain UDP) is abstracted behind
//! the [`transport::Conn`] trait.
//!
//! ## Feature Flags
//!
//! - `association` (default): the tokio-based association, timers, streams
//!   and the UDP adapter. Without it only the runtime-free pieces (codec,
//!   reassembly, RTO estimator, congestion controller) are built.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sctp_engine::prelude::*;
//!
//! # async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
//! socket.connect("127.0.0.1:5000").await?;
//! let conn = Arc::new(UdpConn::new(socket));
//!
//! let assoc = Association::client(conn, Config::default()).await?;
//! let stream = assoc
//!     .open_stream(777, PayloadProtocolIdentifier::BINARY)
//!     .await?;
//! stream.write(b"HELLO").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire codec
pub mod chunk;
pub mod codec;
pub mod error_cause;
pub mod packet;
pub mod param;

// Reliability engine
pub mod congestion;
pub mod reassembly;
pub mod timer;

// Association layer (feature-gated)
#[cfg(feature = "association")]
#[cfg_attr(docsrs, doc(cfg(feature = "association")))]
pub mod association;

#[cfg(feature = "association")]
#[cfg_attr(docsrs, doc(cfg(feature = "association")))]
pub mod queue;

#[cfg(feature = "association")]
#[cfg_attr(docsrs, doc(cfg(feature = "association")))]
pub mod stream;

#[cfg(feature = "association")]
#[cfg_attr(docsrs, doc(cfg(feature = "association")))]
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::chunk::{Chunk, ChunkError, ChunkType, DataChunk, PayloadProtocolIdentifier};
    pub use crate::core::{Error, Result};
    pub use crate::packet::Packet;
    pub use crate::reassembly::ReassemblyQueue;
    pub use crate::timer::rto::RtoManager;

    #[cfg(feature = "association")]
    pub use crate::association::{
        AckMode, Association, AssociationError, AssociationState, AssociationStats, Config,
        ConfigBuilder,
    };

    #[cfg(feature = "association")]
    pub use crate::stream::{ReliabilityType, Stream, StreamStatus};

    #[cfg(feature = "association")]
    pub use crate::transport::{Conn, UdpConn};
}

// Re-export commonly used items at crate root
pub use crate::core::{Error, Result};

#[cfg(feature = "association")]
pub use association::{Association, Config};

#[cfg(feature = "association")]
pub use stream::Stream;
