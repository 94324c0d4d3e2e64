//! Protocol constants (RFC 4960, RFC 3758, RFC 6525).
//!
//! Wire sizes are fixed by the protocol. Defaults for tunables can be
//! overridden through the association `Config`.

use std::time::Duration;

// =============================================================================
// WIRE SIZES (RFC 4960 3.1, 3.2)
// =============================================================================

/// Common header size (ports + verification tag + checksum).
pub const COMMON_HEADER_SIZE: usize = 12;

/// Chunk header size (type + flags + length).
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Parameter / error cause header size (type + length).
pub const PARAM_HEADER_SIZE: usize = 4;

/// DATA chunk header size (chunk header + TSN + stream id + SSN + PPI).
pub const DATA_CHUNK_HEADER_SIZE: usize = 16;

/// Everything on the wire is aligned to this boundary.
pub const PADDING_MULTIPLE: usize = 4;

// =============================================================================
// SIZING DEFAULTS
// =============================================================================

/// Port used on both ends; the datagram layer below does the real
/// demultiplexing.
pub const DEFAULT_SCTP_PORT: u16 = 5000;

/// Initial path MTU assumed for packet bundling.
pub const INITIAL_MTU: u32 = 1228;

/// Size of the buffer used to receive a single datagram.
pub const RECEIVE_MTU: usize = 8192;

/// Default maximum receive buffer (advertised receiver window).
pub const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;

/// Default maximum message size accepted by `Stream::write`.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;

/// Default amount of queued outbound bytes before writers are parked.
pub const DEFAULT_MAX_SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Number of inbound streams waiting in the accept queue before new
/// streams are dropped.
pub const ACCEPT_QUEUE_SIZE: usize = 16;

/// Stream count advertised in INIT / INIT-ACK.
pub const MAX_STREAMS: u16 = u16::MAX;

/// Smallest receiver window a peer may advertise in INIT (RFC 4960 6.2.1).
pub const MIN_INIT_A_RWND: u32 = 1500;

// =============================================================================
// TIMING CONSTANTS (RFC 4960 15)
// =============================================================================

/// Initial retransmission timeout in milliseconds.
pub const RTO_INITIAL: f64 = 3000.0;

/// Lower bound of the retransmission timeout in milliseconds.
pub const RTO_MIN: f64 = 1000.0;

/// Default upper bound of the retransmission timeout in milliseconds.
pub const RTO_MAX: f64 = 60000.0;

/// RTO.Alpha.
pub const RTO_ALPHA: f64 = 0.125;

/// RTO.Beta.
pub const RTO_BETA: f64 = 0.25;

/// Max.Init.Retransmits (T1-init and T1-cookie).
pub const MAX_INIT_RETRANS: u32 = 8;

/// Path.Max.Retrans (T2-shutdown).
pub const PATH_MAX_RETRANS: u32 = 5;

/// Association.Max.Retrans (T3-rtx and Reconfig).
pub const ASSOCIATION_MAX_RETRANS: u32 = 10;

/// Passing this as a timer's max retransmissions disables the limit.
pub const NO_MAX_RETRANS: u32 = 0;

/// Delayed SACK interval.
pub const ACK_INTERVAL: Duration = Duration::from_millis(200);

/// Valid lifetime of a state cookie.
pub const COOKIE_LIFETIME: Duration = Duration::from_secs(60);

// =============================================================================
// CONGESTION CONTROL (RFC 4960 7.2)
// =============================================================================

/// Upper bound used for the initial cwnd (RFC 4960 7.2.1).
pub const INITIAL_CWND_CAP: u32 = 4380;

/// Miss indications that trigger fast retransmit.
pub const FAST_RTX_THRESHOLD: u32 = 3;

// =============================================================================
// RECONFIGURATION (RFC 6525)
// =============================================================================

/// Received reset requests kept while waiting for their sender-last-TSN.
pub const MAX_RECONFIG_REQUESTS: usize = 1000;

/// Duplicate TSNs reported in a single SACK.
pub const MAX_DUPLICATE_TSNS: usize = 16;
