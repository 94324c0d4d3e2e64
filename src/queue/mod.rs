//! TSN-indexed queues used by the association.
//!
//! - [`PendingQueue`]: outbound chunks waiting for a TSN and window space
//! - [`InflightQueue`]: chunks on the wire awaiting acknowledgement
//! - [`ReceivedQueue`]: inbound TSNs above the cumulative ack point

mod inflight;
mod pending;
mod received;

pub use inflight::{InflightChunk, InflightQueue};
pub use pending::PendingQueue;
pub use received::ReceivedQueue;
