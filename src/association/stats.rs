//! Association counters and snapshots.

use super::AssociationState;

/// Running counters kept by the association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// DATA chunks transmitted, retransmissions included.
    pub datas_sent: u64,
    /// DATA chunks received, duplicates included.
    pub datas_received: u64,
    /// SACKs sent.
    pub sacks_sent: u64,
    /// SACKs received.
    pub sacks_received: u64,
    /// T3-rtx expirations.
    pub t3_timeouts: u64,
    /// Delayed-ack expirations.
    pub ack_timeouts: u64,
    /// Chunks sent by fast retransmit.
    pub fast_retransmits: u64,
    /// User bytes handed to the peer for the first time.
    pub bytes_sent: u64,
    /// User bytes accepted from the peer, duplicates excluded.
    pub bytes_received: u64,
}

/// Point-in-time view of an association, returned by
/// [`Association::stats`](super::Association::stats).
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationStats {
    /// Lifecycle state.
    pub state: AssociationState,
    /// Congestion window.
    pub cwnd: u32,
    /// Slow-start threshold.
    pub ssthresh: u32,
    /// Peer receive window as estimated by the sender.
    pub rwnd: u32,
    /// Receive window credit this endpoint would advertise now.
    pub receive_window: u32,
    /// Unacknowledged user bytes.
    pub bytes_in_flight: usize,
    /// User bytes queued but not yet sent.
    pub pending_bytes: usize,
    /// Outgoing stream reset requests awaiting a response.
    pub pending_reconfigs: usize,
    /// Smoothed RTT in milliseconds.
    pub srtt: f64,
    /// Current retransmission timeout in milliseconds.
    pub rto: f64,
    /// Running counters.
    pub counters: Counters,
}
