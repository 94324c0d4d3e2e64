//! Congestion and flow control (RFC 4960 6.1, 7.2).
//!
//! [`CongestionController`] owns the sender's view of the path: the
//! congestion window, the slow-start threshold and the peer's receive
//! window. The association feeds it SACK results and timer expiries; it
//! answers whether another DATA chunk may go out.

use crate::core::{sna32_gte, INITIAL_CWND_CAP};

/// Sender-side cwnd / ssthresh / rwnd bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionController {
    mtu: u32,
    cwnd: u32,
    ssthresh: u32,
    rwnd: u32,
    partial_bytes_acked: u32,
    in_fast_recovery: bool,
    fast_recover_exit_point: u32,
}

impl CongestionController {
    /// Initial state once the peer's a_rwnd is known (RFC 4960 7.2.1).
    pub fn new(mtu: u32, peer_a_rwnd: u32) -> Self {
        Self {
            mtu,
            cwnd: (4 * mtu).min((2 * mtu).max(INITIAL_CWND_CAP)),
            ssthresh: peer_a_rwnd,
            rwnd: peer_a_rwnd,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recover_exit_point: 0,
        }
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Slow-start threshold in bytes.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Peer receive window as currently estimated.
    pub fn rwnd(&self) -> u32 {
        self.rwnd
    }

    /// Bytes acked toward the next congestion-avoidance increment.
    pub fn partial_bytes_acked(&self) -> u32 {
        self.partial_bytes_acked
    }

    /// Path MTU used for window arithmetic.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Whether fast recovery is in progress.
    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    /// Whether a new chunk of `len` user bytes may be transmitted with
    /// `bytes_in_flight` outstanding. With nothing in flight one chunk is
    /// always allowed so a closed window gets probed.
    pub fn can_send(&self, bytes_in_flight: usize, len: usize) -> bool {
        if bytes_in_flight == 0 {
            return true;
        }
        bytes_in_flight + len <= self.cwnd as usize && len <= self.rwnd as usize
    }

    /// Account for a newly transmitted chunk.
    pub fn on_sent(&mut self, len: usize) {
        self.rwnd = self.rwnd.saturating_sub(len as u32);
    }

    /// Re-derive the peer window from a SACK.
    pub fn update_rwnd(&mut self, a_rwnd: u32, bytes_in_flight: usize) {
        self.rwnd = a_rwnd.saturating_sub(bytes_in_flight as u32);
    }

    /// Grow the window after the cumulative TSN advanced by
    /// `bytes_acked` bytes. Growth only happens while the sender still has
    /// data waiting, so an idle sender does not inflate cwnd.
    pub fn on_cumulative_ack(&mut self, bytes_acked: u32, data_pending: bool) {
        if self.cwnd <= self.ssthresh {
            if !self.in_fast_recovery && data_pending {
                self.cwnd += bytes_acked.min(self.cwnd);
            }
        } else {
            self.partial_bytes_acked += bytes_acked;
            if self.partial_bytes_acked >= self.cwnd && data_pending {
                self.partial_bytes_acked -= self.cwnd;
                self.cwnd += self.mtu;
            }
        }
    }

    /// Enter fast recovery for losses below `htna` (the highest TSN newly
    /// acknowledged). Returns `false` if recovery is already in progress,
    /// in which case the window is left alone.
    pub fn enter_fast_recovery(&mut self, htna: u32) -> bool {
        if self.in_fast_recovery {
            return false;
        }
        self.in_fast_recovery = true;
        self.fast_recover_exit_point = htna;
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.ssthresh;
        self.partial_bytes_acked = 0;
        true
    }

    /// Leave fast recovery once the cumulative ack reaches the exit point.
    pub fn maybe_exit_fast_recovery(&mut self, cumulative_tsn_ack: u32) {
        if self.in_fast_recovery && sna32_gte(cumulative_tsn_ack, self.fast_recover_exit_point) {
            self.in_fast_recovery = false;
        }
    }

    /// Collapse the window after a T3-rtx expiry (RFC 4960 7.2.3).
    pub fn on_retransmission_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.mtu;
        self.partial_bytes_acked = 0;
        self.in_fast_recovery = false;
    }
}
