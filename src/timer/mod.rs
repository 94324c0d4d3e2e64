//! Retransmission timing.
//!
//! - [`rto`]: RFC 4960 6.3.1 RTO estimation (runtime-free)
//! - [`rtx`]: back-off retransmission timers (T1-init, T1-cookie,
//!   T2-shutdown, T3-rtx, Reconfig)
//! - [`ack`]: the delayed SACK timer
//!
//! Timers never call back into the association. They post [`TimerEvent`]s
//! into the association's event channel, tagged with a generation number so
//! that an event raced by a `stop` or a re-`start` can be recognised and
//! dropped.

pub mod rto;

#[cfg(feature = "association")]
pub mod ack;
#[cfg(feature = "association")]
pub mod rtx;

#[cfg(feature = "association")]
pub use ack::AckTimer;
pub use rto::{calculate_next_timeout, RtoManager};
#[cfg(feature = "association")]
pub use rtx::{RtxTimer, RtxTimerId};

/// Notification posted by a timer task.
#[cfg(feature = "association")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// A retransmission timer expired; `n_rtos` counts consecutive expirations.
    Timeout {
        /// Timer that fired.
        id: RtxTimerId,
        /// Consecutive expirations, starting at 1.
        n_rtos: u32,
        /// Generation of the arming that produced this event.
        generation: u64,
    },
    /// A retransmission timer exceeded its retransmission limit and stopped.
    Failure {
        /// Timer that gave up.
        id: RtxTimerId,
        /// Generation of the arming that produced this event.
        generation: u64,
    },
    /// The delayed-ack timer expired.
    AckTimeout {
        /// Generation of the arming that produced this event.
        generation: u64,
    },
}
