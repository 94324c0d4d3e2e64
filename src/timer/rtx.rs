//! Retransmission timers with exponential back-off (RFC 4960 6.3.3).
//!
//! An [`RtxTimer`] is armed with the current RTO. Expiry `n` (1-based) posts
//! [`TimerEvent::Timeout`] and re-arms after `min(rto * 2^n, rto_max)`; once
//! `n` exceeds the retransmission limit the timer stops itself and posts
//! [`TimerEvent::Failure`] instead.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::rto::calculate_next_timeout;
use super::TimerEvent;

/// Which transmission context a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtxTimerId {
    /// INIT retransmission.
    T1Init,
    /// COOKIE-ECHO retransmission.
    T1Cookie,
    /// SHUTDOWN / SHUTDOWN-ACK retransmission.
    T2Shutdown,
    /// DATA retransmission.
    T3Rtx,
    /// RE-CONFIG request retransmission.
    Reconfig,
}

impl fmt::Display for RtxTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::T1Init => "T1-init",
            Self::T1Cookie => "T1-cookie",
            Self::T2Shutdown => "T2-shutdown",
            Self::T3Rtx => "T3-rtx",
            Self::Reconfig => "Reconfig",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct TimerState {
    running: bool,
    closed: bool,
    generation: u64,
    n_rtos: u32,
    handle: Option<JoinHandle<()>>,
}

/// A back-off retransmission timer driven by a tokio task.
#[derive(Debug)]
pub struct RtxTimer {
    id: RtxTimerId,
    /// 0 means unlimited.
    max_retrans: u32,
    rto_max: f64,
    events: mpsc::UnboundedSender<TimerEvent>,
    state: Arc<Mutex<TimerState>>,
}

impl RtxTimer {
    /// Create a stopped timer posting into `events`.
    pub fn new(
        id: RtxTimerId,
        max_retrans: u32,
        rto_max: f64,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            id,
            max_retrans,
            rto_max,
            events,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Timer identity.
    pub fn id(&self) -> RtxTimerId {
        self.id
    }

    /// Arm the timer with `rto` milliseconds, replacing any previous arming
    /// and resetting the expiration count. Returns `false` once closed.
    pub fn start(&self, rto: f64) -> bool {
        let mut st = lock(&self.state);
        if st.closed {
            return false;
        }
        if let Some(handle) = st.handle.take() {
            handle.abort();
        }

        st.generation = st.generation.wrapping_add(1);
        st.running = true;
        st.n_rtos = 0;

        let generation = st.generation;
        let expiry = Expiry {
            id: self.id,
            max_retrans: self.max_retrans,
            generation,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
        };
        let rto_max = self.rto_max;
        st.handle = Some(tokio::spawn(async move {
            loop {
                let Some(n_rtos) = expiry.pending_n_rtos() else {
                    return;
                };
                let interval = calculate_next_timeout(rto, n_rtos, rto_max);
                tokio::time::sleep(millis(interval)).await;
                if !expiry.fire() {
                    return;
                }
            }
        }));
        true
    }

    /// Disarm the timer. Idempotent.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        st.generation = st.generation.wrapping_add(1);
        st.running = false;
        st.n_rtos = 0;
        if let Some(handle) = st.handle.take() {
            handle.abort();
        }
    }

    /// Disarm the timer permanently; later `start` calls are refused.
    pub fn close(&self) {
        self.stop();
        lock(&self.state).closed = true;
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Whether `generation` belongs to the current arming. Events from an
    /// older arming must be ignored.
    pub fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }

    /// Consecutive expirations since the last `start`.
    pub fn n_rtos(&self) -> u32 {
        lock(&self.state).n_rtos
    }
}

impl Drop for RtxTimer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.state).handle.take() {
            handle.abort();
        }
    }
}

/// What the timer task needs to post its events.
struct Expiry {
    id: RtxTimerId,
    max_retrans: u32,
    generation: u64,
    events: mpsc::UnboundedSender<TimerEvent>,
    state: Arc<Mutex<TimerState>>,
}

impl Expiry {
    /// Expiration count for the next sleep, or `None` if this arming is gone.
    fn pending_n_rtos(&self) -> Option<u32> {
        let st = lock(&self.state);
        (st.running && st.generation == self.generation).then_some(st.n_rtos)
    }

    /// Handle one expiry. Returns `true` if the timer stays armed.
    fn fire(&self) -> bool {
        let mut st = lock(&self.state);
        if !st.running || st.generation != self.generation {
            return false;
        }

        st.n_rtos += 1;
        if self.max_retrans == 0 || st.n_rtos <= self.max_retrans {
            let _ = self.events.send(TimerEvent::Timeout {
                id: self.id,
                n_rtos: st.n_rtos,
                generation: self.generation,
            });
            return true;
        }

        st.running = false;
        st.handle = None;
        let _ = self.events.send(TimerEvent::Failure {
            id: self.id,
            generation: self.generation,
        });
        false
    }
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn millis(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RTO_MAX;
    use tokio::time::Instant;

    fn timer(max_retrans: u32) -> (RtxTimer, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RtxTimer::new(RtxTimerId::T3Rtx, max_retrans, RTO_MAX, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_race_posts_nothing() {
        let (t, mut rx) = timer(0);
        for _ in 0..1000 {
            assert!(t.start(1.0));
            t.stop();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!t.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_timeout_after_rto() {
        let (t, mut rx) = timer(0);
        let started = Instant::now();
        assert!(t.start(30.0));
        let ev = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        match ev {
            TimerEvent::Timeout {
                id,
                n_rtos,
                generation,
            } => {
                assert_eq!(id, RtxTimerId::T3Rtx);
                assert_eq!(n_rtos, 1);
                assert!(t.is_current(generation));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(t.is_running());
        t.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_max_retrans() {
        let (t, mut rx) = timer(5);
        let started = Instant::now();
        assert!(t.start(10.0));

        let mut timeouts = 0;
        loop {
            match rx.recv().await.unwrap() {
                TimerEvent::Timeout { n_rtos, .. } => {
                    timeouts += 1;
                    assert_eq!(n_rtos, timeouts);
                }
                TimerEvent::Failure { id, .. } => {
                    assert_eq!(id, RtxTimerId::T3Rtx);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        let elapsed = started.elapsed();
        assert_eq!(timeouts, 5);
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
        assert!(!t.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_fails() {
        let (t, mut rx) = timer(0);
        assert!(t.start(10.0));
        for expected in 1..=12 {
            match rx.recv().await.unwrap() {
                TimerEvent::Timeout { n_rtos, .. } => assert_eq!(n_rtos, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(t.is_running());
        t.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_arming() {
        let (t, mut rx) = timer(0);
        assert!(t.start(10.0));
        assert!(t.start(10_000.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert!(t.is_running());
        t.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_timer_refuses_start() {
        let (t, mut rx) = timer(0);
        t.close();
        assert!(!t.start(10.0));
        assert!(!t.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        // Idempotent.
        t.stop();
        t.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_not_current() {
        let (t, mut rx) = timer(0);
        assert!(t.start(10.0));
        let TimerEvent::Timeout { generation, .. } = rx.recv().await.unwrap() else {
            panic!("expected timeout");
        };
        t.start(10.0);
        assert!(!t.is_current(generation));
        t.stop();
    }
}
