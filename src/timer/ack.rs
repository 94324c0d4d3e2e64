//! Delayed SACK timer (RFC 4960 6.2).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::TimerEvent;
use crate::core::ACK_INTERVAL;

#[derive(Debug, Default)]
struct AckState {
    running: bool,
    closed: bool,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// One-shot timer that posts [`TimerEvent::AckTimeout`] after the ack
/// interval.
#[derive(Debug)]
pub struct AckTimer {
    interval: Duration,
    events: mpsc::UnboundedSender<TimerEvent>,
    state: Arc<Mutex<AckState>>,
}

impl AckTimer {
    /// Create a stopped timer with the standard 200 ms interval.
    pub fn new(events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self::with_interval(ACK_INTERVAL, events)
    }

    /// Create a stopped timer with a custom interval.
    pub fn with_interval(interval: Duration, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            interval,
            events,
            state: Arc::new(Mutex::new(AckState::default())),
        }
    }

    /// Arm the timer. An armed timer keeps its original deadline so a
    /// stream of packets cannot postpone the SACK indefinitely. Returns
    /// `false` if the timer was already armed or is closed.
    pub fn start(&self) -> bool {
        let mut st = lock(&self.state);
        if st.closed || st.running {
            return false;
        }

        st.generation = st.generation.wrapping_add(1);
        st.running = true;

        let generation = st.generation;
        let interval = self.interval;
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        st.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let mut st = lock(&state);
            if st.running && st.generation == generation {
                st.running = false;
                st.handle = None;
                let _ = events.send(TimerEvent::AckTimeout { generation });
            }
        }));
        true
    }

    /// Disarm the timer. Idempotent.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        st.generation = st.generation.wrapping_add(1);
        st.running = false;
        if let Some(handle) = st.handle.take() {
            handle.abort();
        }
    }

    /// Disarm permanently.
    pub fn close(&self) {
        self.stop();
        lock(&self.state).closed = true;
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Whether `generation` belongs to the latest arming.
    pub fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }
}

impl Drop for AckTimer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.state).handle.take() {
            handle.abort();
        }
    }
}

fn lock(state: &Mutex<AckState>) -> MutexGuard<'_, AckState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = AckTimer::new(tx);
        let started = Instant::now();
        assert!(t.start());
        assert!(!t.start());

        let TimerEvent::AckTimeout { generation } = rx.recv().await.unwrap() else {
            panic!("expected ack timeout");
        };
        assert!(started.elapsed() >= ACK_INTERVAL);
        assert!(t.is_current(generation));
        assert!(!t.is_running());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = AckTimer::new(tx);
        for _ in 0..100 {
            assert!(t.start());
            t.stop();
        }
        t.close();
        assert!(!t.start());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
