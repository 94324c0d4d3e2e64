//! Retransmission timeout estimation (RFC 4960 6.3.1).
//!
//! All values are kept as `f64` milliseconds. The RTO is recomputed from
//! each RTT measurement and clamped to `[rto_min, rto_max]`.

use std::time::Duration;

use crate::core::{RTO_ALPHA, RTO_BETA, RTO_INITIAL, RTO_MAX, RTO_MIN};

/// Smoothed RTT tracker producing the retransmission timeout.
#[derive(Debug, Clone)]
pub struct RtoManager {
    /// Smoothed RTT in milliseconds (0 before the first sample).
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Current RTO in milliseconds.
    rto: f64,
    /// RTO before the first measurement.
    rto_initial: f64,
    /// Lower clamp for the RTO.
    rto_min: f64,
    /// Upper clamp for the RTO.
    rto_max: f64,
    /// When set, measurements no longer change the RTO.
    no_update: bool,
}

impl Default for RtoManager {
    fn default() -> Self {
        Self::new(RTO_MAX)
    }
}

impl RtoManager {
    /// Create an estimator clamped to `rto_max` milliseconds. A non-positive
    /// value selects the default of 60 seconds.
    pub fn new(rto_max: f64) -> Self {
        Self::with_bounds(RTO_INITIAL, RTO_MIN, rto_max)
    }

    /// Create an estimator starting at `rto_initial` and clamped to
    /// `[rto_min, rto_max]`. Non-positive values select the defaults; the
    /// lower bound never exceeds the upper one.
    pub fn with_bounds(rto_initial: f64, rto_min: f64, rto_max: f64) -> Self {
        let rto_max = if rto_max > 0.0 { rto_max } else { RTO_MAX };
        let rto_min = if rto_min > 0.0 { rto_min } else { RTO_MIN }.min(rto_max);
        let rto_initial = if rto_initial > 0.0 { rto_initial } else { RTO_INITIAL };
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: rto_initial.clamp(rto_min, rto_max),
            rto_initial,
            rto_min,
            rto_max,
            no_update: false,
        }
    }

    /// Feed one RTT measurement in milliseconds and return the new SRTT.
    ///
    /// - First measurement: SRTT = R, RTTVAR = R/2
    /// - Later: RTTVAR = (1 - beta) RTTVAR + beta |SRTT - R|,
    ///   SRTT = (1 - alpha) SRTT + alpha R
    /// - RTO = SRTT + 4 RTTVAR, clamped
    pub fn set_new_rtt(&mut self, rtt: f64) -> f64 {
        if self.no_update {
            return self.srtt;
        }

        if self.srtt == 0.0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
        } else {
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt;
        }

        self.rto = (self.srtt + 4.0 * self.rttvar).clamp(self.rto_min, self.rto_max);
        self.srtt
    }

    /// Current RTO in milliseconds.
    pub fn get_rto(&self) -> f64 {
        self.rto
    }

    /// Current RTO as a [`Duration`].
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto / 1000.0)
    }

    /// Pin the RTO. With `no_update` set, later measurements are ignored.
    pub fn set_rto(&mut self, rto: f64, no_update: bool) {
        self.rto = rto;
        self.no_update = no_update;
    }

    /// Forget all measurements. A pinned RTO stays pinned.
    pub fn reset(&mut self) {
        if self.no_update {
            return;
        }
        self.srtt = 0.0;
        self.rttvar = 0.0;
        self.rto = self.rto_initial.clamp(self.rto_min, self.rto_max);
    }

    /// Smoothed RTT in milliseconds.
    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    /// RTT variance in milliseconds.
    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    /// Lower clamp in milliseconds.
    pub fn rto_min(&self) -> f64 {
        self.rto_min
    }

    /// Upper clamp in milliseconds.
    pub fn rto_max(&self) -> f64 {
        self.rto_max
    }
}

/// Interval before the next expiry of a timer started with `rto` that has
/// already expired `n_rtos` times: `min(rto * 2^n_rtos, rto_max)`.
pub fn calculate_next_timeout(rto: f64, n_rtos: u32, rto_max: f64) -> f64 {
    // 2^31 overflows the shift; anything that large is clamped anyway.
    if n_rtos < 31 {
        (rto * (1u32 << n_rtos) as f64).min(rto_max)
    } else {
        rto_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_values() {
        let m = RtoManager::default();
        assert_eq!(m.get_rto(), 3000.0);
        assert_eq!(m.srtt(), 0.0);
        assert_eq!(m.rto(), Duration::from_secs(3));
    }

    #[test]
    fn test_rto_converges_for_short_rtt() {
        let mut m = RtoManager::default();
        let expected = [1800, 1500, 1275, 1106, 1000];
        for exp in expected {
            m.set_new_rtt(600.0);
            assert_eq!(m.get_rto().floor() as u64, exp);
        }
    }

    #[test]
    fn test_rto_clamped_for_long_rtt() {
        let mut m = RtoManager::default();
        let expected = [60000, 60000, 60000, 55312, 48984];
        for exp in expected {
            m.set_new_rtt(30000.0);
            assert_eq!(m.get_rto().floor() as u64, exp);
        }
    }

    #[test]
    fn test_custom_rto_max() {
        let mut m = RtoManager::new(2000.0);
        assert_eq!(m.get_rto(), 2000.0);
        m.set_new_rtt(5000.0);
        assert_eq!(m.get_rto(), 2000.0);
    }

    #[test]
    fn test_custom_bounds() {
        let mut m = RtoManager::with_bounds(500.0, 200.0, 10000.0);
        assert_eq!(m.get_rto(), 500.0);
        assert_eq!(m.rto_min(), 200.0);
        m.set_new_rtt(20.0);
        assert_eq!(m.get_rto(), 200.0);
        m.reset();
        assert_eq!(m.get_rto(), 500.0);

        // A lower bound above the upper one collapses onto it.
        let m = RtoManager::with_bounds(0.0, 5000.0, 2000.0);
        assert_eq!(m.rto_min(), 2000.0);
        assert_eq!(m.get_rto(), 2000.0);
    }

    #[test]
    fn test_reset_and_pin() {
        let mut m = RtoManager::default();
        m.set_new_rtt(600.0);
        m.reset();
        assert_eq!(m.srtt(), 0.0);
        assert_eq!(m.get_rto(), 3000.0);

        m.set_rto(100.0, true);
        m.set_new_rtt(600.0);
        m.reset();
        assert_eq!(m.get_rto(), 100.0);
        assert_eq!(m.srtt(), 0.0);
    }

    #[test]
    fn test_calculate_next_timeout() {
        assert_eq!(calculate_next_timeout(1.0, 0, RTO_MAX), 1.0);
        assert_eq!(calculate_next_timeout(1.0, 1, RTO_MAX), 2.0);
        assert_eq!(calculate_next_timeout(1.0, 2, RTO_MAX), 4.0);
        assert_eq!(calculate_next_timeout(1.0, 30, RTO_MAX), 60000.0);
        assert_eq!(calculate_next_timeout(1.0, 31, RTO_MAX), 60000.0);
        assert_eq!(calculate_next_timeout(1.0, 0xFFFF_FFFF, RTO_MAX), 60000.0);
    }

    #[test]
    fn test_calculate_next_timeout_small_max() {
        assert_eq!(calculate_next_timeout(1.0, 0, 2.0), 1.0);
        assert_eq!(calculate_next_timeout(1.5, 1, 2.0), 2.0);
        assert_eq!(calculate_next_timeout(1.0, 10, 2.0), 2.0);
    }
}
