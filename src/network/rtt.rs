//! Round-trip time and retransmission timeout estimation
//!
//! Jacobson/Karels estimator (RFC 6298 shape):
//!
//! ```text
//! first sample:  SRTT = R,  RTTVAR = R/2
//! later:         RTTVAR = (1-β)·RTTVAR + β·|SRTT − R|
//!                SRTT   = (1-α)·SRTT   + α·R
//! RTO = clamp(SRTT + k·RTTVAR, min_rto, max_rto)
//! ```
//!
//! When several samples are expected per round trip, α and β are divided by
//! that count so one window of samples weighs like a single sample.

use std::time::Duration;

/// Estimator parameters
#[derive(Debug, Clone)]
pub struct RttEstimatorOptions {
    pub alpha: f64,
    pub beta: f64,
    pub k: f64,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
}

impl Default for RttEstimatorOptions {
    fn default() -> Self {
        Self {
            alpha: 0.125,
            beta: 0.25,
            k: 4.0,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(20),
        }
    }
}

impl RttEstimatorOptions {
    /// Bounds derived from the jitter buffer delay: a request that has not
    /// come back within the whole buffering delay is retried.
    pub fn for_jitter_delay(jitter_delay: Duration, min_rto: Duration) -> Self {
        Self {
            initial_rto: jitter_delay,
            min_rto: min_rto.min(jitter_delay),
            max_rto: jitter_delay,
            ..Self::default()
        }
    }
}

/// Smoothed RTT / RTO estimator
#[derive(Debug, Clone)]
pub struct RttEstimator {
    options: RttEstimatorOptions,
    srtt_ms: f64,
    rttvar_ms: f64,
    rto_ms: f64,
    rtt_min_ms: f64,
    rtt_max_ms: f64,
    rtt_avg_ms: f64,
    n_samples: u64,
}

impl RttEstimator {
    pub fn new(options: RttEstimatorOptions) -> Self {
        let rto_ms = duration_ms(options.initial_rto);
        Self {
            options,
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto_ms,
            rtt_min_ms: f64::MAX,
            rtt_max_ms: 0.0,
            rtt_avg_ms: 0.0,
            n_samples: 0,
        }
    }

    /// Record one RTT sample
    ///
    /// `expected_samples` is the number of samples expected in one round
    /// trip (at least 1).
    pub fn add_measurement(&mut self, rtt: Duration, expected_samples: usize) {
        let rtt_ms = duration_ms(rtt);
        let n = expected_samples.max(1) as f64;

        if self.n_samples == 0 {
            self.srtt_ms = rtt_ms;
            self.rttvar_ms = rtt_ms / 2.0;
        } else {
            let alpha = self.options.alpha / n;
            let beta = self.options.beta / n;
            self.rttvar_ms = (1.0 - beta) * self.rttvar_ms + beta * (self.srtt_ms - rtt_ms).abs();
            self.srtt_ms = (1.0 - alpha) * self.srtt_ms + alpha * rtt_ms;
        }

        let min = duration_ms(self.options.min_rto);
        let max = duration_ms(self.options.max_rto);
        self.rto_ms = (self.srtt_ms + self.options.k * self.rttvar_ms).clamp(min, max);

        self.rtt_avg_ms =
            (self.n_samples as f64 * self.rtt_avg_ms + rtt_ms) / (self.n_samples + 1) as f64;
        self.rtt_min_ms = self.rtt_min_ms.min(rtt_ms);
        self.rtt_max_ms = self.rtt_max_ms.max(rtt_ms);
        self.n_samples += 1;
    }

    /// Mean of all samples so far; zero before the first sample
    pub fn avg_rtt(&self) -> Duration {
        ms_duration(self.rtt_avg_ms)
    }

    pub fn smoothed_rtt(&self) -> Duration {
        ms_duration(self.srtt_ms)
    }

    pub fn rtt_variance(&self) -> Duration {
        ms_duration(self.rttvar_ms)
    }

    pub fn estimated_rto(&self) -> Duration {
        ms_duration(self.rto_ms)
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        (self.n_samples > 0).then(|| ms_duration(self.rtt_min_ms))
    }

    pub fn max_rtt(&self) -> Option<Duration> {
        (self.n_samples > 0).then(|| ms_duration(self.rtt_max_ms))
    }

    pub fn sample_count(&self) -> u64 {
        self.n_samples
    }

    pub fn options(&self) -> &RttEstimatorOptions {
        &self.options
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

fn ms_duration(ms: f64) -> Duration {
    Duration::from_nanos((ms.max(0.0) * 1e6).round() as u64)
}
