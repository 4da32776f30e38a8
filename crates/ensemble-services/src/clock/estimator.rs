//! Offset and stability estimation from probe/echo exchanges.
//!
//! Pure state machine: every input carries its own `now_ms`, nothing here
//! reads a clock or touches the network.
//!
//! All timestamps are *corrected* times (local time plus the offset in force
//! when they were taken). A sample's offset is therefore a residual: how far
//! this node still is from the responder. Each accepted residual moves the
//! offset by `ewma_alpha * residual`, so a group of nodes converges on the
//! average of their clocks rather than chasing one another.

use std::collections::VecDeque;

use ensemble_core::config::ClockConfig;

/// One probe exchange, all in milliseconds.
///
/// `t1` local send, `t2` peer receive, `t3` peer send, `t4` local receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
}

impl SyncSample {
    /// Round trip with the responder's processing time removed. `None` when
    /// the timestamps are too far apart to represent.
    pub fn rtt(&self) -> Option<i64> {
        let (t1, t2, t3, t4) = self.wide();
        i64::try_from((t4 - t1) - (t3 - t2)).ok()
    }

    /// Symmetric two-point offset estimate (peer minus local). `None` under
    /// the same condition as [`rtt`](Self::rtt).
    pub fn offset(&self) -> Option<f64> {
        let (t1, t2, t3, t4) = self.wide();
        let twice = i64::try_from((t2 - t1) + (t3 - t4)).ok()?;
        Some(twice as f64 / 2.0)
    }

    // Peer timestamps come off the network unchecked.
    fn wide(&self) -> (i128, i128, i128, i128) {
        (self.t1.into(), self.t2.into(), self.t3.into(), self.t4.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sample accepted yet. Offset and stability are 0.
    Unsynchronized,
    Converging,
    /// Stability has stayed above the threshold for the minimum duration.
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Accepted { residual: f64, rtt: i64 },
    /// Clocks moved under the exchange.
    NegativeRtt(i64),
    /// Timestamps span more than an `i64` of milliseconds.
    OutOfRange,
    /// Round trip too far above the recent median.
    Outlier { rtt: i64, limit: f64 },
}

impl SampleOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct OffsetEstimator {
    params: ClockConfig,
    offset: f64,
    /// Offset used for `stable_time_now`; follows `offset` only while
    /// stability is usable.
    usable_offset: f64,
    stability: f64,
    state: SyncState,
    rtts: VecDeque<i64>,
    /// Absolute offset implied by each accepted sample.
    implied: VecDeque<f64>,
    last_accept_ms: Option<i64>,
    above_since_ms: Option<i64>,
}

impl OffsetEstimator {
    pub fn new(params: ClockConfig) -> Self {
        Self {
            params,
            offset: 0.0,
            usable_offset: 0.0,
            stability: 0.0,
            state: SyncState::Unsynchronized,
            rtts: VecDeque::new(),
            implied: VecDeque::new(),
            last_accept_ms: None,
            above_since_ms: None,
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn usable_offset(&self) -> f64 {
        self.usable_offset
    }

    pub fn stability(&self) -> f64 {
        self.stability
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn params(&self) -> &ClockConfig {
        &self.params
    }

    /// Median of the recent round trips, if any.
    pub fn median_rtt(&self) -> Option<i64> {
        if self.rtts.is_empty() {
            return None;
        }
        let mut sorted: Vec<i64> = self.rtts.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Variance of the implied absolute offsets in the window.
    pub fn variance(&self) -> f64 {
        let n = self.implied.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.implied.iter().sum::<f64>() / n as f64;
        self.implied.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
    }

    /// Feed one exchange. Rejected samples leave offset and stability alone.
    pub fn on_sample(&mut self, sample: SyncSample, now_ms: i64) -> SampleOutcome {
        let (Some(rtt), Some(residual)) = (sample.rtt(), sample.offset()) else {
            return SampleOutcome::OutOfRange;
        };
        if rtt < 0 {
            return SampleOutcome::NegativeRtt(rtt);
        }

        let outlier_limit = self.outlier_limit();
        // Every plausible round trip enters the window, so a lasting shift
        // in network latency stops being an outlier after a while.
        push_bounded(&mut self.rtts, rtt, self.params.window);

        if let Some(limit) = outlier_limit {
            if rtt as f64 > limit {
                return SampleOutcome::Outlier { rtt, limit };
            }
        }

        push_bounded(&mut self.implied, self.offset + residual, self.params.window);
        self.offset += self.params.ewma_alpha * residual;

        let variance = self.variance();
        let target = if variance <= self.params.variance_bound_ms2 {
            1.0
        } else {
            self.params.variance_bound_ms2 / variance
        };
        self.stability += self.params.stability_gain * (target - self.stability);
        self.stability = self.stability.clamp(0.0, 1.0);

        self.last_accept_ms = Some(now_ms);
        self.refresh(now_ms);

        SampleOutcome::Accepted { residual, rtt }
    }

    /// Periodic housekeeping: decays stability after prolonged silence.
    pub fn on_tick(&mut self, now_ms: i64) {
        let Some(last) = self.last_accept_ms else {
            return;
        };
        if now_ms - last > self.params.silence_timeout_ms as i64 {
            self.stability *= self.params.silence_decay;
            if self.stability < 1e-6 {
                self.stability = 0.0;
            }
        }
        self.refresh(now_ms);
    }

    fn outlier_limit(&self) -> Option<f64> {
        if self.rtts.len() < self.params.min_rtt_samples {
            return None;
        }
        let median = self.median_rtt()?.max(self.params.outlier_floor_ms);
        Some(median as f64 * self.params.outlier_rtt_multiple)
    }

    fn refresh(&mut self, now_ms: i64) {
        if self.stability >= self.params.usable_threshold {
            self.usable_offset = self.offset;
        }

        if self.last_accept_ms.is_none() {
            self.state = SyncState::Unsynchronized;
            return;
        }

        if self.stability >= self.params.stable_threshold {
            let since = *self.above_since_ms.get_or_insert(now_ms);
            if now_ms - since >= self.params.min_stable_ms as i64 {
                if self.state != SyncState::Stable {
                    tracing::info!(
                        offset_ms = self.offset,
                        stability = self.stability,
                        "clock stable"
                    );
                }
                self.state = SyncState::Stable;
                return;
            }
        } else {
            self.above_since_ms = None;
            if self.state == SyncState::Stable {
                tracing::info!(stability = self.stability, "clock lost stability");
            }
        }
        self.state = SyncState::Converging;
    }
}

fn push_bounded<T>(q: &mut VecDeque<T>, value: T, cap: usize) {
    if q.len() == cap {
        q.pop_front();
    }
    q.push_back(value);
}
