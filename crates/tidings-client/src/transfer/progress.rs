//! Transfer speed and time-remaining estimation.

use std::time::Duration;

use tokio::time::Instant;

use tidings_shared::constants::PROGRESS_SAMPLE_SECS;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEstimate {
    pub transferred: u64,
    pub total: u64,
    /// Bytes per second, 0 until the first recompute.
    pub speed: f64,
    pub remaining_secs: Option<u64>,
}

/// Recomputes speed only once at least [`PROGRESS_SAMPLE_SECS`] have passed
/// since the previous recompute, so short bursts do not make it jitter.
#[derive(Debug)]
pub struct ProgressSampler {
    total: u64,
    last_instant: Option<Instant>,
    last_bytes: u64,
    speed: f64,
    remaining_secs: Option<u64>,
}

impl ProgressSampler {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            last_instant: None,
            last_bytes: 0,
            speed: 0.0,
            remaining_secs: None,
        }
    }

    /// Record `transferred` at `now`. Returns the estimate and whether it was
    /// recomputed by this sample.
    pub fn sample(&mut self, transferred: u64, now: Instant) -> (ProgressEstimate, bool) {
        let recomputed = match self.last_instant {
            None => {
                self.last_instant = Some(now);
                self.last_bytes = transferred;
                false
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= Duration::from_secs(PROGRESS_SAMPLE_SECS) {
                    let delta = transferred.saturating_sub(self.last_bytes);
                    self.speed = delta as f64 / elapsed.as_secs_f64();
                    self.remaining_secs = if self.speed > 0.0 {
                        let left = self.total.saturating_sub(transferred);
                        Some((left as f64 / self.speed).ceil() as u64)
                    } else {
                        None
                    };
                    self.last_instant = Some(now);
                    self.last_bytes = transferred;
                    true
                } else {
                    false
                }
            }
        };

        (
            ProgressEstimate {
                transferred,
                total: self.total,
                speed: self.speed,
                remaining_secs: self.remaining_secs,
            },
            recomputed,
        )
    }
}
