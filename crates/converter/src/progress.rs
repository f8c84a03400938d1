use std::time::{Duration, Instant};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

pub const FRAME_CEILING: u8 = 99;
pub const ESTIMATE_CEILING: u8 = 95;

/// Default minimum spacing between delivered progress updates
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(200);

/// Point-in-time telemetry reading from the encoder. Every field may be zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub elapsed_ms: u64,
    pub processed_bytes: u64,
    pub bitrate_kbps: f64,
    pub frame_number: u64,
    pub speed: f64,
}

/// Where a percentage came from, in order of preference. Only the terminal
/// event signals 100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Frames encoded vs. probed frame count, capped at 99
    Frames,
    /// Bytes written vs. input size, capped at 95
    Bytes,
    /// Bytes written vs. a bitrate-derived size estimate, capped at 95
    Bitrate,
    /// Seconds since the job started, capped at 95
    Elapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub percent: u8,
    pub strategy: Strategy,
}

/// Progress as delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub current_frame: i64,
    pub total_frames: i64,
}

/// Compute the percentage for one sample. Never fails: arithmetic faults fall
/// through to the elapsed-time strategy.
pub fn estimate(
    sample: Option<&ProgressSample>,
    total_frames: i64,
    input_size_bytes: u64,
    since_start: Duration,
) -> Estimate {
    sample
        .and_then(|s| telemetry_estimate(s, total_frames, input_size_bytes))
        .unwrap_or_else(|| elapsed_estimate(since_start))
}

fn telemetry_estimate(sample: &ProgressSample, total_frames: i64, input_size: u64) -> Option<Estimate> {
    if total_frames > 0 {
        let frame = i64::try_from(sample.frame_number).ok()?;
        let pct = frame.checked_mul(100)? / total_frames;
        return Some(Estimate {
            percent: pct.clamp(0, FRAME_CEILING as i64) as u8,
            strategy: Strategy::Frames,
        });
    }

    let processed = sample.processed_bytes;
    if processed > 0 && input_size > 0 {
        let pct = processed.checked_mul(100)? / input_size;
        return Some(Estimate {
            percent: pct.min(ESTIMATE_CEILING as u64) as u8,
            strategy: Strategy::Bytes,
        });
    }

    let bitrate = whole_kbps(sample.bitrate_kbps);
    if bitrate > 0 && sample.elapsed_ms > 0 {
        let estimated_total = bitrate.checked_mul(1024)?.checked_mul(sample.elapsed_ms)? / 8;
        let pct = processed.checked_mul(100)?.checked_div(estimated_total)?;
        return Some(Estimate {
            percent: pct.min(ESTIMATE_CEILING as u64) as u8,
            strategy: Strategy::Bitrate,
        });
    }

    None
}

fn elapsed_estimate(since_start: Duration) -> Estimate {
    Estimate {
        percent: since_start.as_secs().min(ESTIMATE_CEILING as u64) as u8,
        strategy: Strategy::Elapsed,
    }
}

fn whole_kbps(kbps: f64) -> u64 {
    if kbps.is_finite() && kbps >= 1.0 {
        kbps as u64
    } else {
        0
    }
}

/// Human-readable progress line
pub fn describe(percent: u8, current_frame: i64, total_frames: i64) -> String {
    if current_frame >= 0 && total_frames > 0 {
        format!("Converting: {}% (Frame {}/{})", percent, current_frame, total_frames)
    } else {
        format!("Converting: {}%", percent)
    }
}

/// Per-job estimator that throttles deliveries to one per window.
///
/// Samples arriving inside the window only refresh [`description`](Self::description);
/// the newest one is held and flushed by the next sample or tick after the
/// window closes. Delivered percent and frame never move backwards.
#[derive(Debug)]
pub struct ProgressEstimator {
    total_frames: i64,
    input_size_bytes: u64,
    started: Instant,
    window: Duration,
    last_delivery: Option<Instant>,
    pending: Option<ProgressSample>,
    seen_telemetry: bool,
    high_percent: u8,
    high_frame: i64,
    description: String,
}

impl ProgressEstimator {
    pub fn new(total_frames: i64, input_size_bytes: u64, started: Instant, window: Duration) -> Self {
        Self {
            total_frames,
            input_size_bytes,
            started,
            window,
            last_delivery: None,
            pending: None,
            seen_telemetry: false,
            high_percent: 0,
            high_frame: 0,
            description: describe(0, 0, total_frames),
        }
    }

    /// Feed one telemetry sample; returns an update if the window allows delivery
    pub fn on_sample(&mut self, sample: ProgressSample, now: Instant) -> Option<ProgressUpdate> {
        self.seen_telemetry = true;
        trace!(
            "Raw stats - time: {}ms, size: {} bytes, bitrate: {} kbps, frame: {}, speed: {}x",
            sample.elapsed_ms, sample.processed_bytes, sample.bitrate_kbps, sample.frame_number, sample.speed
        );

        let est = self.estimate_at(Some(&sample), now);
        let frame = self.high_frame.max(sample.frame_number as i64);
        self.description = describe(self.high_percent.max(est.percent), frame, self.total_frames);

        if self.window_open(now) {
            self.pending = None;
            Some(self.deliver(est, Some(&sample), now))
        } else {
            self.pending = Some(sample);
            None
        }
    }

    /// Periodic drive: flushes a held sample, or estimates from elapsed time
    /// when the encoder has produced no telemetry at all
    pub fn on_tick(&mut self, now: Instant) -> Option<ProgressUpdate> {
        if !self.window_open(now) {
            return None;
        }

        if let Some(sample) = self.pending.take() {
            let est = self.estimate_at(Some(&sample), now);
            return Some(self.deliver(est, Some(&sample), now));
        }

        if !self.seen_telemetry {
            let est = self.estimate_at(None, now);
            return Some(self.deliver(est, None, now));
        }

        None
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn estimate_at(&self, sample: Option<&ProgressSample>, now: Instant) -> Estimate {
        estimate(
            sample,
            self.total_frames,
            self.input_size_bytes,
            now.saturating_duration_since(self.started),
        )
    }

    fn window_open(&self, now: Instant) -> bool {
        self.last_delivery
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window)
    }

    fn deliver(&mut self, est: Estimate, sample: Option<&ProgressSample>, now: Instant) -> ProgressUpdate {
        self.last_delivery = Some(now);
        self.high_percent = self.high_percent.max(est.percent);
        if let Some(s) = sample {
            self.high_frame = self.high_frame.max(s.frame_number as i64);
        }
        self.description = describe(self.high_percent, self.high_frame, self.total_frames);
        debug!("{} via {:?}", self.description, est.strategy);

        ProgressUpdate {
            percent: self.high_percent,
            current_frame: self.high_frame,
            total_frames: self.total_frames,
        }
    }
}
