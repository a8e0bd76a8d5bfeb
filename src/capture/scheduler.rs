//! Capture scheduling.
//!
//! Realizes a [`CaptureSchedule`] against the monotonic clock with
//! cooperative, synchronous waiting. Captures are strictly sequential, one
//! sensor and one light, so there is no background clock task: the loop
//! sleeps until the next offset and captures.
//!
//! When a capture takes longer than the requested cadence the loop falls
//! behind. Instead of letting a backlog build up, the skip-if-imminent
//! policy ([`should_skip`]) drops a late capture whenever the next offset is
//! already closer than the late threshold, since the late frame would be
//! superseded almost immediately. A schedule overrun is informational, never
//! an error.

use crate::capture::coordinator::{Coordinator, TimedFrame};
use crate::error::{AnalyzerError, AppResult};
use crate::hardware::RawFrame;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// An ordered sequence of non-negative capture offsets, consumed once.
#[derive(Debug, Clone, Default)]
pub struct CaptureSchedule {
    offsets: Vec<Duration>,
}

impl CaptureSchedule {
    /// Schedule from explicit offsets. Offsets need not be evenly spaced but
    /// are expected in ascending order.
    pub fn new(offsets: Vec<Duration>) -> Self {
        Self { offsets }
    }

    /// Schedule from offsets in seconds. Negative values are clamped to zero.
    pub fn from_secs(secs: &[f64]) -> Self {
        Self {
            offsets: secs
                .iter()
                .map(|&s| Duration::from_secs_f64(s.max(0.0)))
                .collect(),
        }
    }

    /// `count` captures spaced `interval` apart, starting at zero.
    pub fn evenly(interval: Duration, count: usize) -> Self {
        Self {
            offsets: (0..count).map(|i| interval * i as u32).collect(),
        }
    }

    /// The offsets, in order.
    pub fn offsets(&self) -> &[Duration] {
        &self.offsets
    }

    /// Number of scheduled captures.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True for the empty schedule, which is a no-op to run.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Options for a schedule run.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Pay the one-shot warm-up/settle cost before the schedule clock
    /// starts, so a 0-offset first capture is not late from the outset.
    pub wait_first: bool,
    /// Count offsets from this instant instead of from entering the run.
    /// Used to chain schedules against one shared start time.
    pub start: Option<Instant>,
}

/// The skip-if-imminent policy.
///
/// A late capture is skipped when the next scheduled offset is already
/// closer than `late_threshold`, because the frame would be superseded by
/// the next one almost immediately. Never applied to the last offset, which
/// is always captured even when late.
pub fn should_skip(elapsed: Duration, next_offset: Duration, late_threshold: Duration) -> bool {
    next_offset.saturating_sub(elapsed) < late_threshold
}

/// Run a schedule, capturing one frame per non-skipped offset.
///
/// The light is switched off before any error or abort propagates. On
/// success the light is left as-is so multi-color sequences can chain
/// schedules; the capture run owner does the final light-off.
pub async fn run_schedule(
    coordinator: &mut Coordinator,
    schedule: &CaptureSchedule,
    opts: ScheduleOptions,
    abort: &mut watch::Receiver<bool>,
) -> AppResult<Vec<TimedFrame>> {
    if schedule.is_empty() {
        return Ok(Vec::new());
    }
    if opts.wait_first {
        coordinator.wait_until_ready(true).await;
    }
    let start = opts.start.unwrap_or_else(Instant::now);
    let late_threshold = coordinator.config().late_threshold;
    let offsets = schedule.offsets();
    let mut frames = Vec::with_capacity(offsets.len());

    for (index, &offset) in offsets.iter().enumerate() {
        if *abort.borrow() {
            return aborted(coordinator).await;
        }
        let elapsed = start.elapsed();
        if offset > elapsed {
            if sleep_or_abort(start + offset, abort).await {
                return aborted(coordinator).await;
            }
        } else if let Some(&next) = offsets.get(index + 1) {
            if should_skip(elapsed, next, late_threshold) {
                debug!(
                    "skipping capture at offset {:?}: {:?} behind schedule, next is imminent",
                    offset,
                    elapsed - offset
                );
                continue;
            }
        }
        match coordinator.capture_frame().await {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                if let Err(off_err) = coordinator.light_off().await {
                    warn!("light off after capture failure also failed: {off_err}");
                }
                return Err(e);
            }
        }
    }
    Ok(frames)
}

/// Capture every offset and emit one averaged frame.
///
/// No skip policy here: if the captures fall behind, frames are simply taken
/// as fast as possible. The averaged frame is timestamped at the temporal
/// midpoint index of the schedule. Returns `None` for an empty schedule.
pub async fn run_averaged(
    coordinator: &mut Coordinator,
    schedule: &CaptureSchedule,
    opts: ScheduleOptions,
    abort: &mut watch::Receiver<bool>,
) -> AppResult<Option<TimedFrame>> {
    if schedule.is_empty() {
        return Ok(None);
    }
    coordinator.wait_until_ready(true).await;
    let start = opts.start.unwrap_or_else(Instant::now);
    let offsets = schedule.offsets();
    let midpoint = offsets.len() / 2;

    // Accumulate in f32 to avoid u8 overruns.
    let mut sum: Vec<f32> = Vec::new();
    let mut width = 0u32;
    let mut height = 0u32;
    let mut midpoint_stamp = None;

    for (index, &offset) in offsets.iter().enumerate() {
        if *abort.borrow() {
            return aborted(coordinator).await;
        }
        let elapsed = start.elapsed();
        if offset > elapsed {
            if sleep_or_abort(start + offset, abort).await {
                return aborted(coordinator).await;
            }
        }
        let timed = match coordinator.capture_frame().await {
            Ok(t) => t,
            Err(e) => {
                if let Err(off_err) = coordinator.light_off().await {
                    warn!("light off after capture failure also failed: {off_err}");
                }
                return Err(e);
            }
        };
        if sum.is_empty() {
            width = timed.frame.width;
            height = timed.frame.height;
            sum = vec![0.0; timed.frame.pixels.len()];
        }
        for (acc, &px) in sum.iter_mut().zip(timed.frame.pixels.iter()) {
            *acc += px as f32;
        }
        if index == midpoint {
            midpoint_stamp = Some(timed.timestamp);
        }
    }

    let count = offsets.len() as f32;
    let pixels = sum.iter().map(|&v| (v / count) as u8).collect();
    let timestamp = midpoint_stamp.unwrap_or_else(chrono::Utc::now);
    Ok(Some(TimedFrame {
        frame: RawFrame {
            width,
            height,
            pixels,
        },
        timestamp,
    }))
}

/// Sleep until `deadline` unless an abort arrives first. Returns true when
/// the run was aborted. A dropped abort sender means abort can never fire
/// and the sleep completes normally.
async fn sleep_or_abort(deadline: Instant, abort: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = abort.changed() => match changed {
                Ok(()) if *abort.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    sleep.as_mut().await;
                    return false;
                }
            },
        }
    }
}

async fn aborted<T>(coordinator: &mut Coordinator) -> AppResult<T> {
    if let Err(e) = coordinator.light_off().await {
        warn!("light off on abort failed: {e}");
    }
    Err(AnalyzerError::Aborted)
}
