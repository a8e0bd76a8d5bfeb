//! Light and camera coordination.
//!
//! The [`Coordinator`] owns the single LED board and the single image sensor
//! and tracks two pieces of readiness state: whether the light has settled
//! since it last changed, and whether the camera has finished warming up
//! since construction. The cost of waiting for either is paid at most once
//! per state change, not once per capture: the first `wait_until_ready`
//! after a light change sleeps, every later call returns zero until the
//! light changes again.
//!
//! The coordinator is an exclusive resource. A capture session owns it for
//! its whole duration; there is no internal locking because no two captures
//! may ever be in flight at once.

use crate::config::CaptureSettings;
use crate::error::AppResult;
use crate::hardware::{ImageSensor, LightDriver, RawFrame, Rgb, SensorProfile};
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Explicit capture timing configuration.
///
/// Passed to [`Coordinator::new`]; there are no hidden module-level defaults.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Time from sensor initialization until a frame is valid.
    pub warmup: Duration,
    /// Time from a light change until a frame is valid.
    pub light_settle: Duration,
    /// Guard for the skip-if-imminent policy.
    pub late_threshold: Duration,
    /// Capture resolution (width, height).
    pub resolution: (u32, u32),
    /// Sensor profile used under RGB light.
    pub rgb_profile: SensorProfile,
    /// Sensor profile used under UV light.
    pub uv_profile: SensorProfile,
}

impl From<&CaptureSettings> for CaptureConfig {
    fn from(s: &CaptureSettings) -> Self {
        Self {
            warmup: Duration::from_secs_f64(s.warmup_secs),
            light_settle: Duration::from_secs_f64(s.light_settle_secs),
            late_threshold: Duration::from_secs_f64(s.late_threshold_secs),
            resolution: s.resolution,
            rgb_profile: SensorProfile {
                shutter_us: s.rgb_shutter_us,
                gains: s.rgb_gains,
            },
            uv_profile: SensorProfile {
                shutter_us: s.uv_shutter_us,
                gains: s.uv_gains,
            },
        }
    }
}

/// A frame stamped with its wall-clock capture time.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    /// The raw frame.
    pub frame: RawFrame,
    /// Wall-clock time right after acquisition.
    pub timestamp: DateTime<Utc>,
}

/// Owner of the light and sensor, tracking readiness state.
pub struct Coordinator {
    light: Box<dyn LightDriver>,
    sensor: Box<dyn ImageSensor>,
    config: CaptureConfig,
    // None until the first set_light, mirroring an unknown power-on state.
    rgb: Option<Rgb>,
    uv: Option<u32>,
    light_change: Instant,
    light_settled: bool,
    cam_init: Instant,
    cam_ready: bool,
}

impl Coordinator {
    /// Take ownership of the drivers. Camera warm-up time is counted from
    /// here, so construct the coordinator as early as possible to minimize
    /// wait time at the first capture.
    pub fn new(
        light: Box<dyn LightDriver>,
        sensor: Box<dyn ImageSensor>,
        config: CaptureConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            light,
            sensor,
            config,
            rgb: None,
            uv: None,
            light_change: now,
            light_settled: false,
            cam_init: now,
            cam_ready: false,
        }
    }

    /// The timing configuration in use.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Apply the RGB sensor profile.
    pub async fn setup_rgb(&mut self) -> AppResult<()> {
        self.sensor.configure(self.config.rgb_profile).await
    }

    /// Apply the UV sensor profile.
    pub async fn setup_uv(&mut self) -> AppResult<()> {
        self.sensor.configure(self.config.uv_profile).await
    }

    /// Switch the light.
    ///
    /// Idempotent: if neither the RGB color nor the UV level changes, the
    /// drivers are not touched and the settle timer keeps running. Any
    /// actual change resets the settle timer.
    pub async fn set_light(&mut self, rgb: Rgb, uv: u32) -> AppResult<()> {
        let mut changed = false;
        if self.rgb != Some(rgb) {
            self.light.set_color(rgb).await?;
            self.rgb = Some(rgb);
            changed = true;
        }
        if self.uv != Some(uv) {
            self.light.set_uv(uv).await?;
            self.uv = Some(uv);
            changed = true;
        }
        if changed {
            self.light_change = Instant::now();
            self.light_settled = false;
        }
        Ok(())
    }

    /// Turn the light fully off. Required cleanup on every capture-run exit
    /// path, not only success.
    pub async fn light_off(&mut self) -> AppResult<()> {
        self.set_light(Rgb::OFF, 0).await
    }

    /// Wait until a capture would be valid, returning how long was waited.
    ///
    /// One-shot amortized: the settle and warm-up flags are set before
    /// sleeping, so a second call with no intervening state change returns
    /// zero immediately.
    pub async fn wait_until_ready(&mut self, wait_for_light: bool) -> Duration {
        let mut wait = Duration::ZERO;
        let now = Instant::now();
        if wait_for_light && !self.light_settled {
            let since_change = now.duration_since(self.light_change);
            wait = self.config.light_settle.saturating_sub(since_change);
            self.light_settled = true;
        }
        if !self.cam_ready {
            let since_init = now.duration_since(self.cam_init);
            wait = wait.max(self.config.warmup.saturating_sub(since_init));
            self.cam_ready = true;
        }
        if wait > Duration::ZERO {
            debug!("waiting {:?} for light/camera readiness", wait);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Capture a single frame, stamped with wall-clock time.
    ///
    /// Waits for readiness first. A sensor acquisition failure is fatal to
    /// this capture attempt and propagates; there is no internal retry.
    pub async fn capture_frame(&mut self) -> AppResult<TimedFrame> {
        self.wait_until_ready(true).await;
        let frame = self.sensor.acquire().await?;
        Ok(TimedFrame {
            frame,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{LightCall, MockLight, MockSensor};

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            warmup: Duration::from_secs(15),
            light_settle: Duration::from_millis(500),
            late_threshold: Duration::from_millis(500),
            resolution: (4, 4),
            rgb_profile: SensorProfile {
                shutter_us: 500,
                gains: (1.0, 1.0),
            },
            uv_profile: SensorProfile {
                shutter_us: 5000,
                gains: (1.2, 1.2),
            },
        }
    }

    fn test_coordinator() -> (Coordinator, std::sync::Arc<std::sync::Mutex<Vec<LightCall>>>) {
        let light = MockLight::new();
        let calls = light.calls();
        let coordinator = Coordinator::new(
            Box::new(light),
            Box::new(MockSensor::new(4, 4)),
            test_config(),
        );
        (coordinator, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_is_one_shot() {
        let (mut c, _) = test_coordinator();
        c.set_light(Rgb::WHITE, 0).await.unwrap();
        let first = c.wait_until_ready(true).await;
        assert!(first >= Duration::from_secs(14));
        let second = c.wait_until_ready(true).await;
        assert_eq!(second, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_change_resets_settle_only() {
        let (mut c, _) = test_coordinator();
        c.set_light(Rgb::WHITE, 0).await.unwrap();
        c.wait_until_ready(true).await;
        // Change the light: the warm-up is already paid, only settle remains.
        c.set_light(Rgb::RED, 0).await.unwrap();
        let wait = c.wait_until_ready(true).await;
        assert!(wait <= Duration::from_millis(500));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_light_is_idempotent() {
        let (mut c, calls) = test_coordinator();
        c.set_light(Rgb::BLUE, 0).await.unwrap();
        let count_after_first = calls.lock().unwrap().len();
        c.set_light(Rgb::BLUE, 0).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), count_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_set_does_not_reset_settle_timer() {
        let (mut c, _) = test_coordinator();
        c.set_light(Rgb::GREEN, 0).await.unwrap();
        c.wait_until_ready(true).await;
        c.set_light(Rgb::GREEN, 0).await.unwrap();
        assert_eq!(c.wait_until_ready(true).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_propagates() {
        let light = MockLight::new();
        let mut c = Coordinator::new(
            Box::new(light),
            Box::new(MockSensor::failing_after(4, 4, 0)),
            test_config(),
        );
        assert!(c.capture_frame().await.is_err());
    }
}
