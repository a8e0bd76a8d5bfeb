//! Mock hardware drivers for tests and hardware-free development.

use super::{ImageSensor, LightDriver, RawFrame, Rgb, SensorProfile};
use crate::error::{AnalyzerError, AppResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Record of every call made to a [`MockLight`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightCall {
    /// `set_color` was driven with this color.
    Color(Rgb),
    /// `set_uv` was driven with this level.
    Uv(u32),
}

/// Light driver that records every call for later inspection.
#[derive(Default)]
pub struct MockLight {
    calls: Arc<Mutex<Vec<LightCall>>>,
}

impl MockLight {
    /// New mock with an empty call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the call log.
    pub fn calls(&self) -> Arc<Mutex<Vec<LightCall>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl LightDriver for MockLight {
    async fn set_color(&mut self, rgb: Rgb) -> AppResult<()> {
        self.calls
            .lock()
            .map_err(|_| AnalyzerError::Hardware("light call log poisoned".into()))?
            .push(LightCall::Color(rgb));
        Ok(())
    }

    async fn set_uv(&mut self, level: u32) -> AppResult<()> {
        self.calls
            .lock()
            .map_err(|_| AnalyzerError::Hardware("light call log poisoned".into()))?
            .push(LightCall::Uv(level));
        Ok(())
    }
}

/// Sensor producing small deterministic frames, optionally failing after a
/// scripted number of successful acquisitions.
pub struct MockSensor {
    width: u32,
    height: u32,
    frames_taken: u32,
    fail_after: Option<u32>,
    profile: Option<SensorProfile>,
}

impl MockSensor {
    /// Sensor that always succeeds.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames_taken: 0,
            fail_after: None,
            profile: None,
        }
    }

    /// Sensor that fails on acquisition number `n` (zero-based).
    pub fn failing_after(width: u32, height: u32, n: u32) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new(width, height)
        }
    }

    /// Number of frames acquired so far.
    pub fn frames_taken(&self) -> u32 {
        self.frames_taken
    }

    /// The last profile applied via `configure`.
    pub fn profile(&self) -> Option<SensorProfile> {
        self.profile
    }
}

#[async_trait]
impl ImageSensor for MockSensor {
    async fn configure(&mut self, profile: SensorProfile) -> AppResult<()> {
        self.profile = Some(profile);
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<RawFrame> {
        if let Some(n) = self.fail_after {
            if self.frames_taken >= n {
                return Err(AnalyzerError::Hardware(
                    "mock sensor scripted failure".to_string(),
                ));
            }
        }
        // Each frame gets a distinct fill value so averaging is observable.
        let fill = (self.frames_taken % 251) as u8;
        self.frames_taken += 1;
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            pixels: vec![fill; self.width as usize * self.height as usize * 3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_light_records_calls() {
        let mut light = MockLight::new();
        light.set_color(Rgb::RED).await.unwrap();
        light.set_uv(1).await.unwrap();
        let calls = light.calls();
        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![LightCall::Color(Rgb::RED), LightCall::Uv(1)]
        );
    }

    #[tokio::test]
    async fn test_mock_sensor_scripted_failure() {
        let mut sensor = MockSensor::failing_after(4, 4, 1);
        assert!(sensor.acquire().await.is_ok());
        assert!(sensor.acquire().await.is_err());
    }
}
