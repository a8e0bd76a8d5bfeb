//! Hardware driver seams.
//!
//! The analyzer owns exactly one LED board and one image sensor. Both are
//! reached through the small async traits here so the capture path can be
//! exercised end-to-end against mocks. The real drivers (a GPIO-backed LED
//! controller and the camera stack) live outside this crate and implement
//! these traits.

pub mod mock;

use crate::error::AppResult;
use async_trait::async_trait;

/// An RGB color as driven to the LED board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// All channels off.
    pub const OFF: Rgb = Rgb(0, 0, 0);
    /// Full white.
    pub const WHITE: Rgb = Rgb(255, 255, 255);
    /// Full red.
    pub const RED: Rgb = Rgb(255, 0, 0);
    /// Full green.
    pub const GREEN: Rgb = Rgb(0, 255, 0);
    /// Full blue.
    pub const BLUE: Rgb = Rgb(0, 0, 255);

    /// Look up a named color. Names are not case sensitive.
    pub fn from_name(name: &str) -> Option<Rgb> {
        match name.to_ascii_lowercase().as_str() {
            "off" => Some(Rgb::OFF),
            "white" => Some(Rgb::WHITE),
            "red" => Some(Rgb::RED),
            "green" => Some(Rgb::GREEN),
            "blue" => Some(Rgb::BLUE),
            _ => None,
        }
    }
}

/// Sensor profile applied before capturing under a given light mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorProfile {
    /// Shutter speed in microseconds.
    pub shutter_us: u32,
    /// White balance gains (red, blue).
    pub gains: (f64, f64),
}

/// A raw RGB24 frame straight off the sensor, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Interleaved RGB bytes, `width * height * 3` long.
    pub pixels: Vec<u8>,
}

impl RawFrame {
    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Driver for the LED board.
#[async_trait]
pub trait LightDriver: Send + Sync {
    /// Drive the RGB channels.
    async fn set_color(&mut self, rgb: Rgb) -> AppResult<()>;

    /// Drive the UV channel. Only 0 (off) and >= 1 (on) are supported by the
    /// current board.
    async fn set_uv(&mut self, level: u32) -> AppResult<()>;
}

/// Driver for the image sensor.
#[async_trait]
pub trait ImageSensor: Send + Sync {
    /// Apply a sensor profile (shutter and gains) for the coming captures.
    async fn configure(&mut self, profile: SensorProfile) -> AppResult<()>;

    /// Acquire one frame. A failure here is fatal to the capture attempt and
    /// is propagated, never retried.
    async fn acquire(&mut self) -> AppResult<RawFrame>;
}
