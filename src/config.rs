//! Configuration management.
//!
//! All timing constants, directory locations, console endpoints and spot
//! definitions live here. The values are deliberately passed around as
//! explicit configuration structs instead of hidden defaults, so a test can
//! construct a [`Settings`] with short timings and a temp directory without
//! touching global state.

use crate::error::AnalyzerError;
use config::Config;
use serde::Deserialize;

/// Top level application settings.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log level filter passed to the logger at startup.
    pub log_level: String,
    /// Device name sent with every uploaded measurement.
    pub device_name: String,
    /// Capture timing and sensor profiles.
    pub capture: CaptureSettings,
    /// Local result store locations.
    pub storage: StorageSettings,
    /// Remote console endpoints and credentials.
    pub console: ConsoleSettings,
    /// Sync engine tuning.
    pub sync: SyncSettings,
    /// Spot position to analyte mapping.
    pub spots: Vec<SpotSettings>,
}

/// Capture timing and per-light-mode sensor profiles.
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSettings {
    /// Time needed from sensor initialization until a frame is valid.
    pub warmup_secs: f64,
    /// Time needed from a light change until a frame is valid.
    pub light_settle_secs: f64,
    /// Guard used by the skip-if-imminent policy when a capture runs late.
    pub late_threshold_secs: f64,
    /// Capture resolution (width, height).
    pub resolution: (u32, u32),
    /// Shutter speed in microseconds used with RGB light.
    pub rgb_shutter_us: u32,
    /// White balance gains used with RGB light.
    pub rgb_gains: (f64, f64),
    /// Shutter speed in microseconds used with UV light.
    pub uv_shutter_us: u32,
    /// White balance gains used with UV light.
    pub uv_gains: (f64, f64),
}

/// Local result store locations.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Durable per-record store, one file per completed analysis.
    pub results_dir: String,
    /// Durable per-analyte image store.
    pub images_dir: String,
    /// Working area for the in-progress analysis, distinct from the durable
    /// store. Content moves into `results_dir` only on completion.
    pub work_dir: String,
}

/// Remote console endpoints and credentials.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleSettings {
    /// Base URL of the console, including scheme and port.
    pub base_url: String,
    /// Timeout in seconds for every console call. A timeout is treated as
    /// "no network", not as a fatal error.
    pub timeout_secs: f64,
    /// Bearer token used for authenticated endpoints.
    pub token: Option<String>,
    /// Reachability probe endpoint.
    pub hello_endpoint: String,
    /// Sample find/create endpoint.
    pub sample_endpoint: String,
    /// Measurement data endpoint.
    pub data_endpoint: String,
    /// Per-analyte image endpoint.
    pub image_endpoint: String,
}

/// Sync engine tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Upper bound on concurrently reconciling records. Sized to the remote
    /// server concurrency limits.
    pub max_concurrent: usize,
}

/// One spot position on the test strip.
#[derive(Debug, Deserialize, Clone)]
pub struct SpotSettings {
    /// Name shown to users and used as the key in result records.
    pub name: String,
    /// Label handed to the predictor for this spot.
    pub model: String,
    /// Inactive spots report 0.0 and are never predicted.
    pub active: bool,
}

impl Settings {
    /// Load settings from `config/<name>.toml`, falling back to built-in
    /// defaults for anything the file does not set. With `None` the file
    /// `config/default.toml` is used if present; without any file the
    /// defaults alone produce a valid configuration.
    pub fn new(config_name: Option<&str>) -> Result<Self, AnalyzerError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Self::builder_with_defaults()?
            .add_source(config::File::with_name(&config_path).required(false))
            .build()
            .map_err(AnalyzerError::Config)?;

        s.try_deserialize().map_err(AnalyzerError::Config)
    }

    fn builder_with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, AnalyzerError> {
        let builder = Config::builder()
            .set_default("log_level", "info")?
            .set_default("device_name", "analyzer-dev")?
            .set_default("capture.warmup_secs", 15.0)?
            .set_default("capture.light_settle_secs", 0.5)?
            .set_default("capture.late_threshold_secs", 0.5)?
            .set_default("capture.resolution", vec![640i64, 480])?
            .set_default("capture.rgb_shutter_us", 500)?
            .set_default("capture.rgb_gains", vec![1.0, 1.0])?
            .set_default("capture.uv_shutter_us", 5000)?
            .set_default("capture.uv_gains", vec![1.2, 1.2])?
            .set_default("storage.results_dir", "data/stored_results")?
            .set_default("storage.images_dir", "data/images")?
            .set_default("storage.work_dir", "data/work")?
            .set_default("console.base_url", "https://console.example.com:443")?
            .set_default("console.timeout_secs", 1.0)?
            .set_default("console.hello_endpoint", "/api/hello/")?
            .set_default("console.sample_endpoint", "/api/samples/")?
            .set_default("console.data_endpoint", "/api/spadata/")?
            .set_default("console.image_endpoint", "/api/spaimages/")?
            .set_default("sync.max_concurrent", 4)?
            .set_default(
                "spots",
                vec![
                    spot_default("N1", "nitrate", true),
                    spot_default("N2", "ammonium", false),
                    spot_default("P", "phosphate", true),
                    spot_default("K", "potassium", false),
                ],
            )?;
        Ok(builder)
    }
}

fn spot_default(name: &str, model: &str, active: bool) -> config::Value {
    let mut map = config::Map::new();
    map.insert("name".to_string(), config::Value::from(name));
    map.insert("model".to_string(), config::Value::from(model));
    map.insert("active".to_string(), config::Value::from(active));
    config::Value::from(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_produce_valid_settings() {
        let settings = Settings::new(Some("does_not_exist")).unwrap();
        assert_eq!(settings.capture.light_settle_secs, 0.5);
        assert_eq!(settings.capture.warmup_secs, 15.0);
        assert_eq!(settings.console.timeout_secs, 1.0);
        assert_eq!(settings.spots.len(), 4);
        assert!(settings.spots.iter().any(|s| s.name == "N1" && s.active));
    }

    #[test]
    fn test_inactive_spots_present() {
        let settings = Settings::new(None).unwrap();
        let n2 = settings
            .spots
            .iter()
            .find(|s| s.name == "N2")
            .expect("N2 spot");
        assert!(!n2.active);
    }
}
