//! The analysis pipeline: frames in, concentrations out.
//!
//! A run drives the capture scheduler under one illumination, hands the
//! averaged frame to an [`IntensityExtractor`] per spot and the extracted
//! intensity to a [`Predictor`], and persists the resulting record. Both
//! seams are traits: the production implementations wrap the image math and
//! the calibration models, tests substitute scripted ones.
//!
//! A failing spot does not stop the run. Every spot is processed, failed
//! spots keep their "no result" default, the record is persisted either
//! way, and the first spot error is reported after the whole run finished.
//! A half-analyzed strip is still worth storing; re-running the strip is
//! physically impossible once the reagents have reacted.

use crate::capture::{run_averaged, CaptureSchedule, Coordinator, ScheduleOptions, TimedFrame};
use crate::config::SpotSettings;
use crate::error::{AnalyzerError, AppResult};
use crate::hardware::Rgb;
use crate::store::{AnalysisResult, ResultStore};
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Value stored for an active spot that produced no result.
pub const NO_RESULT: f64 = -1.0;
/// Value stored for a spot that is configured inactive.
pub const INACTIVE: f64 = 0.0;

/// One spot position on the strip, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SpotConfig {
    /// Analyte name, used as the key in result records.
    pub name: String,
    /// Calibration model label handed to the predictor.
    pub model: String,
    /// Inactive spots are never extracted or predicted.
    pub active: bool,
}

impl From<&SpotSettings> for SpotConfig {
    fn from(s: &SpotSettings) -> Self {
        Self {
            name: s.name.clone(),
            model: s.model.clone(),
            active: s.active,
        }
    }
}

/// Light under which the strip is captured.
#[derive(Debug, Clone, Copy, Default)]
pub enum Illumination {
    /// White RGB light, the standard colorimetric mode.
    #[default]
    White,
    /// UV excitation at the given level, for fluorescent assays.
    Uv(u32),
}

/// Extracts one spot's intensity from the averaged frame.
///
/// Implementations write the cropped spot image to
/// `<work_dir>/<spot>/sample.png` as a side effect; the store moves it into
/// the durable image store after the record is persisted.
#[async_trait]
pub trait IntensityExtractor: Send + Sync {
    /// Intensity of `spot` in the averaged frame.
    async fn extract(
        &self,
        frame: &TimedFrame,
        spot: &SpotConfig,
        work_dir: &Path,
    ) -> AppResult<f64>;
}

/// Maps an extracted intensity to a concentration using a calibration model.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Concentration for `intensity` under the named model.
    async fn predict(&self, model: &str, intensity: f64) -> AppResult<f64>;
}

/// The result values before any spot has been analyzed: "no result" for
/// active spots, the inactive marker for the rest.
pub fn default_results(spots: &[SpotConfig]) -> BTreeMap<String, f64> {
    spots
        .iter()
        .map(|s| {
            (
                s.name.clone(),
                if s.active { NO_RESULT } else { INACTIVE },
            )
        })
        .collect()
}

/// Per-run parameters.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Scanned barcode, if any.
    pub barcode: Option<String>,
    /// Account the run belongs to.
    pub account_id: String,
    /// Account display name.
    pub account_name: String,
    /// Capture offsets for the averaged exposure.
    pub schedule: CaptureSchedule,
    /// Illumination mode for the whole run.
    pub illumination: Illumination,
}

/// Owns the analysis seams and the store; borrows the coordinator per run.
pub struct AnalysisRunner {
    store: Arc<ResultStore>,
    extractor: Box<dyn IntensityExtractor>,
    predictor: Box<dyn Predictor>,
    spots: Vec<SpotConfig>,
}

impl AnalysisRunner {
    /// Assemble a runner over the store, the two analysis seams and the
    /// configured spot table.
    pub fn new(
        store: Arc<ResultStore>,
        extractor: Box<dyn IntensityExtractor>,
        predictor: Box<dyn Predictor>,
        spots: Vec<SpotConfig>,
    ) -> Self {
        Self {
            store,
            extractor,
            predictor,
            spots,
        }
    }

    /// Run one full analysis: capture, extract, predict, persist.
    ///
    /// The record is persisted (uploaded = false) even when spots fail; in
    /// that case the first spot error is returned after all spots were
    /// processed, and the stored record carries [`NO_RESULT`] for the
    /// failed spots. The light is off by the time this returns, on every
    /// path.
    pub async fn run(
        &self,
        coordinator: &mut Coordinator,
        request: &RunRequest,
        abort: &mut watch::Receiver<bool>,
    ) -> AppResult<AnalysisResult> {
        if request.schedule.is_empty() {
            return Err(AnalyzerError::Configuration(
                "capture schedule is empty".to_string(),
            ));
        }
        let local_id = Utc::now().timestamp().to_string();
        info!("analysis run {local_id} started");

        match request.illumination {
            Illumination::White => {
                coordinator.setup_rgb().await?;
                coordinator.set_light(Rgb::WHITE, 0).await?;
            }
            Illumination::Uv(level) => {
                coordinator.setup_uv().await?;
                coordinator.set_light(Rgb::OFF, level).await?;
            }
        }

        // run_averaged switches the light off itself on error and abort.
        let frame = run_averaged(
            coordinator,
            &request.schedule,
            ScheduleOptions {
                wait_first: true,
                start: None,
            },
            abort,
        )
        .await?
        .ok_or_else(|| AnalyzerError::Configuration("capture produced no frame".to_string()))?;
        coordinator.light_off().await?;

        let mut values = default_results(&self.spots);
        let mut first_error = None;
        let mut analyzed = Vec::new();
        for spot in self.spots.iter().filter(|s| s.active) {
            match self.analyze_spot(&frame, spot).await {
                Ok(value) => {
                    values.insert(spot.name.clone(), value);
                    analyzed.push(spot.name.clone());
                }
                Err(e) => {
                    warn!("run {local_id}: spot {} failed: {e}", spot.name);
                    // Extraction may still have written a usable image.
                    analyzed.push(spot.name.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        let record = AnalysisResult::new(
            local_id.clone(),
            values,
            request.barcode.clone(),
            request.account_id.clone(),
            request.account_name.clone(),
        );
        self.store.persist(&record)?;
        self.store.store_images(&local_id, &analyzed);
        info!("analysis run {local_id} stored");

        match first_error {
            Some(e) => Err(e),
            None => Ok(record),
        }
    }

    async fn analyze_spot(&self, frame: &TimedFrame, spot: &SpotConfig) -> AppResult<f64> {
        let intensity = self
            .extractor
            .extract(frame, spot, self.store.work_dir())
            .await?;
        self.predictor.predict(&spot.model, intensity).await
    }
}
