//! HTTP client for the grower console.
//!
//! The console is a plain REST service: a reachability probe, a sample
//! find/create endpoint, a measurement endpoint and a per-analyte image
//! endpoint. Every call carries a short timeout sized for a field modem
//! link; a timeout or connection failure maps to
//! [`AnalyzerError::Unreachable`] so the engine can treat it as "offline"
//! rather than as a failure of the record being synced.
//!
//! The [`ConsoleApi`] trait is the seam the sync engine is written against;
//! tests substitute a scripted implementation.

use crate::config::ConsoleSettings;
use crate::error::{AnalyzerError, AppResult};
use crate::store::AnalysisResult;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// A sample as the console knows it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSample {
    /// Server-internal primary key, referenced by measurements.
    pub id: i64,
    /// User-facing sample identifier, unique per account.
    pub sample_id: String,
}

/// The key used to look a sample up, exactly one of the two.
#[derive(Debug, Clone)]
pub enum SampleKey {
    /// Find by scanned barcode.
    Barcode(String),
    /// Find by user-facing sample id.
    SampleId(String),
}

impl SampleKey {
    fn query(&self) -> (&'static str, &str) {
        match self {
            SampleKey::Barcode(b) => ("barcode", b),
            SampleKey::SampleId(s) => ("sample_id", s),
        }
    }
}

/// Failure modes of sample creation. The two conflict cases are ordinary
/// reconciliation outcomes, not errors, so they get their own type instead
/// of being folded into [`AnalyzerError`].
#[derive(Debug)]
pub enum CreateSampleError {
    /// A sample with this sample id already exists on the console.
    SampleIdExists,
    /// A sample with this barcode already exists on the console.
    BarcodeExists,
    /// Anything else, including unreachability.
    Other(AnalyzerError),
}

/// The console operations the sync engine needs.
#[async_trait]
pub trait ConsoleApi: Send + Sync {
    /// Cheap reachability probe. Never errors, an unreachable console is
    /// simply `false`.
    async fn hello(&self) -> bool;

    /// All samples matching the key. The caller decides what zero, one or
    /// many matches mean.
    async fn find_samples(&self, key: &SampleKey) -> AppResult<Vec<RemoteSample>>;

    /// Create a sample, optionally tagged with a barcode.
    async fn create_sample(
        &self,
        sample_id: &str,
        barcode: Option<&str>,
    ) -> Result<RemoteSample, CreateSampleError>;

    /// Attach a measurement to a sample. Returns the server-assigned
    /// measurement id.
    async fn create_measurement(
        &self,
        sample: &RemoteSample,
        record: &AnalysisResult,
        device_name: &str,
    ) -> AppResult<String>;

    /// Attach one analyte image to a measurement.
    async fn upload_image(&self, data_id: &str, analyte: &str, image: Vec<u8>) -> AppResult<()>;
}

/// [`ConsoleApi`] over HTTP with bearer authentication.
pub struct HttpConsoleClient {
    http: reqwest::Client,
    settings: ConsoleSettings,
}

impl HttpConsoleClient {
    /// Build a client with the configured per-request timeout.
    pub fn new(settings: ConsoleSettings) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.timeout_secs))
            .build()
            .map_err(|e| AnalyzerError::Remote(format!("could not build HTTP client: {e}")))?;
        Ok(Self { http, settings })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.settings.base_url, endpoint)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn transport_error(e: reqwest::Error) -> AnalyzerError {
    if e.is_timeout() || e.is_connect() {
        AnalyzerError::Unreachable(e.to_string())
    } else {
        AnalyzerError::Remote(e.to_string())
    }
}

#[async_trait]
impl ConsoleApi for HttpConsoleClient {
    async fn hello(&self) -> bool {
        let req = self.authorize(self.http.get(self.url(&self.settings.hello_endpoint)));
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn find_samples(&self, key: &SampleKey) -> AppResult<Vec<RemoteSample>> {
        let (field, value) = key.query();
        let req = self
            .authorize(self.http.get(self.url(&self.settings.sample_endpoint)))
            .query(&[(field, value)]);
        let resp = req.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(AnalyzerError::Remote(format!(
                "sample lookup failed with status {}",
                resp.status()
            )));
        }
        resp.json::<Vec<RemoteSample>>()
            .await
            .map_err(|e| AnalyzerError::Remote(format!("bad sample lookup response: {e}")))
    }

    async fn create_sample(
        &self,
        sample_id: &str,
        barcode: Option<&str>,
    ) -> Result<RemoteSample, CreateSampleError> {
        let mut body = json!({ "sample_id": sample_id });
        if let Some(barcode) = barcode {
            body["barcode"] = json!(barcode);
        }
        let req = self
            .authorize(self.http.post(self.url(&self.settings.sample_endpoint)))
            .json(&body);
        let resp = req
            .send()
            .await
            .map_err(|e| CreateSampleError::Other(transport_error(e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            let text = resp.text().await.unwrap_or_default();
            return Err(if text.contains("barcode") {
                CreateSampleError::BarcodeExists
            } else {
                CreateSampleError::SampleIdExists
            });
        }
        if !status.is_success() {
            return Err(CreateSampleError::Other(AnalyzerError::Remote(format!(
                "sample creation failed with status {status}"
            ))));
        }
        resp.json::<RemoteSample>().await.map_err(|e| {
            CreateSampleError::Other(AnalyzerError::Remote(format!(
                "bad sample creation response: {e}"
            )))
        })
    }

    async fn create_measurement(
        &self,
        sample: &RemoteSample,
        record: &AnalysisResult,
        device_name: &str,
    ) -> AppResult<String> {
        let mut body = serde_json::Map::new();
        body.insert("sample".to_string(), json!(sample.id));
        body.insert("device".to_string(), json!(device_name));
        body.insert("timestamp".to_string(), json!(record.local_id));
        for (analyte, value) in &record.values {
            body.insert(analyte.clone(), json!(value));
        }
        let req = self
            .authorize(self.http.post(self.url(&self.settings.data_endpoint)))
            .json(&body);
        let resp = req.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(AnalyzerError::Remote(format!(
                "measurement upload failed with status {}",
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct Created {
            id: i64,
        }
        let created: Created = resp
            .json()
            .await
            .map_err(|e| AnalyzerError::Remote(format!("bad measurement response: {e}")))?;
        Ok(created.id.to_string())
    }

    async fn upload_image(&self, data_id: &str, analyte: &str, image: Vec<u8>) -> AppResult<()> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name(format!("{analyte}.png"))
            .mime_str("image/png")
            .map_err(|e| AnalyzerError::Remote(format!("bad image part: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("data", data_id.to_string())
            .text("element", analyte.to_string())
            .part("image", part);
        let req = self
            .authorize(self.http.post(self.url(&self.settings.image_endpoint)))
            .multipart(form);
        let resp = req.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(AnalyzerError::Remote(format!(
                "image upload failed with status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_key_query_fields() {
        let by_barcode = SampleKey::Barcode("123456".to_string());
        assert_eq!(by_barcode.query(), ("barcode", "123456"));
        let by_id = SampleKey::SampleId("S-1".to_string());
        assert_eq!(by_id.query(), ("sample_id", "S-1"));
    }

    #[test]
    fn test_remote_sample_deserializes() {
        let sample: RemoteSample =
            serde_json::from_str(r#"{"id": 17, "sample_id": "S-1"}"#).unwrap();
        assert_eq!(sample.id, 17);
        assert_eq!(sample.sample_id, "S-1");
    }
}
