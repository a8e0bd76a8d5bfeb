//! The analysis result record and its on-disk codec.
//!
//! One record per completed analysis, stored as flat `key: value` text. The
//! analyte concentrations come first in deterministic (sorted) order, then a
//! fixed block of metadata keys. Serialization is deterministic so an
//! idempotent rewrite produces a byte-identical file.

use crate::error::{AnalyzerError, AppResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// Metadata keys, everything else in a record file is an analyte value.
const META_KEYS: [&str; 6] = [
    "barcode",
    "uploaded",
    "data_id",
    "sample_id",
    "account_name",
    "account_id",
];

/// The unit of the sync protocol: one completed analysis.
///
/// Created by the measurement pipeline with `uploaded = false` and no
/// `data_id`; mutated only by the sync engine, which may rewrite
/// `sample_id`, `data_id` and `uploaded` in place. Never deleted
/// automatically: this is the durable source of truth for whether a
/// measurement has been accounted for remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Local identifier, the capture unix timestamp in seconds.
    pub local_id: String,
    /// Analyte name to concentration.
    pub values: BTreeMap<String, f64>,
    /// Scanned barcode, if one was used for this run.
    pub barcode: Option<String>,
    /// Remote sample id, once known.
    pub sample_id: Option<String>,
    /// Account the run belongs to.
    pub account_id: String,
    /// Account display name, kept for user messaging while offline.
    pub account_name: String,
    /// True once the measurement has been attached remotely.
    pub uploaded: bool,
    /// Server-assigned measurement id, set together with `uploaded`.
    pub data_id: Option<String>,
}

impl AnalysisResult {
    /// Fresh, not-yet-uploaded record.
    pub fn new(
        local_id: String,
        values: BTreeMap<String, f64>,
        barcode: Option<String>,
        account_id: String,
        account_name: String,
    ) -> Self {
        Self {
            local_id,
            values,
            barcode,
            sample_id: None,
            account_id,
            account_name,
            uploaded: false,
            data_id: None,
        }
    }

    /// Render the record in its on-disk form.
    pub fn to_record_text(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.values {
            out.push_str(&format!("{name}: {value:.2}\n"));
        }
        out.push_str(&format!(
            "barcode: {}\n",
            self.barcode.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "uploaded: {}\n",
            if self.uploaded { "True" } else { "False" }
        ));
        out.push_str(&format!(
            "data_id: {}\n",
            self.data_id.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "sample_id: {}\n",
            self.sample_id.as_deref().unwrap_or("")
        ));
        out.push_str(&format!("account_name: {}\n", self.account_name));
        out.push_str(&format!("account_id: {}\n", self.account_id));
        out
    }

    /// Parse a record file body. The `local_id` comes from the file name,
    /// not the body.
    pub fn parse(local_id: &str, text: &str) -> AppResult<Self> {
        let mut values = BTreeMap::new();
        let mut meta: BTreeMap<&str, String> = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, raw) = line.split_once(':').ok_or_else(|| {
                AnalyzerError::Record(format!("record {local_id}: malformed line '{line}'"))
            })?;
            let key = key.trim();
            let value = raw.trim();
            if let Some(meta_key) = META_KEYS.iter().copied().find(|k| *k == key) {
                meta.insert(meta_key, value.to_string());
            } else {
                let parsed: f64 = value.parse().map_err(|_| {
                    AnalyzerError::Record(format!(
                        "record {local_id}: bad value for {key}: '{value}'"
                    ))
                })?;
                values.insert(key.to_string(), parsed);
            }
        }
        let take_opt = |meta: &BTreeMap<&str, String>, key: &str| -> Option<String> {
            meta.get(key).filter(|v| !v.is_empty()).cloned()
        };
        let uploaded = match meta.get("uploaded").map(String::as_str) {
            Some("True") | Some("true") => true,
            Some("False") | Some("false") | None => false,
            Some(other) => {
                return Err(AnalyzerError::Record(format!(
                    "record {local_id}: bad uploaded flag '{other}'"
                )))
            }
        };
        Ok(Self {
            local_id: local_id.to_string(),
            values,
            barcode: take_opt(&meta, "barcode"),
            sample_id: take_opt(&meta, "sample_id"),
            account_id: meta.get("account_id").cloned().unwrap_or_default(),
            account_name: meta.get("account_name").cloned().unwrap_or_default(),
            uploaded,
            data_id: take_opt(&meta, "data_id"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> AnalysisResult {
        let mut values = BTreeMap::new();
        values.insert("N1".to_string(), 42.5);
        values.insert("P".to_string(), -1.0);
        AnalysisResult::new(
            "1600000000".to_string(),
            values,
            Some("123456".to_string()),
            "3".to_string(),
            "TestFarm".to_string(),
        )
    }

    #[test]
    fn test_round_trip() {
        let record = sample_record();
        let text = record.to_record_text();
        let parsed = AnalysisResult::parse(&record.local_id, &text).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let record = sample_record();
        assert_eq!(record.to_record_text(), record.to_record_text());
    }

    #[test]
    fn test_empty_optionals_round_trip_as_none() {
        let mut record = sample_record();
        record.barcode = None;
        let parsed = AnalysisResult::parse(&record.local_id, &record.to_record_text()).unwrap();
        assert_eq!(parsed.barcode, None);
        assert_eq!(parsed.data_id, None);
    }

    #[test]
    fn test_uploaded_flag_formats() {
        let mut record = sample_record();
        record.uploaded = true;
        record.data_id = Some("d-1".to_string());
        let parsed = AnalysisResult::parse(&record.local_id, &record.to_record_text()).unwrap();
        assert!(parsed.uploaded);
        assert_eq!(parsed.data_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(AnalysisResult::parse("1", "no separator here").is_err());
    }

    #[test]
    fn test_bad_float_is_an_error() {
        assert!(AnalysisResult::parse("1", "N1: not-a-number\n").is_err());
    }
}
