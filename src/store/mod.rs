//! Durable local result store.
//!
//! One text file per completed analysis under the results directory, named
//! `<local_id>.results.txt`, plus one PNG per analyte under the images
//! directory. Every mutation goes through [`StagedWrite`]: a temp file in
//! the same directory made visible by an atomic rename, so a crash mid-write
//! never leaves a half-written record where a reader can see it.
//!
//! The store re-reads the directory on every listing instead of caching.
//! Records are few (one per physical test strip) and the durable files are
//! the single source of truth for the sync engine.

pub mod record;

pub use record::AnalysisResult;

use crate::config::StorageSettings;
use crate::error::{AnalyzerError, AppResult};
use log::warn;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const RECORD_SUFFIX: &str = ".results.txt";

/// A write staged next to its target and committed with an atomic rename.
///
/// The temp file lives in the target's directory so the rename never
/// crosses a filesystem boundary. Dropping an uncommitted write removes
/// the temp file.
pub struct StagedWrite {
    tmp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    /// Write `contents` to a temp file next to `target` and flush it to disk.
    pub fn new(target: PathBuf, contents: &[u8]) -> AppResult<Self> {
        let file_name = target
            .file_name()
            .ok_or_else(|| {
                AnalyzerError::Record(format!("invalid record path: {}", target.display()))
            })?
            .to_string_lossy()
            .into_owned();
        let tmp = target.with_file_name(format!(".{file_name}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(Self {
            tmp,
            target,
            committed: false,
        })
    }

    /// Atomically replace the target with the staged contents.
    pub fn commit(mut self) -> AppResult<()> {
        fs::rename(&self.tmp, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.tmp) {
                warn!("could not remove staged file {}: {e}", self.tmp.display());
            }
        }
    }
}

/// The on-disk result store.
pub struct ResultStore {
    results_dir: PathBuf,
    images_dir: PathBuf,
    work_dir: PathBuf,
}

impl ResultStore {
    /// Open the store, creating its directories if needed.
    pub fn new(settings: &StorageSettings) -> AppResult<Self> {
        let store = Self {
            results_dir: PathBuf::from(&settings.results_dir),
            images_dir: PathBuf::from(&settings.images_dir),
            work_dir: PathBuf::from(&settings.work_dir),
        };
        fs::create_dir_all(&store.results_dir)?;
        fs::create_dir_all(&store.images_dir)?;
        fs::create_dir_all(&store.work_dir)?;
        Ok(store)
    }

    /// Working area for the in-progress analysis. Nothing here is visible
    /// to listings until the run completes.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn record_path(&self, local_id: &str) -> PathBuf {
        self.results_dir.join(format!("{local_id}{RECORD_SUFFIX}"))
    }

    /// Durable path of one analyte image.
    pub fn image_path(&self, local_id: &str, analyte: &str) -> PathBuf {
        self.images_dir.join(format!("{local_id}.{analyte}.png"))
    }

    /// Persist a record. The record only becomes visible atomically.
    pub fn persist(&self, result: &AnalysisResult) -> AppResult<()> {
        let staged = StagedWrite::new(
            self.record_path(&result.local_id),
            result.to_record_text().as_bytes(),
        )?;
        staged.commit()
    }

    /// Load one record by its local id.
    pub fn load(&self, local_id: &str) -> AppResult<AnalysisResult> {
        let path = self.record_path(local_id);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AnalyzerError::Record(format!("no stored result for id {local_id}"))
            } else {
                AnalyzerError::Io(e)
            }
        })?;
        AnalysisResult::parse(local_id, &text)
    }

    /// All stored records, ascending by local id, optionally filtered to one
    /// account. Unparsable files are logged and skipped so one corrupt
    /// record cannot hide the rest.
    pub fn list(&self, account_id: Option<&str>) -> AppResult<Vec<AnalysisResult>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.results_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(local_id) = name.strip_suffix(RECORD_SUFFIX) {
                if !local_id.starts_with('.') {
                    ids.push(local_id.to_string());
                }
            }
        }
        ids.sort();
        let mut records = Vec::with_capacity(ids.len());
        for local_id in ids {
            match self.load(&local_id) {
                Ok(record) => {
                    if account_id.map_or(true, |a| record.account_id == a) {
                        records.push(record);
                    }
                }
                Err(e) => warn!("skipping unreadable record {local_id}: {e}"),
            }
        }
        Ok(records)
    }

    /// Record a successful remote attach: sets the sample id, data id and
    /// uploaded flag in place. Idempotent, re-marking with the same ids
    /// rewrites the file byte-identically.
    pub fn mark_uploaded(
        &self,
        local_id: &str,
        sample_id: &str,
        data_id: &str,
    ) -> AppResult<AnalysisResult> {
        let mut record = self.load(local_id)?;
        record.sample_id = Some(sample_id.to_string());
        record.data_id = Some(data_id.to_string());
        record.uploaded = true;
        self.persist(&record)?;
        Ok(record)
    }

    /// Whether any record for the account still awaits upload. Stops at the
    /// first pending record instead of reading everything.
    pub fn has_pending(&self, account_id: Option<&str>) -> AppResult<bool> {
        for entry in fs::read_dir(&self.results_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(local_id) = name.strip_suffix(RECORD_SUFFIX) else {
                continue;
            };
            if local_id.starts_with('.') {
                continue;
            }
            match self.load(local_id) {
                Ok(record) => {
                    if !record.uploaded && account_id.map_or(true, |a| record.account_id == a) {
                        return Ok(true);
                    }
                }
                Err(e) => warn!("skipping unreadable record {local_id}: {e}"),
            }
        }
        Ok(false)
    }

    /// Move the per-analyte working images into the durable image store.
    ///
    /// Best effort: a missing or unmovable image is logged and skipped, it
    /// never fails the run whose numeric results are already persisted.
    pub fn store_images(&self, local_id: &str, analytes: &[String]) {
        for analyte in analytes {
            let src = self.work_dir.join(analyte).join("sample.png");
            if !src.exists() {
                continue;
            }
            let dst = self.image_path(local_id, analyte);
            if let Err(e) = fs::rename(&src, &dst) {
                warn!(
                    "could not store image {} for record {local_id}: {e}",
                    src.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_store(dir: &Path) -> ResultStore {
        ResultStore::new(&StorageSettings {
            results_dir: dir.join("results").to_string_lossy().into_owned(),
            images_dir: dir.join("images").to_string_lossy().into_owned(),
            work_dir: dir.join("work").to_string_lossy().into_owned(),
        })
        .unwrap()
    }

    fn test_record(local_id: &str, account_id: &str) -> AnalysisResult {
        let mut values = BTreeMap::new();
        values.insert("N1".to_string(), 12.0);
        values.insert("P".to_string(), 3.5);
        AnalysisResult::new(
            local_id.to_string(),
            values,
            Some("123456".to_string()),
            account_id.to_string(),
            "TestFarm".to_string(),
        )
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let record = test_record("1600000000", "3");
        store.persist(&record).unwrap();
        assert_eq!(store.load("1600000000").unwrap(), record);
    }

    #[test]
    fn test_load_missing_is_record_error() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        assert!(matches!(
            store.load("1600000000"),
            Err(AnalyzerError::Record(_))
        ));
    }

    #[test]
    fn test_list_is_ascending_and_filters_by_account() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        store.persist(&test_record("1600000002", "3")).unwrap();
        store.persist(&test_record("1600000001", "3")).unwrap();
        store.persist(&test_record("1600000003", "4")).unwrap();

        let all = store.list(None).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.local_id.as_str()).collect();
        assert_eq!(ids, ["1600000001", "1600000002", "1600000003"]);

        let mine = store.list(Some("3")).unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[test]
    fn test_list_skips_unparsable_records() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        store.persist(&test_record("1600000001", "3")).unwrap();
        fs::write(
            store.results_dir.join("1600000002.results.txt"),
            "not a record",
        )
        .unwrap();
        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_mark_uploaded_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        store.persist(&test_record("1600000001", "3")).unwrap();

        let updated = store.mark_uploaded("1600000001", "s-9", "d-7").unwrap();
        assert!(updated.uploaded);
        let first = fs::read(store.record_path("1600000001")).unwrap();
        store.mark_uploaded("1600000001", "s-9", "d-7").unwrap();
        let second = fs::read(store.record_path("1600000001")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_has_pending_reflects_upload_state() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        assert!(!store.has_pending(None).unwrap());
        store.persist(&test_record("1600000001", "3")).unwrap();
        assert!(store.has_pending(Some("3")).unwrap());
        assert!(!store.has_pending(Some("4")).unwrap());
        store.mark_uploaded("1600000001", "s-1", "d-1").unwrap();
        assert!(!store.has_pending(Some("3")).unwrap());
    }

    #[test]
    fn test_dropped_staged_write_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let target = store.record_path("1600000001");
        let staged = StagedWrite::new(target.clone(), b"partial").unwrap();
        drop(staged);
        assert!(!target.exists());
        assert_eq!(fs::read_dir(&store.results_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_staged_files_are_invisible_to_listings() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let record = test_record("1600000001", "3");
        let _staged = StagedWrite::new(
            store.record_path(&record.local_id),
            record.to_record_text().as_bytes(),
        )
        .unwrap();
        assert!(store.list(None).unwrap().is_empty());
        assert!(!store.has_pending(None).unwrap());
    }

    #[test]
    fn test_store_images_moves_work_files() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let spot_dir = store.work_dir().join("N1");
        fs::create_dir_all(&spot_dir).unwrap();
        fs::write(spot_dir.join("sample.png"), b"png").unwrap();

        store.store_images("1600000001", &["N1".to_string(), "P".to_string()]);
        assert!(store.image_path("1600000001", "N1").exists());
        assert!(!spot_dir.join("sample.png").exists());
        assert!(!store.image_path("1600000001", "P").exists());
    }
}
