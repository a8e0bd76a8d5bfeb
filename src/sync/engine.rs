//! Find-before-create reconciliation of local records with the console.
//!
//! A record is reconciled by first locating (or creating) its remote sample,
//! then attaching the measurement, then marking the local record uploaded.
//! The order matters: the local `uploaded` flag only flips after the
//! measurement is accepted, so a crash or lost connection at any point
//! leaves the record pending and safe to retry. Image uploads come last and
//! are best effort, a missing image never blocks the numeric data.
//!
//! Every way a reconciliation can finish without an error is a
//! [`SyncOutcome`], including the "nothing matched" and conflict results.
//! Errors are reserved for states needing operator attention, like a
//! lookup key matching more than one remote sample.

use crate::error::{AnalyzerError, AppResult};
use crate::store::{AnalysisResult, ResultStore};
use crate::sync::client::{ConsoleApi, CreateSampleError, RemoteSample, SampleKey};
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

/// How one reconciliation finished. Closed set, exhaustively matched by
/// user-facing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Lookup by barcode matched nothing; the record stays pending.
    NoSampleForBarcode,
    /// Lookup by sample id matched nothing; the record stays pending.
    NoSampleForId,
    /// Attached to the sample its barcode matched.
    AttachedByBarcode,
    /// Attached to the sample its id matched.
    AttachedById,
    /// A new sample was created carrying the barcode, and attached.
    CreatedWithBarcode,
    /// A new sample was created without a barcode, and attached.
    Created,
    /// The caller asked to keep the record local; nothing was sent.
    StoredLocally,
    /// Creation refused: the sample id is already taken remotely.
    SampleIdConflict,
    /// Creation refused: the barcode is already taken remotely.
    BarcodeConflict,
    /// The console is unreachable; the record stays pending, untouched.
    NoNetwork,
    /// The record was already uploaded; nothing was sent.
    AlreadySynced,
}

impl SyncOutcome {
    /// Legacy numeric case id used by the console protocol, where one
    /// exists.
    pub fn case_id(&self) -> Option<u8> {
        match self {
            SyncOutcome::NoSampleForBarcode => Some(1),
            SyncOutcome::NoSampleForId => Some(2),
            SyncOutcome::AttachedByBarcode => Some(3),
            SyncOutcome::AttachedById => Some(4),
            SyncOutcome::CreatedWithBarcode => Some(5),
            SyncOutcome::Created => Some(6),
            SyncOutcome::StoredLocally => Some(7),
            SyncOutcome::SampleIdConflict => Some(8),
            SyncOutcome::BarcodeConflict => Some(9),
            SyncOutcome::NoNetwork | SyncOutcome::AlreadySynced => None,
        }
    }

    /// Whether the measurement is now attached remotely.
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            SyncOutcome::AttachedByBarcode
                | SyncOutcome::AttachedById
                | SyncOutcome::CreatedWithBarcode
                | SyncOutcome::Created
                | SyncOutcome::AlreadySynced
        )
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            SyncOutcome::NoSampleForBarcode => "no sample with this barcode exists",
            SyncOutcome::NoSampleForId => "no sample with this id exists",
            SyncOutcome::AttachedByBarcode => "attached to the sample matching the barcode",
            SyncOutcome::AttachedById => "attached to the sample matching the id",
            SyncOutcome::CreatedWithBarcode => "created a new sample with the barcode",
            SyncOutcome::Created => "created a new sample",
            SyncOutcome::StoredLocally => "stored locally only",
            SyncOutcome::SampleIdConflict => "a sample with this id already exists",
            SyncOutcome::BarcodeConflict => "a sample with this barcode already exists",
            SyncOutcome::NoNetwork => "console unreachable, result kept for later upload",
            SyncOutcome::AlreadySynced => "already uploaded",
        };
        f.write_str(msg)
    }
}

/// Caller intent for one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Create a new remote sample instead of looking one up.
    pub new_sample: bool,
    /// Explicit sample id to look up, or to give a new sample.
    pub sample_id: Option<String>,
    /// Keep the record local, skip the console entirely.
    pub store_local: bool,
}

/// The reconciliation engine.
///
/// Cheap to share behind an [`Arc`]; all interior state is the single-flight
/// set and the concurrency permits.
pub struct SyncEngine {
    store: Arc<ResultStore>,
    client: Arc<dyn ConsoleApi>,
    device_name: String,
    in_flight: Mutex<HashSet<String>>,
    permits: Semaphore,
}

/// Removes its record id from the single-flight set on drop, so the slot is
/// released on every exit path including errors.
struct FlightGuard<'a> {
    engine: &'a SyncEngine,
    local_id: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.in_flight_set().remove(&self.local_id);
    }
}

impl SyncEngine {
    /// Build an engine over a store and console client.
    pub fn new(
        store: Arc<ResultStore>,
        client: Arc<dyn ConsoleApi>,
        device_name: String,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            client,
            device_name,
            in_flight: Mutex::new(HashSet::new()),
            permits: Semaphore::new(max_concurrent),
        }
    }

    fn in_flight_set(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reconcile one record with the console.
    ///
    /// At most one reconciliation per record may be in flight; a second
    /// concurrent attempt gets [`AnalyzerError::Busy`]. Across distinct
    /// records, concurrency is bounded by the configured permit count.
    pub async fn reconcile(
        &self,
        local_id: &str,
        opts: &ReconcileOptions,
    ) -> AppResult<SyncOutcome> {
        let _guard = {
            let mut set = self.in_flight_set();
            if !set.insert(local_id.to_string()) {
                return Err(AnalyzerError::Busy(local_id.to_string()));
            }
            FlightGuard {
                engine: self,
                local_id: local_id.to_string(),
            }
        };
        let _permit = self.permits.acquire().await.map_err(|_| {
            AnalyzerError::Record("sync engine is shutting down".to_string())
        })?;

        match self.reconcile_inner(local_id, opts).await {
            // Losing the console mid-flight is the same as never reaching
            // it: the record is still pending, report offline.
            Err(AnalyzerError::Unreachable(e)) => {
                info!("record {local_id}: console unreachable ({e})");
                Ok(SyncOutcome::NoNetwork)
            }
            other => other,
        }
    }

    async fn reconcile_inner(
        &self,
        local_id: &str,
        opts: &ReconcileOptions,
    ) -> AppResult<SyncOutcome> {
        let record = self.store.load(local_id)?;
        if record.uploaded {
            return Ok(SyncOutcome::AlreadySynced);
        }
        if opts.store_local {
            info!("record {local_id}: stored locally on request");
            return Ok(SyncOutcome::StoredLocally);
        }
        if !self.client.hello().await {
            info!("record {local_id}: console unreachable, keeping pending");
            return Ok(SyncOutcome::NoNetwork);
        }

        if opts.new_sample {
            return self.create_and_attach(&record, opts).await;
        }
        self.find_and_attach(&record, opts).await
    }

    /// Create a fresh remote sample and attach the measurement to it. When
    /// no explicit sample id is given the barcode doubles as the id.
    async fn create_and_attach(
        &self,
        record: &AnalysisResult,
        opts: &ReconcileOptions,
    ) -> AppResult<SyncOutcome> {
        let sample_id = opts
            .sample_id
            .as_deref()
            .or(record.barcode.as_deref())
            .ok_or_else(|| {
                AnalyzerError::Record(format!(
                    "record {}: a new sample needs a sample id or a barcode",
                    record.local_id
                ))
            })?;
        let sample = match self
            .client
            .create_sample(sample_id, record.barcode.as_deref())
            .await
        {
            Ok(sample) => sample,
            Err(CreateSampleError::SampleIdExists) => {
                warn!("record {}: sample id {sample_id} taken", record.local_id);
                return Ok(SyncOutcome::SampleIdConflict);
            }
            Err(CreateSampleError::BarcodeExists) => {
                warn!("record {}: barcode already registered", record.local_id);
                return Ok(SyncOutcome::BarcodeConflict);
            }
            Err(CreateSampleError::Other(e)) => return Err(e),
        };
        self.attach(record, &sample).await?;
        Ok(if record.barcode.is_some() {
            SyncOutcome::CreatedWithBarcode
        } else {
            SyncOutcome::Created
        })
    }

    /// Locate the remote sample by explicit id, recorded id or barcode, and
    /// attach to it if exactly one matches.
    async fn find_and_attach(
        &self,
        record: &AnalysisResult,
        opts: &ReconcileOptions,
    ) -> AppResult<SyncOutcome> {
        let explicit_id = opts.sample_id.as_deref().or(record.sample_id.as_deref());
        let (key, not_found, attached) = match (explicit_id, record.barcode.as_deref()) {
            (Some(id), _) => (
                SampleKey::SampleId(id.to_string()),
                SyncOutcome::NoSampleForId,
                SyncOutcome::AttachedById,
            ),
            (None, Some(barcode)) => (
                SampleKey::Barcode(barcode.to_string()),
                SyncOutcome::NoSampleForBarcode,
                SyncOutcome::AttachedByBarcode,
            ),
            (None, None) => {
                return Err(AnalyzerError::Record(format!(
                    "record {}: nothing to look the sample up by",
                    record.local_id
                )))
            }
        };

        let matches = self.client.find_samples(&key).await?;
        match matches.len() {
            0 => Ok(not_found),
            1 => {
                self.attach(record, &matches[0]).await?;
                Ok(attached)
            }
            n => Err(AnalyzerError::DataIntegrity(format!(
                "record {}: {n} remote samples matched {key:?}",
                record.local_id
            ))),
        }
    }

    /// Upload the measurement, flip the local record to uploaded, then push
    /// the analyte images best-effort.
    async fn attach(&self, record: &AnalysisResult, sample: &RemoteSample) -> AppResult<()> {
        let data_id = self
            .client
            .create_measurement(sample, record, &self.device_name)
            .await?;
        self.store
            .mark_uploaded(&record.local_id, &sample.sample_id, &data_id)?;
        info!(
            "record {} attached to sample {} as measurement {data_id}",
            record.local_id, sample.sample_id
        );

        for analyte in record.values.keys() {
            let path = self.store.image_path(&record.local_id, analyte);
            let image = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if let Err(e) = self.client.upload_image(&data_id, analyte, image).await {
                warn!(
                    "record {}: image upload for {analyte} failed: {e}",
                    record.local_id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted console: reachability flag, canned lookup results, canned
    /// creation result, and call counters.
    struct ScriptedConsole {
        reachable: bool,
        lookup: Vec<RemoteSample>,
        create: Option<Result<RemoteSample, &'static str>>,
        measurement_fails: bool,
        image_fails: bool,
        lookups: AtomicUsize,
        measurements: AtomicUsize,
        images: AtomicUsize,
    }

    impl ScriptedConsole {
        fn reachable() -> Self {
            Self {
                reachable: true,
                lookup: Vec::new(),
                create: None,
                measurement_fails: false,
                image_fails: false,
                lookups: AtomicUsize::new(0),
                measurements: AtomicUsize::new(0),
                images: AtomicUsize::new(0),
            }
        }

        fn offline() -> Self {
            Self {
                reachable: false,
                ..Self::reachable()
            }
        }

        fn finding(samples: Vec<RemoteSample>) -> Self {
            Self {
                lookup: samples,
                ..Self::reachable()
            }
        }
    }

    #[async_trait]
    impl ConsoleApi for ScriptedConsole {
        async fn hello(&self) -> bool {
            self.reachable
        }

        async fn find_samples(&self, _key: &SampleKey) -> AppResult<Vec<RemoteSample>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.lookup.clone())
        }

        async fn create_sample(
            &self,
            sample_id: &str,
            _barcode: Option<&str>,
        ) -> Result<RemoteSample, CreateSampleError> {
            match &self.create {
                Some(Ok(sample)) => Ok(sample.clone()),
                Some(Err("sample_id")) => Err(CreateSampleError::SampleIdExists),
                Some(Err(_)) => Err(CreateSampleError::BarcodeExists),
                None => Ok(RemoteSample {
                    id: 1,
                    sample_id: sample_id.to_string(),
                }),
            }
        }

        async fn create_measurement(
            &self,
            _sample: &RemoteSample,
            _record: &AnalysisResult,
            _device_name: &str,
        ) -> AppResult<String> {
            self.measurements.fetch_add(1, Ordering::SeqCst);
            if self.measurement_fails {
                return Err(AnalyzerError::Remote("measurement refused".to_string()));
            }
            Ok("42".to_string())
        }

        async fn upload_image(
            &self,
            _data_id: &str,
            _analyte: &str,
            _image: Vec<u8>,
        ) -> AppResult<()> {
            self.images.fetch_add(1, Ordering::SeqCst);
            if self.image_fails {
                return Err(AnalyzerError::Remote("image refused".to_string()));
            }
            Ok(())
        }
    }

    fn test_store(dir: &TempDir) -> Arc<ResultStore> {
        Arc::new(
            ResultStore::new(&StorageSettings {
                results_dir: dir.path().join("results").to_string_lossy().into_owned(),
                images_dir: dir.path().join("images").to_string_lossy().into_owned(),
                work_dir: dir.path().join("work").to_string_lossy().into_owned(),
            })
            .unwrap(),
        )
    }

    fn pending_record(local_id: &str, barcode: Option<&str>) -> AnalysisResult {
        let mut values = BTreeMap::new();
        values.insert("N1".to_string(), 12.0);
        values.insert("P".to_string(), 3.5);
        AnalysisResult::new(
            local_id.to_string(),
            values,
            barcode.map(str::to_string),
            "3".to_string(),
            "TestFarm".to_string(),
        )
    }

    fn engine(store: Arc<ResultStore>, console: ScriptedConsole) -> SyncEngine {
        SyncEngine::new(store, Arc::new(console), "analyzer-test".to_string(), 4)
    }

    #[tokio::test]
    async fn test_offline_keeps_record_untouched() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let engine = engine(store.clone(), ScriptedConsole::offline());

        let outcome = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::NoNetwork);
        let record = store.load("100").unwrap();
        assert!(!record.uploaded);
        assert_eq!(record.data_id, None);
    }

    #[tokio::test]
    async fn test_barcode_match_attaches() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let console = ScriptedConsole::finding(vec![RemoteSample {
            id: 7,
            sample_id: "S-7".to_string(),
        }]);
        let engine = engine(store.clone(), console);

        let outcome = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::AttachedByBarcode);
        let record = store.load("100").unwrap();
        assert!(record.uploaded);
        assert_eq!(record.sample_id.as_deref(), Some("S-7"));
        assert_eq!(record.data_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_no_match_leaves_record_pending() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let engine = engine(store.clone(), ScriptedConsole::finding(vec![]));

        let outcome = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::NoSampleForBarcode);
        assert!(!store.load("100").unwrap().uploaded);
    }

    #[tokio::test]
    async fn test_explicit_id_lookup_miss() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let engine = engine(store.clone(), ScriptedConsole::finding(vec![]));

        let opts = ReconcileOptions {
            sample_id: Some("S-1".to_string()),
            ..Default::default()
        };
        let outcome = engine.reconcile("100", &opts).await.unwrap();
        assert_eq!(outcome, SyncOutcome::NoSampleForId);
    }

    #[tokio::test]
    async fn test_multiple_matches_is_data_integrity_error() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let before = store.load("100").unwrap();
        let twin = |id| RemoteSample {
            id,
            sample_id: format!("S-{id}"),
        };
        let engine = engine(store.clone(), ScriptedConsole::finding(vec![twin(1), twin(2)]));

        let err = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::DataIntegrity(_)));
        assert_eq!(store.load("100").unwrap(), before);
    }

    #[tokio::test]
    async fn test_new_sample_uses_barcode_as_id() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let engine = engine(store.clone(), ScriptedConsole::reachable());

        let opts = ReconcileOptions {
            new_sample: true,
            ..Default::default()
        };
        let outcome = engine.reconcile("100", &opts).await.unwrap();
        assert_eq!(outcome, SyncOutcome::CreatedWithBarcode);
        let record = store.load("100").unwrap();
        assert_eq!(record.sample_id.as_deref(), Some("123"));
        assert!(record.uploaded);
    }

    #[tokio::test]
    async fn test_new_sample_conflicts_leave_record_pending() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let console = ScriptedConsole {
            create: Some(Err("sample_id")),
            ..ScriptedConsole::reachable()
        };
        let engine = engine(store.clone(), console);

        let opts = ReconcileOptions {
            new_sample: true,
            sample_id: Some("S-1".to_string()),
            ..Default::default()
        };
        let outcome = engine.reconcile("100", &opts).await.unwrap();
        assert_eq!(outcome, SyncOutcome::SampleIdConflict);
        assert!(!store.load("100").unwrap().uploaded);
    }

    #[tokio::test]
    async fn test_store_local_skips_console() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", None)).unwrap();
        let console = ScriptedConsole::offline();
        let engine = engine(store.clone(), console);

        let opts = ReconcileOptions {
            store_local: true,
            ..Default::default()
        };
        let outcome = engine.reconcile("100", &opts).await.unwrap();
        assert_eq!(outcome, SyncOutcome::StoredLocally);
        assert!(!store.load("100").unwrap().uploaded);
    }

    #[tokio::test]
    async fn test_measurement_failure_keeps_record_pending() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let console = ScriptedConsole {
            measurement_fails: true,
            ..ScriptedConsole::finding(vec![RemoteSample {
                id: 7,
                sample_id: "S-7".to_string(),
            }])
        };
        let engine = engine(store.clone(), console);

        assert!(engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .is_err());
        assert!(!store.load("100").unwrap().uploaded);
    }

    #[tokio::test]
    async fn test_image_failure_does_not_undo_reconciliation() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        fs::write(store.image_path("100", "N1"), b"png").unwrap();
        let console = ScriptedConsole {
            image_fails: true,
            ..ScriptedConsole::finding(vec![RemoteSample {
                id: 7,
                sample_id: "S-7".to_string(),
            }])
        };
        let engine = engine(store.clone(), console);

        let outcome = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_synced());
        assert!(store.load("100").unwrap().uploaded);
    }

    #[tokio::test]
    async fn test_already_uploaded_short_circuits() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        store.mark_uploaded("100", "S-7", "42").unwrap();
        let console = ScriptedConsole::offline();
        let engine = engine(store.clone(), console);

        let outcome = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::AlreadySynced);
    }

    #[tokio::test]
    async fn test_second_attempt_for_same_record_is_busy() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.persist(&pending_record("100", Some("123"))).unwrap();
        let engine = Arc::new(engine(store, ScriptedConsole::reachable()));

        // Hold the single-flight slot directly, then try to reconcile.
        engine.in_flight_set().insert("100".to_string());
        let err = engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Busy(_)));
        engine.in_flight_set().remove("100");

        // The slot is free again afterwards.
        assert!(engine
            .reconcile("100", &ReconcileOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_case_ids_cover_legacy_protocol() {
        assert_eq!(SyncOutcome::NoSampleForBarcode.case_id(), Some(1));
        assert_eq!(SyncOutcome::BarcodeConflict.case_id(), Some(9));
        assert_eq!(SyncOutcome::NoNetwork.case_id(), None);
    }
}
