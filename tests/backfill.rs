use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde_json::json;
use tempfile::TempDir;

use agro_backfill::backfill::{BackfillRequest, Backfiller, ProgressEvent, ProgressSink, Stage};
use agro_backfill::domain::{AreaId, Chunk, DepthBand, RecordId, RecordKind};
use agro_backfill::error::BackfillError;
use agro_backfill::fields::FieldMap;
use agro_backfill::geometry::Geometry;
use agro_backfill::soil::{SoilClient, SoilStats};
use agro_backfill::store::{Area, InsertOutcome, MetricsStore, SchemaManifest, Store};
use agro_backfill::vegetation::VegetationClient;

fn date(value: &str) -> NaiveDate {
    value.parse().unwrap()
}

#[derive(Clone, Default)]
struct MockVegetation {
    calls: Arc<Mutex<Vec<NaiveDate>>>,
    fail_on: Option<NaiveDate>,
}

impl VegetationClient for MockVegetation {
    fn compute(
        &self,
        _geometry: &Geometry,
        start: NaiveDate,
        _end: NaiveDate,
        _collection: &str,
    ) -> Result<FieldMap, BackfillError> {
        self.calls.lock().unwrap().push(start);
        if self.fail_on == Some(start) {
            return Err(BackfillError::VegetationStatus {
                status: 503,
                body: "earth engine unavailable".to_string(),
            });
        }
        Ok([
            ("ndvi_mean".to_string(), Some(0.71)),
            ("evi_mean".to_string(), Some(0.44)),
            ("cobertura_vegetal".to_string(), None),
        ]
        .into_iter()
        .collect())
    }
}

#[derive(Clone, Default)]
struct MockSoil {
    calls: Arc<Mutex<usize>>,
    fail_at: Option<DepthBand>,
}

impl SoilClient for MockSoil {
    fn compute(
        &self,
        _geometry: &Geometry,
        depth: DepthBand,
        _scale: u32,
    ) -> Result<SoilStats, BackfillError> {
        *self.calls.lock().unwrap() += 1;
        if self.fail_at == Some(depth) {
            return Err(BackfillError::SoilHttp("timed out".to_string()));
        }
        Ok(SoilStats {
            mean: Some(32.5),
            min: Some(20.0),
            max: Some(41.0),
        })
    }
}

/// Records every message and requests cancellation once `cancel_after`
/// chunks have completed.
#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
    completed: Mutex<usize>,
    cancel_after: Option<usize>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        if let Some((done, _)) = event.chunks {
            *self.completed.lock().unwrap() = done;
        }
        self.messages.lock().unwrap().push(event.message);
    }

    fn cancelled(&self) -> bool {
        self.cancel_after
            .map(|limit| *self.completed.lock().unwrap() >= limit)
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy)]
enum Fault {
    SoilInsert,
    ConflictOnInsert,
    Lookup,
}

/// Delegates to a real [`Store`] but injects one kind of storage fault.
#[derive(Clone)]
struct FaultyStore {
    inner: Store,
    fault: Fault,
    inserts: Arc<Mutex<usize>>,
}

impl FaultyStore {
    fn new(inner: &Store, fault: Fault) -> Self {
        Self {
            inner: inner.clone(),
            fault,
            inserts: Arc::default(),
        }
    }
}

impl MetricsStore for FaultyStore {
    fn find(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
    ) -> Result<Option<RecordId>, BackfillError> {
        if let Fault::Lookup = self.fault {
            return Err(BackfillError::Persistence("index unreadable".to_string()));
        }
        self.inner.find(kind, area_id, chunk)
    }

    fn insert(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
        fields: &FieldMap,
    ) -> Result<InsertOutcome, BackfillError> {
        *self.inserts.lock().unwrap() += 1;
        let id = RecordId::for_key(kind, area_id, chunk);
        match (self.fault, kind) {
            (Fault::SoilInsert, RecordKind::Soil) => {
                Err(BackfillError::Persistence("disk full".to_string()))
            }
            (Fault::ConflictOnInsert, _) => Ok(InsertOutcome::Conflict(id)),
            _ => self.inner.insert(kind, area_id, chunk, fields),
        }
    }

    fn schema_fields(&self, kind: RecordKind) -> Result<BTreeSet<String>, BackfillError> {
        self.inner.schema_fields(kind)
    }
}

fn faulty_backfiller(
    store: &FaultyStore,
    vegetation: &MockVegetation,
    soil: &MockSoil,
) -> Backfiller<Store, FaultyStore, MockVegetation, MockSoil> {
    Backfiller::new(
        store.inner.clone(),
        store.clone(),
        vegetation.clone(),
        soil.clone(),
    )
}

fn store_with_area() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = Store::new(root);
    store
        .put_area(&Area {
            id: AreaId::new(7),
            name: Some("Fazenda Boa Vista".to_string()),
            geometry: Geometry::from_geojson(json!({
                "type": "Polygon",
                "coordinates": [[[-47.1, -22.9], [-47.0, -22.9], [-47.0, -22.8], [-47.1, -22.9]]]
            }))
            .unwrap(),
        })
        .unwrap();
    (dir, store)
}

fn request(start: &str, end: &str, include_soil: bool) -> BackfillRequest {
    BackfillRequest {
        area_id: AreaId::new(7),
        start_date: start.to_string(),
        end_date: end.to_string(),
        period_days: 10,
        collection: "SENTINEL2".to_string(),
        include_soil,
        soil_scale: 250,
    }
}

fn backfiller(
    store: &Store,
    vegetation: &MockVegetation,
    soil: &MockSoil,
) -> Backfiller<Store, Store, MockVegetation, MockSoil> {
    Backfiller::new(store.clone(), store.clone(), vegetation.clone(), soil.clone())
}

#[test]
fn fresh_run_inserts_every_chunk() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();

    let report = backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", true), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.requested_chunks, 3);
    assert_eq!(report.processed_chunks, 3);
    assert!(!report.cancelled);
    assert!(!report.has_errors());
    assert_eq!(report.vegetation_inserted.len(), 3);
    assert_eq!(report.soil_inserted.len(), 3);
    assert_eq!(
        report.vegetation_inserted[2].id.as_str(),
        "vegetation:7:2024-01-21_2024-01-25"
    );
    assert_eq!(*soil.calls.lock().unwrap(), 18);

    let records = store.list_records(RecordKind::Vegetation, AreaId::new(7)).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].period_start, date("2024-01-01"));
    assert_eq!(records[0].fields.get("ndvi_mean"), Some(&Some(0.71)));
}

#[test]
fn rerun_reports_existing_without_provider_calls() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();
    let runner = backfiller(&store, &vegetation, &soil);
    let sink = RecordingSink::default();

    runner
        .backfill(&request("2024-01-01", "2024-01-25", true), &sink)
        .unwrap();
    vegetation.calls.lock().unwrap().clear();
    *soil.calls.lock().unwrap() = 0;

    let report = runner
        .backfill(&request("2024-01-01", "2024-01-25", true), &sink)
        .unwrap();

    assert!(report.vegetation_inserted.is_empty());
    assert!(report.soil_inserted.is_empty());
    assert_eq!(report.vegetation_existing.len(), 3);
    assert_eq!(report.soil_existing.len(), 3);
    assert!(vegetation.calls.lock().unwrap().is_empty());
    assert_eq!(*soil.calls.lock().unwrap(), 0);
    assert_eq!(
        store
            .list_records(RecordKind::Soil, AreaId::new(7))
            .unwrap()
            .len(),
        3
    );
}

#[test]
fn existing_vegetation_still_gets_soil() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();
    let runner = backfiller(&store, &vegetation, &soil);
    let sink = RecordingSink::default();

    runner
        .backfill(&request("2024-01-01", "2024-01-25", false), &sink)
        .unwrap();
    assert_eq!(*soil.calls.lock().unwrap(), 0);

    let report = runner
        .backfill(&request("2024-01-01", "2024-01-25", true), &sink)
        .unwrap();
    assert_eq!(report.vegetation_existing.len(), 3);
    assert_eq!(report.soil_inserted.len(), 3);
}

#[test]
fn failed_chunk_does_not_stop_the_run() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation {
        fail_on: Some(date("2024-01-11")),
        ..MockVegetation::default()
    };
    let soil = MockSoil::default();

    let report = backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", true), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.processed_chunks, 3);
    assert_eq!(report.vegetation_inserted.len(), 2);
    assert_eq!(report.errors.len(), 1);
    let middle = Chunk::new(date("2024-01-11"), date("2024-01-20"));
    assert!(report
        .errors_for(&Chunk::new(date("2024-01-01"), date("2024-01-10")))
        .is_empty());
    let middle_errors = report.errors_for(&middle);
    assert_eq!(middle_errors.len(), 1);
    let error = middle_errors[0];
    assert_eq!(error.chunk(), middle);
    assert_eq!(error.track, RecordKind::Vegetation);
    assert_eq!(error.stage, Stage::Compute);
    assert_eq!(error.status_code, Some(503));

    let soil_starts: Vec<NaiveDate> = report.soil_inserted.iter().map(|r| r.start).collect();
    assert_eq!(soil_starts, vec![date("2024-01-01"), date("2024-01-21")]);
    assert_eq!(*soil.calls.lock().unwrap(), 12);
}

#[test]
fn soil_insert_failure_keeps_vegetation_records() {
    let (_dir, store) = store_with_area();
    let faulty = FaultyStore::new(&store, Fault::SoilInsert);
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();

    let report = faulty_backfiller(&faulty, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", true), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.processed_chunks, 3);
    assert_eq!(report.vegetation_inserted.len(), 3);
    assert!(report.soil_inserted.is_empty());
    assert_eq!(report.errors.len(), 3);
    assert!(report
        .errors
        .iter()
        .all(|error| error.track == RecordKind::Soil && error.stage == Stage::Persist));
    assert!(report.errors.iter().all(|error| error.depth.is_none()));
    assert_eq!(*soil.calls.lock().unwrap(), 18);
    assert_eq!(
        store
            .list_records(RecordKind::Vegetation, AreaId::new(7))
            .unwrap()
            .len(),
        3
    );
    assert!(store
        .list_records(RecordKind::Soil, AreaId::new(7))
        .unwrap()
        .is_empty());
}

#[test]
fn insert_conflict_counts_as_existing() {
    let (_dir, store) = store_with_area();
    let faulty = FaultyStore::new(&store, Fault::ConflictOnInsert);
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();

    let report = faulty_backfiller(&faulty, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", true), &RecordingSink::default())
        .unwrap();

    assert!(!report.has_errors());
    assert!(report.vegetation_inserted.is_empty());
    assert!(report.soil_inserted.is_empty());
    assert_eq!(report.vegetation_existing.len(), 3);
    assert_eq!(report.soil_existing.len(), 3);
    assert_eq!(report.soil_existing[0].id.as_str(), "soil:7:2024-01-01_2024-01-10");
    assert_eq!(*faulty.inserts.lock().unwrap(), 6);
    assert_eq!(vegetation.calls.lock().unwrap().len(), 3);
    assert_eq!(*soil.calls.lock().unwrap(), 18);
}

#[test]
fn lookup_failure_skips_chunk_without_provider_calls() {
    let (_dir, store) = store_with_area();
    let faulty = FaultyStore::new(&store, Fault::Lookup);
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();

    let report = faulty_backfiller(&faulty, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", true), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.processed_chunks, 3);
    assert_eq!(report.errors.len(), 3);
    for error in &report.errors {
        assert_eq!(error.track, RecordKind::Vegetation);
        assert_eq!(error.stage, Stage::Lookup);
        assert_eq!(error.status_code, None);
    }
    assert!(report.vegetation_inserted.is_empty());
    assert!(report.vegetation_existing.is_empty());
    assert!(report.soil_inserted.is_empty());
    assert!(vegetation.calls.lock().unwrap().is_empty());
    assert_eq!(*soil.calls.lock().unwrap(), 0);
    assert_eq!(*faulty.inserts.lock().unwrap(), 0);
}

#[test]
fn failed_depth_leaves_null_columns() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil {
        fail_at: Some(DepthBand::D15To30),
        ..MockSoil::default()
    };

    let report = backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-10", true), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.soil_inserted.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].track, RecordKind::Soil);
    assert_eq!(report.errors[0].depth, Some(DepthBand::D15To30));

    let records = store.list_records(RecordKind::Soil, AreaId::new(7)).unwrap();
    let fields = &records[0].fields;
    assert_eq!(fields.len(), 18);
    assert_eq!(fields.get("clay_15_30_mean"), Some(&None));
    assert_eq!(fields.get("clay_15_30_max"), Some(&None));
    assert_eq!(fields.get("clay_0_5_mean"), Some(&Some(32.5)));
    assert_eq!(fields.get("clay_100_200_min"), Some(&Some(20.0)));
}

#[test]
fn schema_manifest_limits_persisted_fields() {
    let (_dir, store) = store_with_area();
    store
        .write_schema(&SchemaManifest {
            vegetation: BTreeSet::from(["ndvi_mean".to_string()]),
            soil: SchemaManifest::defaults().soil,
        })
        .unwrap();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();

    backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-10", false), &RecordingSink::default())
        .unwrap();

    let records = store.list_records(RecordKind::Vegetation, AreaId::new(7)).unwrap();
    let names: Vec<&String> = records[0].fields.keys().collect();
    assert_eq!(names, vec!["ndvi_mean"]);
}

#[test]
fn cancellation_stops_between_chunks() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();
    let sink = RecordingSink {
        cancel_after: Some(1),
        ..RecordingSink::default()
    };

    let report = backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-25", false), &sink)
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.processed_chunks, 1);
    assert_eq!(report.vegetation_inserted.len(), 1);
    assert_eq!(vegetation.calls.lock().unwrap().len(), 1);
}

#[test]
fn progress_reports_phases_and_latency() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();
    let sink = RecordingSink::default();

    backfiller(&store, &vegetation, &soil)
        .backfill(&request("2024-01-01", "2024-01-10", true), &sink)
        .unwrap();

    let messages = sink.messages.lock().unwrap();
    assert!(messages[0].starts_with("phase=Resolve;"));
    assert!(messages.iter().any(|m| m.starts_with("phase=Plan;")));
    assert!(messages.iter().any(|m| m.starts_with("phase=Soil;")));
    assert!(messages
        .iter()
        .any(|m| m.starts_with("vegetation.response latency_ms=")));
}

#[test]
fn invalid_requests_are_fatal() {
    let (_dir, store) = store_with_area();
    let vegetation = MockVegetation::default();
    let soil = MockSoil::default();
    let runner = backfiller(&store, &vegetation, &soil);
    let sink = RecordingSink::default();

    assert_matches!(
        runner.backfill(&request("2024-02-01", "2024-01-01", false), &sink),
        Err(BackfillError::InvalidRange(_))
    );
    assert_matches!(
        runner.backfill(&request("2024-13-01", "2024-12-31", false), &sink),
        Err(BackfillError::InvalidRange(_))
    );

    let mut unknown = request("2024-01-01", "2024-01-10", false);
    unknown.area_id = AreaId::new(99);
    assert_matches!(
        runner.backfill(&unknown, &sink),
        Err(BackfillError::AreaNotFound(_))
    );

    let mut zero_period = request("2024-01-01", "2024-01-10", false);
    zero_period.period_days = 0;
    assert_matches!(
        runner.backfill(&zero_period, &sink),
        Err(BackfillError::InvalidRange(_))
    );

    assert!(vegetation.calls.lock().unwrap().is_empty());
    assert!(store
        .list_records(RecordKind::Vegetation, AreaId::new(7))
        .unwrap()
        .is_empty());
}
