use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{AreaId, Chunk, RecordId, RecordKind};
use crate::error::BackfillError;
use crate::fields::{FieldMap, default_fields};
use crate::geometry::Geometry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    #[serde(default)]
    pub name: Option<String>,
    pub geometry: Geometry,
}

/// Read-only view of the areas being monitored.
pub trait AreaDirectory: Send + Sync {
    fn get_area(&self, id: AreaId) -> Result<Option<Area>, BackfillError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(RecordId),
    /// A record with the same key was written first.
    Conflict(RecordId),
}

/// Record storage keyed by `(kind, area, period_start, period_end)`.
///
/// `insert` must be create-if-absent: when the key is taken it returns
/// [`InsertOutcome::Conflict`] and leaves the existing record untouched.
pub trait MetricsStore: Send + Sync {
    fn find(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
    ) -> Result<Option<RecordId>, BackfillError>;

    fn insert(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
        fields: &FieldMap,
    ) -> Result<InsertOutcome, BackfillError>;

    /// Field names the store accepts for `kind`.
    fn schema_fields(&self, kind: RecordKind) -> Result<BTreeSet<String>, BackfillError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub area_id: AreaId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: String,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaManifest {
    pub vegetation: BTreeSet<String>,
    pub soil: BTreeSet<String>,
}

impl SchemaManifest {
    pub fn defaults() -> Self {
        Self {
            vegetation: default_fields(RecordKind::Vegetation),
            soil: default_fields(RecordKind::Soil),
        }
    }

    pub fn fields(&self, kind: RecordKind) -> &BTreeSet<String> {
        match kind {
            RecordKind::Vegetation => &self.vegetation,
            RecordKind::Soil => &self.soil,
        }
    }
}

/// Directory-backed store: areas, metric records, the schema manifest and
/// run records all live as JSON files under one root.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, BackfillError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("agro-backfill")).ok()
            })
            .ok_or_else(|| {
                BackfillError::Filesystem("unable to resolve data directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn schema_path(&self) -> Utf8PathBuf {
        self.root.join("schema.json")
    }

    pub fn area_path(&self, id: AreaId) -> Utf8PathBuf {
        self.root.join("areas").join(format!("{id}.json"))
    }

    pub fn record_dir(&self, kind: RecordKind, area_id: AreaId) -> Utf8PathBuf {
        self.root
            .join("metrics")
            .join(kind.as_str())
            .join(area_id.to_string())
    }

    pub fn record_path(&self, kind: RecordKind, area_id: AreaId, chunk: &Chunk) -> Utf8PathBuf {
        self.record_dir(kind, area_id)
            .join(format!("{}.json", chunk.key()))
    }

    pub fn runs_dir(&self) -> Utf8PathBuf {
        self.root.join("runs")
    }

    pub fn ensure_root(&self) -> Result<(), BackfillError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| BackfillError::Filesystem(err.to_string()))
    }

    pub fn write_schema(&self, manifest: &SchemaManifest) -> Result<(), BackfillError> {
        Self::write_json_atomic(&self.schema_path(), manifest)
    }

    pub fn put_area(&self, area: &Area) -> Result<(), BackfillError> {
        Self::write_json_atomic(&self.area_path(area.id), area)
    }

    pub fn list_areas(&self) -> Result<Vec<Area>, BackfillError> {
        let mut areas: Vec<Area> = read_json_dir(&self.root.join("areas"))?;
        areas.sort_by_key(|area| area.id);
        Ok(areas)
    }

    pub fn list_records(
        &self,
        kind: RecordKind,
        area_id: AreaId,
    ) -> Result<Vec<StoredRecord>, BackfillError> {
        let mut records: Vec<StoredRecord> = read_json_dir(&self.record_dir(kind, area_id))?;
        records.sort_by_key(|record| (record.period_start, record.period_end));
        Ok(records)
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), BackfillError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| BackfillError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| BackfillError::Filesystem(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| BackfillError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| BackfillError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, BackfillError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| BackfillError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| BackfillError::Filesystem(format!("parse {path}: {err}")))
    }
}

impl AreaDirectory for Store {
    fn get_area(&self, id: AreaId) -> Result<Option<Area>, BackfillError> {
        let path = self.area_path(id);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        Self::read_json(&path).map(Some)
    }
}

impl MetricsStore for Store {
    fn find(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
    ) -> Result<Option<RecordId>, BackfillError> {
        let path = self.record_path(kind, area_id, chunk);
        match fs::metadata(path.as_std_path()) {
            Ok(_) => Ok(Some(RecordId::for_key(kind, area_id, chunk))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackfillError::Persistence(format!("lookup {path}: {err}"))),
        }
    }

    fn insert(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
        fields: &FieldMap,
    ) -> Result<InsertOutcome, BackfillError> {
        let path = self.record_path(kind, area_id, chunk);
        let id = RecordId::for_key(kind, area_id, chunk);
        let parent = path
            .parent()
            .ok_or_else(|| BackfillError::Persistence("invalid record path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| BackfillError::Persistence(err.to_string()))?;

        let record = StoredRecord {
            id: id.clone(),
            kind,
            area_id,
            period_start: chunk.start,
            period_end: chunk.end,
            created_at: chrono::Utc::now().to_rfc3339(),
            fields: fields.clone(),
        };
        let content = serde_json::to_vec_pretty(&record)
            .map_err(|err| BackfillError::Persistence(err.to_string()))?;

        let mut temp = Builder::new()
            .prefix(".record")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| BackfillError::Persistence(err.to_string()))?;
        temp.write_all(&content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| BackfillError::Persistence(err.to_string()))?;

        match temp.persist_noclobber(path.as_std_path()) {
            Ok(_) => Ok(InsertOutcome::Inserted(id)),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(InsertOutcome::Conflict(id))
            }
            Err(err) => Err(BackfillError::Persistence(err.error.to_string())),
        }
    }

    fn schema_fields(&self, kind: RecordKind) -> Result<BTreeSet<String>, BackfillError> {
        let path = self.schema_path();
        if !path.as_std_path().exists() {
            return Err(BackfillError::Schema(format!(
                "schema manifest missing at {path}"
            )));
        }
        let manifest: SchemaManifest =
            Self::read_json(&path).map_err(|err| BackfillError::Schema(err.to_string()))?;
        Ok(manifest.fields(kind).clone())
    }
}

/// Every `*.json` file directly under `dir`; a missing directory reads as empty.
pub fn read_json_dir<T: DeserializeOwned>(dir: &Utf8Path) -> Result<Vec<T>, BackfillError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| BackfillError::Filesystem(err.to_string()))?;
    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| BackfillError::Filesystem(err.to_string()))?;
        let path = entry.path();
        let Some(path) = Utf8Path::from_path(&path) else {
            continue;
        };
        if path.is_file() && path.extension() == Some("json") {
            items.push(Store::read_json(path)?);
        }
    }
    Ok(items)
}
