use camino::Utf8PathBuf;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backfill::{BackfillReport, BackfillRequest};
use crate::error::BackfillError;
use crate::store::{Store, read_json_dir};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    DoneWithErrors,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub request: BackfillRequest,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub report: Option<BackfillReport>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Persists one record per backfill run under `<store>/runs`.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: Utf8PathBuf,
}

impl RunLog {
    pub fn new(store: &Store) -> Self {
        Self {
            dir: store.runs_dir(),
        }
    }

    fn path(&self, id: &str) -> Utf8PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn start(&self, request: &BackfillRequest) -> Result<RunRecord, BackfillError> {
        let now = Utc::now();
        let record = RunRecord {
            id: format!("{}-area{}", now.format("%Y%m%dT%H%M%S%3fZ"), request.area_id),
            request: request.clone(),
            status: RunStatus::Running,
            started_at: now.to_rfc3339(),
            finished_at: None,
            report: None,
            error: None,
        };
        Store::write_json_atomic(&self.path(&record.id), &record)?;
        Ok(record)
    }

    pub fn finish(
        &self,
        record: &mut RunRecord,
        outcome: Result<&BackfillReport, &BackfillError>,
    ) -> Result<(), BackfillError> {
        match outcome {
            Ok(report) => {
                record.status = if report.has_errors() {
                    RunStatus::DoneWithErrors
                } else {
                    RunStatus::Done
                };
                record.report = Some(report.clone());
            }
            Err(err) => {
                record.status = RunStatus::Failed;
                record.error = Some(err.to_string());
            }
        }
        record.finished_at = Some(Utc::now().to_rfc3339());
        Store::write_json_atomic(&self.path(&record.id), record)
    }

    /// Oldest first.
    pub fn list(&self) -> Result<Vec<RunRecord>, BackfillError> {
        let mut records: Vec<RunRecord> = read_json_dir(&self.dir)?;
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}
