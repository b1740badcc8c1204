use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{AreaId, Chunk, DepthBand, RecordId, RecordKind, parse_date};
use crate::error::BackfillError;
use crate::gateway::MetricsGateway;
use crate::geometry::Geometry;
use crate::planner::plan;
use crate::soil::{SoilClient, collect_profile};
use crate::store::{AreaDirectory, InsertOutcome, MetricsStore};
use crate::vegetation::VegetationClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub area_id: AreaId,
    pub start_date: String,
    pub end_date: String,
    pub period_days: u32,
    pub collection: String,
    pub include_soil: bool,
    pub soil_scale: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub id: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Lookup,
    Compute,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkError {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub track: RecordKind,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<DepthBand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub message: String,
}

impl ChunkError {
    pub fn chunk(&self) -> Chunk {
        Chunk::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub area_id: AreaId,
    pub requested_chunks: usize,
    pub processed_chunks: usize,
    pub cancelled: bool,
    pub vegetation_inserted: Vec<ChunkRecord>,
    pub vegetation_existing: Vec<ChunkRecord>,
    pub soil_inserted: Vec<ChunkRecord>,
    pub soil_existing: Vec<ChunkRecord>,
    pub errors: Vec<ChunkError>,
}

impl BackfillReport {
    fn new(area_id: AreaId, requested_chunks: usize) -> Self {
        Self {
            area_id,
            requested_chunks,
            processed_chunks: 0,
            cancelled: false,
            vegetation_inserted: Vec::new(),
            vegetation_existing: Vec::new(),
            soil_inserted: Vec::new(),
            soil_existing: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors_for(&self, chunk: &Chunk) -> Vec<&ChunkError> {
        self.errors
            .iter()
            .filter(|error| error.chunk() == *chunk)
            .collect()
    }

    fn record(list: &mut Vec<ChunkRecord>, chunk: &Chunk, id: RecordId) {
        list.push(ChunkRecord {
            start: chunk.start,
            end: chunk.end,
            id,
        });
    }

    fn fail(
        &mut self,
        chunk: &Chunk,
        track: RecordKind,
        stage: Stage,
        depth: Option<DepthBand>,
        error: &BackfillError,
    ) {
        self.errors.push(ChunkError {
            start: chunk.start,
            end: chunk.end,
            track,
            stage,
            depth,
            status_code: error.provider_status(),
            message: error.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    /// `(chunks done, chunks planned)` when the event marks chunk progress.
    pub chunks: Option<(usize, usize)>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            chunks: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);

    /// Polled before each chunk; returning `true` stops the run early.
    fn cancelled(&self) -> bool {
        false
    }
}

/// Drives planner → dedup → compute → persist for every chunk of a request.
#[derive(Clone)]
pub struct Backfiller<D: AreaDirectory, M: MetricsStore, V: VegetationClient, S: SoilClient> {
    areas: D,
    store: M,
    vegetation: V,
    soil: S,
}

impl<D: AreaDirectory, M: MetricsStore, V: VegetationClient, S: SoilClient> Backfiller<D, M, V, S> {
    pub fn new(areas: D, store: M, vegetation: V, soil: S) -> Self {
        Self {
            areas,
            store,
            vegetation,
            soil,
        }
    }

    /// Fails only when the area is unknown or the range is invalid. Every
    /// provider or storage failure after that lands in the report.
    pub fn backfill(
        &self,
        request: &BackfillRequest,
        sink: &dyn ProgressSink,
    ) -> Result<BackfillReport, BackfillError> {
        sink.event(ProgressEvent::message(format!(
            "phase=Resolve; area {}",
            request.area_id
        )));
        let area = self
            .areas
            .get_area(request.area_id)?
            .ok_or_else(|| BackfillError::AreaNotFound(request.area_id.to_string()))?;

        let start = parse_date(&request.start_date)?;
        let end = parse_date(&request.end_date)?;
        let chunks = plan(start, end, request.period_days)?;
        let total = chunks.len();
        info!(
            area_id = %area.id,
            %start,
            %end,
            period_days = request.period_days,
            chunks = total,
            include_soil = request.include_soil,
            "starting backfill"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Plan; {total} chunks of up to {} days", request.period_days),
            elapsed: None,
            chunks: Some((0, total)),
        });

        let gateway = MetricsGateway::new(&self.store);
        let mut report = BackfillReport::new(area.id, total);
        let started = Instant::now();

        for (position, chunk) in chunks.iter().enumerate() {
            if sink.cancelled() {
                warn!(area_id = %area.id, processed = position, "backfill cancelled");
                report.cancelled = true;
                break;
            }

            let has_vegetation = self.vegetation_track(
                &gateway,
                area.id,
                &area.geometry,
                chunk,
                request,
                &mut report,
                sink,
            );
            if request.include_soil && has_vegetation {
                self.soil_track(
                    &gateway,
                    area.id,
                    &area.geometry,
                    chunk,
                    request,
                    &mut report,
                    sink,
                );
            }

            report.processed_chunks += 1;
            sink.event(ProgressEvent {
                message: format!("chunk {chunk} done"),
                elapsed: Some(started.elapsed()),
                chunks: Some((position + 1, total)),
            });
        }

        info!(
            area_id = %area.id,
            vegetation_inserted = report.vegetation_inserted.len(),
            vegetation_existing = report.vegetation_existing.len(),
            soil_inserted = report.soil_inserted.len(),
            soil_existing = report.soil_existing.len(),
            errors = report.errors.len(),
            "backfill finished"
        );
        Ok(report)
    }

    /// Returns whether the chunk ends up with a vegetation record.
    #[allow(clippy::too_many_arguments)]
    fn vegetation_track(
        &self,
        gateway: &MetricsGateway<'_, M>,
        area_id: AreaId,
        geometry: &Geometry,
        chunk: &Chunk,
        request: &BackfillRequest,
        report: &mut BackfillReport,
        sink: &dyn ProgressSink,
    ) -> bool {
        sink.event(ProgressEvent::message(format!("phase=Vegetation; chunk {chunk}")));

        match gateway.find(RecordKind::Vegetation, area_id, chunk) {
            Ok(Some(id)) => {
                debug!(%chunk, %id, "vegetation record exists");
                BackfillReport::record(&mut report.vegetation_existing, chunk, id);
                return true;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%chunk, error = %err, "vegetation lookup failed");
                report.fail(chunk, RecordKind::Vegetation, Stage::Lookup, None, &err);
                return false;
            }
        }

        sink.event(ProgressEvent::message("vegetation.request"));
        let requested = Instant::now();
        let fields = match self
            .vegetation
            .compute(geometry, chunk.start, chunk.end, &request.collection)
        {
            Ok(fields) => fields,
            Err(err) => {
                warn!(%chunk, error = %err, "vegetation compute failed");
                report.fail(chunk, RecordKind::Vegetation, Stage::Compute, None, &err);
                return false;
            }
        };
        sink.event(ProgressEvent::message(format!(
            "vegetation.response latency_ms={}",
            requested.elapsed().as_millis()
        )));

        match gateway.insert(RecordKind::Vegetation, area_id, chunk, fields) {
            Ok(InsertOutcome::Inserted(id)) => {
                debug!(%chunk, %id, "vegetation record inserted");
                BackfillReport::record(&mut report.vegetation_inserted, chunk, id);
                true
            }
            Ok(InsertOutcome::Conflict(id)) => {
                debug!(%chunk, %id, "vegetation record written concurrently");
                BackfillReport::record(&mut report.vegetation_existing, chunk, id);
                true
            }
            Err(err) => {
                warn!(%chunk, error = %err, "vegetation insert failed");
                report.fail(chunk, RecordKind::Vegetation, Stage::Persist, None, &err);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn soil_track(
        &self,
        gateway: &MetricsGateway<'_, M>,
        area_id: AreaId,
        geometry: &Geometry,
        chunk: &Chunk,
        request: &BackfillRequest,
        report: &mut BackfillReport,
        sink: &dyn ProgressSink,
    ) {
        sink.event(ProgressEvent::message(format!("phase=Soil; chunk {chunk}")));

        match gateway.find(RecordKind::Soil, area_id, chunk) {
            Ok(Some(id)) => {
                debug!(%chunk, %id, "soil record exists");
                BackfillReport::record(&mut report.soil_existing, chunk, id);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%chunk, error = %err, "soil lookup failed");
                report.fail(chunk, RecordKind::Soil, Stage::Lookup, None, &err);
                return;
            }
        }

        sink.event(ProgressEvent::message("soil.request"));
        let requested = Instant::now();
        let profile = collect_profile(&self.soil, geometry, request.soil_scale);
        sink.event(ProgressEvent::message(format!(
            "soil.response latency_ms={}",
            requested.elapsed().as_millis()
        )));
        for (depth, err) in &profile.failures {
            report.fail(chunk, RecordKind::Soil, Stage::Compute, Some(*depth), err);
        }

        match gateway.insert(RecordKind::Soil, area_id, chunk, profile.to_fields()) {
            Ok(InsertOutcome::Inserted(id)) => {
                debug!(%chunk, %id, depths = profile.succeeded(), "soil record inserted");
                BackfillReport::record(&mut report.soil_inserted, chunk, id);
            }
            Ok(InsertOutcome::Conflict(id)) => {
                debug!(%chunk, %id, "soil record written concurrently");
                BackfillReport::record(&mut report.soil_existing, chunk, id);
            }
            Err(err) => {
                warn!(%chunk, error = %err, "soil insert failed");
                report.fail(chunk, RecordKind::Soil, Stage::Persist, None, &err);
            }
        }
    }
}
