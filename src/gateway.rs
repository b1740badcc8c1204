use std::cell::OnceCell;
use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::domain::{AreaId, Chunk, RecordId, RecordKind};
use crate::error::BackfillError;
use crate::fields::{FieldMap, default_fields};
use crate::store::{InsertOutcome, MetricsStore};

/// Dedup and insert front for a [`MetricsStore`].
///
/// The accepted field set of each record kind is introspected once, on first
/// use, and falls back to the built-in defaults when introspection fails.
/// Fields the store does not accept are dropped before insert.
pub struct MetricsGateway<'a, S: MetricsStore + ?Sized> {
    store: &'a S,
    vegetation_fields: OnceCell<BTreeSet<String>>,
    soil_fields: OnceCell<BTreeSet<String>>,
}

impl<'a, S: MetricsStore + ?Sized> MetricsGateway<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            vegetation_fields: OnceCell::new(),
            soil_fields: OnceCell::new(),
        }
    }

    pub fn find(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
    ) -> Result<Option<RecordId>, BackfillError> {
        self.store.find(kind, area_id, chunk)
    }

    pub fn exists(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
    ) -> Result<bool, BackfillError> {
        Ok(self.find(kind, area_id, chunk)?.is_some())
    }

    pub fn accepted_fields(&self, kind: RecordKind) -> &BTreeSet<String> {
        let cell = match kind {
            RecordKind::Vegetation => &self.vegetation_fields,
            RecordKind::Soil => &self.soil_fields,
        };
        cell.get_or_init(|| match self.store.schema_fields(kind) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(kind = %kind, error = %err, "schema introspection failed; using default field set");
                default_fields(kind)
            }
        })
    }

    pub fn filter(&self, kind: RecordKind, fields: FieldMap) -> FieldMap {
        let accepted = self.accepted_fields(kind);
        fields
            .into_iter()
            .filter(|(name, _)| {
                let keep = accepted.contains(name);
                if !keep {
                    debug!(kind = %kind, field = %name, "dropping field unknown to store");
                }
                keep
            })
            .collect()
    }

    pub fn insert(
        &self,
        kind: RecordKind,
        area_id: AreaId,
        chunk: &Chunk,
        fields: FieldMap,
    ) -> Result<InsertOutcome, BackfillError> {
        let filtered = self.filter(kind, fields);
        self.store.insert(kind, area_id, chunk, &filtered)
    }
}
