//! Provider key normalization.
//!
//! Providers report statistics under their own key names and have renamed
//! them between versions. Each canonical field lists the provider keys it
//! accepts, in priority order; the first key that is present with a non-null
//! value decides the field, even if that value then fails to coerce.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::domain::{DepthBand, RecordKind};

pub type FieldMap = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub field: &'static str,
    pub aliases: &'static [&'static str],
}

const fn alias(field: &'static str, aliases: &'static [&'static str]) -> FieldAliases {
    FieldAliases { field, aliases }
}

pub const VEGETATION_ALIASES: &[FieldAliases] = &[
    alias("ndvi_mean", &["NDVI_mean"]),
    alias("ndvi_median", &["NDVI_median"]),
    alias("ndvi_std", &["NDVI_stdDev"]),
    alias("evi_mean", &["EVI_mean"]),
    alias("evi_median", &["EVI_median"]),
    alias("evi_std", &["EVI_stdDev"]),
    alias("ndwi_mean", &["NDWI_mean"]),
    alias("ndwi_median", &["NDWI_median"]),
    alias("ndwi_std", &["NDWI_stdDev"]),
    alias("ndmi_mean", &["NDMI_mean"]),
    alias("ndmi_median", &["NDMI_median"]),
    alias("ndmi_std", &["NDMI_stdDev"]),
    alias("gndvi_mean", &["GNDVI_mean"]),
    alias("gndvi_median", &["GNDVI_median"]),
    alias("gndvi_std", &["GNDVI_stdDev"]),
    alias("ndre_mean", &["NDRE_mean"]),
    alias("ndre_median", &["NDRE_median"]),
    alias("ndre_std", &["NDRE_stdDev"]),
    alias("rendvi_mean", &["RENDVI_mean"]),
    alias("rendvi_median", &["RENDVI_median"]),
    alias("rendvi_std", &["RENDVI_stdDev"]),
    alias("biomassa", &["BIOMASSA_PROXY_mean", "BIOMASSA_PROXY"]),
    // No provider reports canopy cover yet.
    alias("cobertura_vegetal", &[]),
];

pub const SOIL_MEAN_ALIASES: &[&str] = &["CLAY_mean_%", "clay_pct_mean", "clay_mean", "mean"];
pub const SOIL_MIN_ALIASES: &[&str] = &["CLAY_min_%", "clay_pct_min", "clay_min", "min"];
pub const SOIL_MAX_ALIASES: &[&str] = &["CLAY_max_%", "clay_pct_max", "clay_max", "max"];

pub fn resolve_first(metrics: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|key| metrics.get(*key).filter(|value| !value.is_null()))
        .and_then(coerce_f64)
}

/// Numbers and numeric strings only; `NaN` and infinities are rejected.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|value| value.is_finite())
}

/// Maps a vegetation provider `metrics` object onto the canonical fields.
/// Every canonical field is present in the output.
pub fn normalize_vegetation(metrics: &Map<String, Value>) -> FieldMap {
    VEGETATION_ALIASES
        .iter()
        .map(|entry| (entry.field.to_string(), resolve_first(metrics, entry.aliases)))
        .collect()
}

/// Field set assumed when the store cannot report its own.
pub fn default_fields(kind: RecordKind) -> BTreeSet<String> {
    match kind {
        RecordKind::Vegetation => VEGETATION_ALIASES
            .iter()
            .map(|entry| entry.field.to_string())
            .collect(),
        RecordKind::Soil => DepthBand::ALL
            .into_iter()
            .flat_map(|band| band.columns())
            .collect(),
    }
}
