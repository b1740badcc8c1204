use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::DepthBand;
use crate::error::BackfillError;
use crate::fields::{FieldMap, SOIL_MAX_ALIASES, SOIL_MEAN_ALIASES, SOIL_MIN_ALIASES, resolve_first};
use crate::geometry::Geometry;
use crate::vegetation::extract_metrics;

pub const DEFAULT_SOIL_URL: &str = "http://127.0.0.1:8001/clay";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SoilStats {
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub trait SoilClient: Send + Sync {
    /// Clay content statistics for one depth band.
    fn compute(
        &self,
        geometry: &Geometry,
        depth: DepthBand,
        scale: u32,
    ) -> Result<SoilStats, BackfillError>;
}

#[derive(Debug, Serialize)]
struct ClayRequest<'a> {
    geometry: &'a Geometry,
    depth: &'static str,
    scale: u32,
}

#[derive(Clone)]
pub struct SoilHttpClient {
    client: Client,
    url: String,
}

impl SoilHttpClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BackfillError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("agro-backfill/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BackfillError::SoilHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| BackfillError::SoilHttp(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SoilClient for SoilHttpClient {
    fn compute(
        &self,
        geometry: &Geometry,
        depth: DepthBand,
        scale: u32,
    ) -> Result<SoilStats, BackfillError> {
        let payload = ClayRequest {
            geometry,
            depth: depth.label(),
            scale,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|err| BackfillError::SoilHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .unwrap_or_else(|_| "soil provider request failed".to_string());
            return Err(BackfillError::SoilStatus { status, body });
        }
        let raw: Value = response
            .json()
            .map_err(|err| BackfillError::SoilHttp(format!("invalid response body: {err}")))?;

        let metrics = extract_metrics(&raw);
        Ok(SoilStats {
            mean: resolve_first(&metrics, SOIL_MEAN_ALIASES),
            min: resolve_first(&metrics, SOIL_MIN_ALIASES),
            max: resolve_first(&metrics, SOIL_MAX_ALIASES),
        })
    }
}

/// One slot per depth band, shallowest first. A failed depth leaves its
/// slot empty and its error in `failures`.
#[derive(Debug, Default)]
pub struct SoilProfile {
    slots: [Option<SoilStats>; 6],
    pub failures: Vec<(DepthBand, BackfillError)>,
}

impl SoilProfile {
    pub fn stats(&self, depth: DepthBand) -> Option<SoilStats> {
        self.slots[depth.index()]
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Flattens to `{prefix}_mean|min|max` columns for all six bands.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        for depth in DepthBand::ALL {
            let stats = self.stats(depth).unwrap_or_default();
            let [mean, min, max] = depth.columns();
            fields.insert(mean, stats.mean);
            fields.insert(min, stats.min);
            fields.insert(max, stats.max);
        }
        fields
    }
}

/// Queries every depth band; a failure at one depth never stops the others.
pub fn collect_profile<C: SoilClient + ?Sized>(
    client: &C,
    geometry: &Geometry,
    scale: u32,
) -> SoilProfile {
    let mut profile = SoilProfile::default();
    for depth in DepthBand::ALL {
        match client.compute(geometry, depth, scale) {
            Ok(stats) => profile.slots[depth.index()] = Some(stats),
            Err(err) => {
                warn!(depth = %depth, error = %err, "soil depth failed");
                profile.failures.push((depth, err));
            }
        }
    }
    profile
}
