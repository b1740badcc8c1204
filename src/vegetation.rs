use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::BackfillError;
use crate::fields::{FieldMap, normalize_vegetation};
use crate::geometry::Geometry;

pub const DEFAULT_VEGETATION_URL: &str = "http://127.0.0.1:8000/compute";

pub trait VegetationClient: Send + Sync {
    /// Spectral index statistics for `geometry` over `[start, end]`, keyed by
    /// canonical field name.
    fn compute(
        &self,
        geometry: &Geometry,
        start: NaiveDate,
        end: NaiveDate,
        collection: &str,
    ) -> Result<FieldMap, BackfillError>;
}

#[derive(Debug, Serialize)]
struct ComputeRequest<'a> {
    geometry: &'a Geometry,
    start_date: String,
    end_date: String,
    collection: &'a str,
    timeseries: bool,
}

#[derive(Clone)]
pub struct VegetationHttpClient {
    client: Client,
    url: String,
}

impl VegetationHttpClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BackfillError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("agro-backfill/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BackfillError::VegetationHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| BackfillError::VegetationHttp(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BackfillError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .unwrap_or_else(|_| "vegetation provider request failed".to_string());
        Err(BackfillError::VegetationStatus { status, body })
    }
}

impl VegetationClient for VegetationHttpClient {
    fn compute(
        &self,
        geometry: &Geometry,
        start: NaiveDate,
        end: NaiveDate,
        collection: &str,
    ) -> Result<FieldMap, BackfillError> {
        let payload = ComputeRequest {
            geometry,
            start_date: start.to_string(),
            end_date: end.to_string(),
            collection,
            timeseries: false,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|err| BackfillError::VegetationHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let raw: Value = response
            .json()
            .map_err(|err| BackfillError::VegetationHttp(format!("invalid response body: {err}")))?;

        Ok(normalize_vegetation(&extract_metrics(&raw)))
    }
}

/// The `metrics` object of a provider response; absent or null reads as empty.
pub fn extract_metrics(raw: &Value) -> Map<String, Value> {
    raw.get("metrics")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
