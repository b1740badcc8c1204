use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BackfillError;

/// Validated GeoJSON `Polygon` or `MultiPolygon` in lon/lat order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Geometry(Value);

impl Geometry {
    pub fn from_geojson(value: Value) -> Result<Self, BackfillError> {
        let value = match value.get("type").and_then(Value::as_str) {
            Some("Feature") => value
                .get("geometry")
                .cloned()
                .ok_or_else(|| BackfillError::InvalidGeometry("feature has no geometry".to_string()))?,
            _ => value,
        };

        match value.get("type").and_then(Value::as_str) {
            Some("Polygon") | Some("MultiPolygon") => {}
            Some(other) => {
                return Err(BackfillError::InvalidGeometry(format!(
                    "expected Polygon or MultiPolygon, got {other}"
                )));
            }
            None => {
                return Err(BackfillError::InvalidGeometry(
                    "missing geometry type".to_string(),
                ));
            }
        }
        if !value.get("coordinates").map(Value::is_array).unwrap_or(false) {
            return Err(BackfillError::InvalidGeometry(
                "coordinates must be an array".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Reads the first `<coordinates>` element of a KML document as a single
    /// polygon ring. Altitudes are dropped.
    pub fn from_kml(kml: &str) -> Result<Self, BackfillError> {
        let captures = kml_coordinates_regex().captures(kml).ok_or_else(|| {
            BackfillError::InvalidGeometry("KML has no <coordinates> element".to_string())
        })?;
        let body = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

        let mut ring = Vec::new();
        for tuple in body.split_whitespace() {
            let mut parts = tuple.split(',');
            let lon = parse_ordinate(parts.next(), tuple)?;
            let lat = parse_ordinate(parts.next(), tuple)?;
            ring.push(json!([lon, lat]));
        }
        if ring.is_empty() {
            return Err(BackfillError::InvalidGeometry(
                "KML <coordinates> element is empty".to_string(),
            ));
        }

        Self::from_geojson(json!({ "type": "Polygon", "coordinates": [ring] }))
    }

    pub fn kind(&self) -> &str {
        self.0.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl TryFrom<Value> for Geometry {
    type Error = BackfillError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_geojson(value)
    }
}

impl From<Geometry> for Value {
    fn from(value: Geometry) -> Self {
        value.0
    }
}

fn parse_ordinate(part: Option<&str>, tuple: &str) -> Result<f64, BackfillError> {
    part.and_then(|value| value.trim().parse::<f64>().ok())
        .ok_or_else(|| BackfillError::InvalidGeometry(format!("bad KML coordinate tuple {tuple:?}")))
}

fn kml_coordinates_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<coordinates>(.*?)</coordinates>").expect("static regex is valid")
    })
}
