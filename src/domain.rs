use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BackfillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaId(u64);

impl AreaId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AreaId {
    type Err = BackfillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(BackfillError::InvalidAreaId(value.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| BackfillError::InvalidAreaId(value.to_string()))
    }
}

/// Inclusive date window used as the unit of dedup, compute and persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chunk {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Chunk {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// File-safe key used by the store, e.g. `2024-01-01_2024-01-10`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, BackfillError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|err| BackfillError::InvalidRange(format!("unparseable date {value:?}: {err}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepthBand {
    D0To5,
    D5To15,
    D15To30,
    D30To60,
    D60To100,
    D100To200,
}

impl DepthBand {
    /// Shallowest to deepest.
    pub const ALL: [DepthBand; 6] = [
        DepthBand::D0To5,
        DepthBand::D5To15,
        DepthBand::D15To30,
        DepthBand::D30To60,
        DepthBand::D60To100,
        DepthBand::D100To200,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DepthBand::D0To5 => "0-5cm",
            DepthBand::D5To15 => "5-15cm",
            DepthBand::D15To30 => "15-30cm",
            DepthBand::D30To60 => "30-60cm",
            DepthBand::D60To100 => "60-100cm",
            DepthBand::D100To200 => "100-200cm",
        }
    }

    pub fn column_prefix(self) -> &'static str {
        match self {
            DepthBand::D0To5 => "clay_0_5",
            DepthBand::D5To15 => "clay_5_15",
            DepthBand::D15To30 => "clay_15_30",
            DepthBand::D30To60 => "clay_30_60",
            DepthBand::D60To100 => "clay_60_100",
            DepthBand::D100To200 => "clay_100_200",
        }
    }

    pub fn index(self) -> usize {
        match self {
            DepthBand::D0To5 => 0,
            DepthBand::D5To15 => 1,
            DepthBand::D15To30 => 2,
            DepthBand::D30To60 => 3,
            DepthBand::D60To100 => 4,
            DepthBand::D100To200 => 5,
        }
    }

    /// The three persisted column names: `(mean, min, max)`.
    pub fn columns(self) -> [String; 3] {
        let prefix = self.column_prefix();
        [
            format!("{prefix}_mean"),
            format!("{prefix}_min"),
            format!("{prefix}_max"),
        ]
    }
}

impl fmt::Display for DepthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DepthBand {
    type Err = BackfillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        DepthBand::ALL
            .into_iter()
            .find(|band| band.label() == trimmed)
            .ok_or_else(|| BackfillError::InvalidDepth(value.to_string()))
    }
}

impl Serialize for DepthBand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for DepthBand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Vegetation,
    Soil,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Vegetation => "vegetation",
            RecordKind::Soil => "soil",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn for_key(kind: RecordKind, area_id: AreaId, chunk: &Chunk) -> Self {
        Self(format!("{}:{}:{}", kind.as_str(), area_id, chunk.key()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_area_id() {
        let id: AreaId = " 42 ".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_matches!("-1".parse::<AreaId>(), Err(BackfillError::InvalidAreaId(_)));
        assert_matches!("".parse::<AreaId>(), Err(BackfillError::InvalidAreaId(_)));
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_matches!(parse_date("2023-02-29"), Err(BackfillError::InvalidRange(_)));
        assert_matches!(parse_date("01/02/2024"), Err(BackfillError::InvalidRange(_)));
    }

    #[test]
    fn depth_bands_are_ordered_and_prefixed() {
        let labels: Vec<_> = DepthBand::ALL.iter().map(|band| band.label()).collect();
        assert_eq!(
            labels,
            ["0-5cm", "5-15cm", "15-30cm", "30-60cm", "60-100cm", "100-200cm"]
        );
        for (position, band) in DepthBand::ALL.iter().enumerate() {
            assert_eq!(band.index(), position);
        }
        assert_eq!(
            DepthBand::D100To200.columns(),
            [
                "clay_100_200_mean".to_string(),
                "clay_100_200_min".to_string(),
                "clay_100_200_max".to_string()
            ]
        );
        assert_eq!("30-60cm".parse::<DepthBand>().unwrap(), DepthBand::D30To60);
        assert_matches!("30-61cm".parse::<DepthBand>(), Err(BackfillError::InvalidDepth(_)));
    }

    #[test]
    fn chunk_key_and_length() {
        let chunk = Chunk::new(
            NaiveDate::from_ymd_opt(2024, 1, 21).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
        );
        assert_eq!(chunk.days(), 5);
        assert_eq!(chunk.key(), "2024-01-21_2024-01-25");
        assert_eq!(
            RecordId::for_key(RecordKind::Soil, AreaId::new(7), &chunk).as_str(),
            "soil:7:2024-01-21_2024-01-25"
        );
    }
}
