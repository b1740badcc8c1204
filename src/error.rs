use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BackfillError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid area id: {0}")]
    InvalidAreaId(String),

    #[error("area not found: {0}")]
    AreaNotFound(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid depth band: {0}")]
    InvalidDepth(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("vegetation provider request failed: {0}")]
    VegetationHttp(String),

    #[error("vegetation provider returned status {status}: {body}")]
    VegetationStatus { status: u16, body: String },

    #[error("soil provider request failed: {0}")]
    SoilHttp(String),

    #[error("soil provider returned status {status}: {body}")]
    SoilStatus { status: u16, body: String },

    #[error("failed to persist record: {0}")]
    Persistence(String),

    #[error("schema introspection failed: {0}")]
    Schema(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BackfillError {
    /// HTTP status carried by a provider rejection, if any.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            BackfillError::VegetationStatus { status, .. }
            | BackfillError::SoilStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            BackfillError::VegetationHttp(_)
                | BackfillError::VegetationStatus { .. }
                | BackfillError::SoilHttp(_)
                | BackfillError::SoilStatus { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_only_for_status_variants() {
        let err = BackfillError::SoilStatus {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.provider_status(), Some(502));
        assert!(err.is_provider_failure());

        let err = BackfillError::VegetationHttp("timed out".to_string());
        assert_eq!(err.provider_status(), None);
        assert!(err.is_provider_failure());

        assert!(!BackfillError::Persistence("disk full".to_string()).is_provider_failure());
    }
}
