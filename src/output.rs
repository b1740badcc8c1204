use std::io::{self, Write};

use serde::Serialize;

use crate::audit::RunRecord;
use crate::backfill::{BackfillReport, ProgressEvent, ProgressSink};
use crate::store::{Area, StoredRecord};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BackfillReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_runs(runs: &[RunRecord]) -> io::Result<()> {
        Self::print_json(&runs)
    }

    pub fn print_records(records: &[StoredRecord]) -> io::Result<()> {
        Self::print_json(&records)
    }

    pub fn print_areas(areas: &[Area]) -> io::Result<()> {
        Self::print_json(&areas)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
