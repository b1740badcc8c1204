use chrono::{Days, NaiveDate};

use crate::domain::Chunk;
use crate::error::BackfillError;

const MAX_RESERVED_CHUNKS: usize = 1024;

/// Splits `[start, end]` into contiguous windows of `period_days` days. The
/// last window is truncated at `end`.
pub fn plan(start: NaiveDate, end: NaiveDate, period_days: u32) -> Result<Vec<Chunk>, BackfillError> {
    if period_days < 1 {
        return Err(BackfillError::InvalidRange(
            "period_days must be at least 1".to_string(),
        ));
    }
    if start > end {
        return Err(BackfillError::InvalidRange(format!(
            "start {start} is after end {end}"
        )));
    }

    let reserve = chunk_count(start, end, period_days).min(MAX_RESERVED_CHUNKS);
    let mut chunks = Vec::with_capacity(reserve);
    let mut cursor = start;
    loop {
        let window_end = cursor
            .checked_add_days(Days::new(u64::from(period_days) - 1))
            .map(|date| date.min(end))
            .unwrap_or(end);
        chunks.push(Chunk::new(cursor, window_end));
        if window_end >= end {
            break;
        }
        match window_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    Ok(chunks)
}

/// `ceil((end - start + 1) / period_days)`, or 0 for an empty or invalid range.
pub fn chunk_count(start: NaiveDate, end: NaiveDate, period_days: u32) -> usize {
    if period_days == 0 || start > end {
        return 0;
    }
    let days = (end - start).num_days() as u64 + 1;
    days.div_ceil(u64::from(period_days)) as usize
}
