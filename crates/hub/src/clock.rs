//! Controller wall clock at a fixed UTC offset.
//!
//! The hub never consults a timezone database: local time is UTC shifted by
//! a constant offset (UTC+7 unless configured otherwise), so daylight-saving
//! rules never move a schedule window.

use anyhow::{Context, Result};
use time::format_description::FormatItem;
use time::macros::{format_description, offset};
use time::{OffsetDateTime, UtcOffset};

pub const DEFAULT_OFFSET: UtcOffset = offset!(+7);

const OFFSET_FORMAT: &[FormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: UtcOffset,
    frozen: Option<OffsetDateTime>,
}

impl Clock {
    pub fn new(offset: UtcOffset) -> Self {
        Self {
            offset,
            frozen: None,
        }
    }

    /// A clock that always reports `at` (in `at`'s own offset).
    #[cfg(test)]
    pub fn fixed(at: OffsetDateTime) -> Self {
        Self {
            offset: at.offset(),
            frozen: Some(at),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.frozen
            .unwrap_or_else(OffsetDateTime::now_utc)
            .to_offset(self.offset)
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Unix seconds → local timestamp.
    pub fn local_from_unix(&self, ts: i64) -> Result<OffsetDateTime> {
        Ok(OffsetDateTime::from_unix_timestamp(ts)
            .with_context(|| format!("timestamp {ts} out of range"))?
            .to_offset(self.offset))
    }
}

/// Parse an offset written as `+HH:MM` / `-HH:MM`.
pub fn parse_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(s.trim(), OFFSET_FORMAT)
        .with_context(|| format!("invalid UTC offset {s:?} (expected e.g. \"+07:00\")"))
}
