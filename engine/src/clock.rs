//! Monotonic timestamp source.
//!
//! Last-writer-wins needs every peer to stamp its own writes with strictly
//! increasing timestamps; the wall clock alone can stall or step backwards.
//! The clock takes the wall-clock reading as an input so the engine stays
//! free of IO.

use crate::value::format_timestamp;
use chrono::{DateTime, Duration, Utc};

/// Issues strictly increasing ISO-8601 timestamps for one peer session.
///
/// If the wall clock has not advanced past the last issued stamp, the next
/// stamp is bumped one millisecond past it. A session therefore never reuses
/// a timestamp for a distinct mutation.
#[derive(Debug, Clone, Default)]
pub struct MonotonicClock {
    last: Option<String>,
}

impl MonotonicClock {
    /// Create a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp given the current wall-clock reading.
    pub fn stamp(&mut self, now: DateTime<Utc>) -> String {
        let mut iso = format_timestamp(now);

        if let Some(last) = &self.last {
            if iso.as_str() <= last.as_str() {
                let behind = DateTime::parse_from_rfc3339(last)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                iso = format_timestamp(behind + Duration::milliseconds(1));
            }
        }

        self.last = Some(iso.clone());
        iso
    }

    /// The most recently issued stamp, if any.
    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Fast-forward past a stamp observed from another peer.
    ///
    /// Keeps locally issued stamps ahead of everything this session has seen,
    /// so a skewed-back local clock cannot produce writes that always lose.
    pub fn observe(&mut self, seen: &str) {
        match &self.last {
            Some(last) if last.as_str() >= seen => {}
            _ => self.last = Some(seen.to_string()),
        }
    }
}
