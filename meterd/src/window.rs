//! Billing windows.
//!
//! Time is partitioned into fixed-width, half-open windows `[start, end)` aligned to the Unix
//! epoch. A window is identified by its `end`: usage is sampled at that instant and the record
//! for the window is stored under it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Invalid window parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window width must be a positive whole number of seconds, got {0:?}")]
    InvalidWidth(Duration),

    #[error("lookback must be at least one window")]
    InvalidLookback,

    #[error("window boundary out of range for timestamp {0}")]
    OutOfRange(i64),
}

/// A fixed-width, half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build the window of the given width that ends at `end`.
    pub fn ending_at(end: DateTime<Utc>, width: Duration) -> Result<Self, WindowError> {
        let width = width_delta(width)?;
        let start = end
            .checked_sub_signed(width)
            .ok_or(WindowError::OutOfRange(end.timestamp()))?;
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn width(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Whether `instant` falls inside the window (start inclusive, end exclusive).
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Enumerates the most recent settled windows.
///
/// The clock is a pure function of `now`: it truncates `now` down to a multiple of the window
/// width and steps back one window from there, so the newest window offered ends one full width
/// before the current boundary. At `03:07` with hourly windows the newest window ends at `02:00`.
/// The window that closed at `03:00` is offered from `04:00` on. Windows are returned
/// **oldest first**. Calling it again later yields an overlapping, shifted set; overlap is
/// resolved by the dedup gate, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClock {
    width_secs: i64,
    lookback: u32,
}

impl WindowClock {
    pub fn new(width: Duration, lookback: u32) -> Result<Self, WindowError> {
        let width_secs = width_delta(width)?.num_seconds();
        if lookback == 0 {
            return Err(WindowError::InvalidLookback);
        }
        Ok(Self { width_secs, lookback })
    }

    pub fn width(&self) -> Duration {
        Duration::from_secs(self.width_secs as u64)
    }

    pub fn lookback(&self) -> u32 {
        self.lookback
    }

    /// End of the newest window offered at `now`: `truncate(now) - width`.
    pub fn latest_boundary(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, WindowError> {
        let out_of_range = WindowError::OutOfRange(now.timestamp());
        let aligned = now.timestamp().div_euclid(self.width_secs) * self.width_secs;
        let newest_end = aligned.checked_sub(self.width_secs).ok_or(out_of_range.clone())?;
        DateTime::from_timestamp(newest_end, 0).ok_or(out_of_range)
    }

    /// The last `lookback` windows offered at `now`, oldest first.
    pub fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<TimeWindow>, WindowError> {
        let newest_end = self.latest_boundary(now)?.timestamp();

        (0..i64::from(self.lookback))
            .rev()
            .map(|back| {
                let out_of_range = WindowError::OutOfRange(now.timestamp());
                let end = back
                    .checked_mul(self.width_secs)
                    .and_then(|offset| newest_end.checked_sub(offset))
                    .ok_or(out_of_range.clone())?;
                let start = end.checked_sub(self.width_secs).ok_or(out_of_range.clone())?;
                match (DateTime::from_timestamp(start, 0), DateTime::from_timestamp(end, 0)) {
                    (Some(start), Some(end)) => Ok(TimeWindow { start, end }),
                    _ => Err(out_of_range),
                }
            })
            .collect()
    }
}

/// Shorthand for `WindowClock::new(width, lookback)?.enumerate(now)`.
pub fn enumerate(now: DateTime<Utc>, width: Duration, lookback: u32) -> Result<Vec<TimeWindow>, WindowError> {
    WindowClock::new(width, lookback)?.enumerate(now)
}

fn width_delta(width: Duration) -> Result<TimeDelta, WindowError> {
    if width.as_secs() == 0 || width.subsec_nanos() != 0 {
        return Err(WindowError::InvalidWidth(width));
    }
    i64::try_from(width.as_secs())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or(WindowError::InvalidWidth(width))
}
