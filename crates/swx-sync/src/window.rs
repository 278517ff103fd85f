//! Fetch window planning.

use chrono::{DateTime, Duration, Utc};
use swx_core::FetchWindow;

pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

/// Computes the calendar-date range requested each cycle.
///
/// The window always ends on today's UTC date and reaches back `lookback`
/// days, so consecutive cycles overlap whenever the lookback is wider than
/// the poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlanner {
    lookback: Duration,
}

impl WindowPlanner {
    pub fn new(lookback_days: u32) -> Self {
        Self {
            lookback: Duration::days(i64::from(lookback_days)),
        }
    }

    pub fn plan(&self, now: DateTime<Utc>) -> FetchWindow {
        let start = now
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        FetchWindow {
            start: start.date_naive(),
            end: now.date_naive(),
        }
    }
}

impl Default for WindowPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_DAYS)
    }
}
