//! Clock abstraction
//!
//! Weekday conditions, cron next-fire computation and voice response
//! templates all read the wall clock through this trait so they can be
//! tested without real waits.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current time in the given timezone
    fn now_in(&self, tz: Tz) -> DateTime<Tz> {
        self.now_utc().with_timezone(&tz)
    }
}

/// Real wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Pin the clock to a local wall time in the given timezone
    #[must_use]
    pub fn at(tz: Tz, year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        let local = tz
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("unambiguous local time");
        Self(local.with_timezone(&Utc))
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}
