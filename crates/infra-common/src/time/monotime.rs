//! Monotonic timestamps with a smoothed wall-clock companion
//!
//! Every [`MonoTime`] carries two readings taken together: a monotonic one,
//! used for all arithmetic and ordering, and a real-time one, used only for
//! presentation (logs, CDR-like timestamps).
//!
//! The real-time part is not read straight from the system clock. A
//! process-wide filter keeps an exponential moving average of
//! `realtime - monotonic` and every new timestamp reports
//! `monotonic + filtered offset`. A wall-clock step (NTP slew, manual change)
//! therefore bleeds into reported times gradually instead of producing
//! timestamps that jump backwards.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::types::{Error, Result};

/// Weight given to the previous offset estimate on every sample
const FILTER_FACTOR: f64 = 0.99;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

static CLOCK: Lazy<Mutex<ClockFilter>> = Lazy::new(|| {
    Mutex::new(ClockFilter {
        max_mono: Duration::ZERO,
        offset: None,
    })
});

struct ClockFilter {
    max_mono: Duration,
    offset: Option<f64>,
}

impl ClockFilter {
    fn sample(&mut self, mono: Duration, realt: Duration) -> (Duration, f64) {
        if mono > self.max_mono {
            self.max_mono = mono;
        }
        let sample = realt.as_secs_f64() - self.max_mono.as_secs_f64();
        let offset = match self.offset {
            Some(prev) => prev * FILTER_FACTOR + sample * (1.0 - FILTER_FACTOR),
            None => sample,
        };
        self.offset = Some(offset);
        (self.max_mono, offset)
    }
}

fn read_realtime() -> Result<Duration> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Clock(format!("system clock before epoch: {}", e)))
}

fn read_monotonic() -> Duration {
    Instant::now().saturating_duration_since(*ANCHOR)
}

/// Monotonic timestamp plus its filtered wall-clock reading
#[derive(Clone, Copy, Debug)]
pub struct MonoTime {
    mono: Duration,
    realt: Duration,
}

impl MonoTime {
    /// Take a new timestamp.
    ///
    /// Feeds the process-wide offset filter. Fails only when the system clock
    /// cannot be read.
    pub fn now() -> Result<Self> {
        let realt = read_realtime()?;
        let mono = read_monotonic();
        let (mono, offset) = CLOCK.lock().sample(mono, realt);
        Ok(MonoTime {
            mono,
            realt: Self::apply_offset(mono, offset),
        })
    }

    /// Build a timestamp for a monotonic reading, using the current filtered
    /// offset for its wall-clock part
    pub fn from_monotonic(mono: Duration) -> Result<Self> {
        let offset = match CLOCK.lock().offset {
            Some(offset) => offset,
            None => read_realtime()?.as_secs_f64() - read_monotonic().as_secs_f64(),
        };
        Ok(MonoTime {
            mono,
            realt: Self::apply_offset(mono, offset),
        })
    }

    fn apply_offset(mono: Duration, offset: f64) -> Duration {
        Duration::try_from_secs_f64(mono.as_secs_f64() + offset).unwrap_or(Duration::ZERO)
    }

    /// Monotonic component, relative to a process-wide anchor
    pub fn monotonic(&self) -> Duration {
        self.mono
    }

    /// Filtered wall-clock component, relative to the Unix epoch
    pub fn realtime(&self) -> Duration {
        self.realt
    }

    /// Wall-clock component as a calendar time
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.realt.as_secs() as i64, self.realt.subsec_nanos())
            .unwrap_or_default()
    }

    /// Monotonic instant this timestamp corresponds to
    pub fn instant(&self) -> Instant {
        *ANCHOR + self.mono
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later
    pub fn since(&self, earlier: &MonoTime) -> Duration {
        self.mono.saturating_sub(earlier.mono)
    }

    /// Time from now until `self`, zero if already passed
    pub fn until_now(&self) -> Duration {
        self.mono.saturating_sub(read_monotonic())
    }

    pub fn after(&self, other: &MonoTime) -> bool {
        self.mono > other.mono
    }

    pub fn before(&self, other: &MonoTime) -> bool {
        self.mono < other.mono
    }
}

impl PartialEq for MonoTime {
    fn eq(&self, other: &Self) -> bool {
        self.mono == other.mono
    }
}

impl Eq for MonoTime {}

impl PartialOrd for MonoTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MonoTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mono.cmp(&other.mono)
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime {
            mono: self.mono + rhs,
            realt: self.realt + rhs,
        }
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, rhs: Duration) -> MonoTime {
        MonoTime {
            mono: self.mono.saturating_sub(rhs),
            realt: self.realt.saturating_sub(rhs),
        }
    }
}

impl Sub<MonoTime> for MonoTime {
    type Output = Duration;

    fn sub(self, rhs: MonoTime) -> Duration {
        self.since(&rhs)
    }
}

impl fmt::Display for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.datetime().format("%H:%M:%S%.3f"))
    }
}
