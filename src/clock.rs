//! Timezone-aware timestamp service.
//!
//! Every human-facing timestamp (artifact names, detection logs) comes from
//! a [`Clock`]. The clock remembers the local zone and re-reads it on a poll
//! interval, so a zone change mid-run shows up in subsequent timestamps
//! without a restart. The underlying instant is always read from UTC, so a
//! zone change only changes the rendered offset, never the instant itself.

use crate::config::SharedSettings;
use crate::shutdown::Shutdown;
use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// A local timezone, either a named IANA zone or a bare UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    pub fn utc() -> Self {
        Zone::Named(Tz::UTC)
    }

    /// Offset in effect at the given instant (named zones follow DST).
    pub fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        match self {
            Zone::Named(tz) => tz.offset_from_utc_datetime(&instant.naive_utc()).fix(),
            Zone::Fixed(offset) => *offset,
        }
    }

    /// Short label for the zone at the given instant, e.g. `CEST` or `+02:00`.
    pub fn abbreviation_at(&self, instant: DateTime<Utc>) -> String {
        match self {
            Zone::Named(tz) => instant.with_timezone(tz).format("%Z").to_string(),
            Zone::Fixed(offset) => offset.to_string(),
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Zone::Named(tz) => write!(f, "{}", tz.name()),
            Zone::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

/// A point in time rendered in the zone that was current when it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub local: DateTime<FixedOffset>,
    pub zone: String,
}

impl Timestamp {
    pub fn utc(&self) -> DateTime<Utc> {
        self.local.with_timezone(&Utc)
    }

    /// Compact form used in artifact file names.
    pub fn file_stamp(&self) -> String {
        self.local.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Human-readable form used in detection logs.
    pub fn log_stamp(&self) -> String {
        format!("{} {}", self.local.format("%Y-%m-%d %H-%M-%S"), self.zone)
    }
}

/// Where the clock learns the current local zone from.
pub trait ZoneSource: Send + Sync {
    fn current_zone(&self) -> Zone;
}

/// Reads the zone the operating system is configured with.
///
/// Resolution order: `TZ`, `/etc/timezone`, the `/etc/localtime` symlink,
/// then the bare offset chrono reports for `Local`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemZone;

impl SystemZone {
    fn from_env() -> Option<Zone> {
        let raw = std::env::var("TZ").ok()?;
        parse_zone_name(raw.trim_start_matches(':'))
    }

    fn from_timezone_file(path: &Path) -> Option<Zone> {
        let raw = std::fs::read_to_string(path).ok()?;
        parse_zone_name(raw.trim())
    }

    fn from_localtime_link(path: &Path) -> Option<Zone> {
        let target = std::fs::read_link(path).ok()?;
        let target = target.to_string_lossy();
        let (_, name) = target.split_once("zoneinfo/")?;
        parse_zone_name(name)
    }
}

impl ZoneSource for SystemZone {
    fn current_zone(&self) -> Zone {
        Self::from_env()
            .or_else(|| Self::from_timezone_file(Path::new("/etc/timezone")))
            .or_else(|| Self::from_localtime_link(Path::new("/etc/localtime")))
            .unwrap_or_else(|| Zone::Fixed(Local::now().offset().fix()))
    }
}

fn parse_zone_name(name: &str) -> Option<Zone> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    name.parse::<Tz>().ok().map(Zone::Named)
}

/// The timestamp service.
pub struct Clock {
    zone: RwLock<Zone>,
    source: Box<dyn ZoneSource>,
}

/// Clock shared across tasks.
pub type SharedClock = Arc<Clock>;

impl Clock {
    pub fn new(source: impl ZoneSource + 'static) -> Self {
        let zone = source.current_zone();
        Self {
            zone: RwLock::new(zone),
            source: Box::new(source),
        }
    }

    /// Clock following the operating system zone.
    pub fn system() -> Self {
        Self::new(SystemZone)
    }

    /// Current instant in the current zone.
    pub fn now(&self) -> Timestamp {
        self.localize(Utc::now())
    }

    /// Current instant in UTC, for event ordering and arithmetic.
    pub fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Render an instant in the current zone.
    pub fn localize(&self, instant: DateTime<Utc>) -> Timestamp {
        let zone = self.zone();
        Timestamp {
            local: instant.with_timezone(&zone.offset_at(instant)),
            zone: zone.abbreviation_at(instant),
        }
    }

    pub fn zone(&self) -> Zone {
        match self.zone.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Re-read the zone from the source. Returns the new zone if it changed.
    pub fn refresh(&self) -> Option<Zone> {
        let current = self.source.current_zone();
        let mut guard = match self.zone.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == current {
            return None;
        }
        *guard = current;
        Some(current)
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("zone", &self.zone()).finish()
    }
}

/// Poll the zone source until shutdown, using the interval from the current
/// settings snapshot on every cycle.
pub async fn watch_timezone(clock: SharedClock, settings: SharedSettings, mut shutdown: Shutdown) {
    tracing::debug!(zone = %clock.zone(), "timezone watch started");
    loop {
        let interval = settings.current().timezone_poll_interval;
        if !shutdown.sleep(interval).await {
            break;
        }
        if let Some(zone) = clock.refresh() {
            tracing::info!(zone = %zone, "timezone changed");
        }
    }
    tracing::debug!("timezone watch stopped");
}
