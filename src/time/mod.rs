//! Station local-time handling
//!
//! Converts between a station's local clock and UTC. A station either
//! carries a static UTC offset from the legacy hardware timezone table or a
//! named IANA timezone whose DST rules apply per calendar date. The offseter
//! also carries the station's coordinates and sampling interval, which the
//! frame codec needs for its derived-quantity calculations.

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::core::{Error, Result};

/// Legacy hardware timezone table: index 0-46 maps to a static offset in
/// minutes from UTC, -12:00 through +12:00, half-hour zones included.
const TIMEZONE_OFFSET_MINUTES: [i32; 47] = [
    -720, -660, -600, -540, -480, -420, -360, -360, -360, -300, -300, -240, -240, -210, -180,
    -180, -120, -60, 0, 0, 60, 60, 60, 60, 120, 120, 120, 120, 120, 180, 180, 210, 240, 270,
    300, 330, 360, 420, 480, 540, 570, 600, 600, 660, 720, 720, 720,
];

/// Zones for the station's "automatic DST" codes. Only North American and
/// European codes have a DST rule set worth trusting; everything else falls
/// back to the static table.
fn dst_zone_for_code(code: u8) -> Option<Tz> {
    let tz = match code {
        3 => Tz::America__Anchorage,
        4 => Tz::America__Los_Angeles,
        5 => Tz::America__Denver,
        6 => Tz::America__Chicago,
        7 => Tz::America__Mexico_City,
        9 => Tz::America__New_York,
        11 => Tz::America__Halifax,
        13 => Tz::America__St_Johns,
        17 => Tz::Atlantic__Azores,
        18 => Tz::Europe__London,
        20 => Tz::Europe__Paris,
        21 => Tz::Europe__Berlin,
        22 => Tz::Europe__Madrid,
        23 => Tz::Europe__Rome,
        24 => Tz::Europe__Athens,
        25 => Tz::Europe__Helsinki,
        28 => Tz::Europe__Bucharest,
        _ => return None,
    };
    Some(tz)
}

/// How local time maps to UTC for one station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalZone {
    /// Static signed offset from UTC
    Offset(FixedOffset),
    /// Named timezone with DST rules
    Named(Tz),
}

/// Per-station time context: the local-clock mapping plus the geographic
/// and sampling parameters reused by every decode call.
#[derive(Debug, Clone)]
pub struct TimeOffseter {
    zone: LocalZone,
    latitude: f64,
    longitude: f64,
    elevation: i32,
    /// Sampling interval in minutes
    measure_step: u32,
}

impl TimeOffseter {
    fn with_zone(zone: LocalZone) -> Self {
        TimeOffseter {
            zone,
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0,
            measure_step: 10,
        }
    }

    /// Builds an offseter from a static offset in minutes from UTC.
    pub fn from_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(minutes * 60)
            .ok_or_else(|| Error::config(format!("offset {minutes} minutes out of range")))?;
        Ok(Self::with_zone(LocalZone::Offset(offset)))
    }

    /// Builds an offseter from a named IANA timezone.
    pub fn from_named_zone(tz: Tz) -> Self {
        Self::with_zone(LocalZone::Named(tz))
    }

    /// Maps a station-reported fixed timezone index through the legacy
    /// hardware table.
    pub fn from_timezone_index(index: u8) -> Result<Self> {
        let minutes = TIMEZONE_OFFSET_MINUTES
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::config(format!("timezone index {index} out of table")))?;
        Self::from_offset_minutes(minutes)
    }

    /// Maps a station-reported automatic-DST code to a named timezone.
    ///
    /// An unmapped code is a configuration problem, not a session-fatal one:
    /// the offseter degrades to the static offset for that index and the
    /// error is handed back alongside it for the caller to log.
    pub fn from_dst_code(code: u8) -> (Result<Self>, Option<Error>) {
        if let Some(tz) = dst_zone_for_code(code) {
            return (Ok(Self::from_named_zone(tz)), None);
        }
        warn!(code, "no DST zone mapped for code, using static offset");
        let reported = Error::config(format!("automatic DST code {code} has no mapped timezone"));
        (Self::from_timezone_index(code), Some(reported))
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn elevation(&self) -> i32 {
        self.elevation
    }

    pub fn measure_step(&self) -> u32 {
        self.measure_step
    }

    /// Sets the station's position: latitude/longitude in degrees, elevation
    /// in meters.
    pub fn set_coordinates(&mut self, latitude: f64, longitude: f64, elevation: i32) {
        self.latitude = latitude;
        self.longitude = longitude;
        self.elevation = elevation;
    }

    /// Sets the sampling interval in minutes.
    pub fn set_measure_step(&mut self, minutes: u32) {
        self.measure_step = minutes.max(1);
    }

    /// Converts station-local calendar fields to UTC.
    pub fn convert_local_to_utc(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    ) -> Result<DateTime<Utc>> {
        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .ok_or_else(|| {
                Error::protocol(format!(
                    "invalid local time {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}"
                ))
            })?;
        Ok(self.resolve_local(naive))
    }

    /// Converts a station-local naive timestamp to UTC.
    pub fn convert_local_datetime_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.resolve_local(local)
    }

    /// Converts a UTC instant to station-local time.
    pub fn convert_utc_to_local(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        match self.zone {
            LocalZone::Offset(offset) => utc.with_timezone(&offset).naive_local(),
            LocalZone::Named(tz) => utc.with_timezone(&tz).naive_local(),
        }
    }

    /// Resolves a local wall-clock time to a single UTC instant.
    ///
    /// Ambiguous times (fall-back transition) resolve to the later UTC
    /// instant. Non-existent times (spring-forward gap) are advanced one
    /// hour into the post-transition mapping. Never panics.
    fn resolve_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.zone {
            LocalZone::Offset(offset) => {
                Utc.from_utc_datetime(&(naive - offset))
            }
            LocalZone::Named(tz) => match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => dt.with_timezone(&Utc),
                LocalResult::Ambiguous(_, later) => later.with_timezone(&Utc),
                LocalResult::None => {
                    let shifted = naive + chrono::Duration::hours(1);
                    match tz.from_local_datetime(&shifted) {
                        LocalResult::Single(dt) => dt.with_timezone(&Utc),
                        LocalResult::Ambiguous(_, later) => later.with_timezone(&Utc),
                        // Transitions wider than an hour do not occur in the
                        // mapped zones; treat the wall clock as already UTC
                        LocalResult::None => Utc.from_utc_datetime(&naive),
                    }
                }
            },
        }
    }
}
