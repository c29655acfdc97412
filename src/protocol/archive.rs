//! Archive record and page decoding
//!
//! The station's internal memory is dumped as pages of five fixed-layout
//! 52-byte records behind a page-level CRC-16. Records carry a bit-packed
//! local calendar stamp which the time offseter turns into UTC, and an
//! all-0xFF record is a "not written yet" placeholder that must never be
//! decoded or stored. The reader filters each page against the station's
//! archive watermark.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::frame::crc_valid;
use crate::core::types::convert;
use crate::core::{Error, Observation, Result, ARCHIVE_PAGE_SIZE, ARCHIVE_RECORD_SIZE, RECORDS_PER_PAGE};
use crate::time::TimeOffseter;
use crate::wxmath;

/// Clock skew tolerated before a record is considered to come from the
/// future and dropped
const FUTURE_TOLERANCE_MINUTES: i64 = 10;

fn u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn i16_le(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn opt_u8(buf: &[u8], offset: usize) -> Option<u8> {
    match buf[offset] {
        0xFF => None,
        v => Some(v),
    }
}

/// One archive record, validated for length but not yet for relevance.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    bytes: [u8; ARCHIVE_RECORD_SIZE],
}

impl ArchiveRecord {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ARCHIVE_RECORD_SIZE {
            return Err(Error::MalformedLength {
                expected: ARCHIVE_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let mut copy = [0u8; ARCHIVE_RECORD_SIZE];
        copy.copy_from_slice(&bytes[..ARCHIVE_RECORD_SIZE]);
        Ok(ArchiveRecord { bytes: copy })
    }

    /// A slot the station has not written yet reads as all 0xFF.
    pub fn is_placeholder(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0xFF)
    }

    /// Bit-packed local calendar date: day in the low five bits, month in
    /// the next four, year-since-2000 in the top seven.
    pub fn local_date(&self) -> (i32, u32, u32) {
        let raw = u16_le(&self.bytes, 0);
        let day = (raw & 0x1F) as u32;
        let month = ((raw >> 5) & 0x0F) as u32;
        let year = (raw >> 9) as i32 + 2000;
        (year, month, day)
    }

    /// Local time of day packed as hour*100 + minute.
    pub fn local_time(&self) -> (u32, u32) {
        let raw = u16_le(&self.bytes, 2) as u32;
        (raw / 100, raw % 100)
    }

    /// UTC timestamp of the record via the station's local-clock mapping.
    pub fn timestamp_utc(&self, offseter: &TimeOffseter) -> Result<DateTime<Utc>> {
        let (year, month, day) = self.local_date();
        let (hour, minute) = self.local_time();
        offseter.convert_local_to_utc(year, month, day, hour, minute)
    }

    pub fn outside_temperature(&self) -> Option<f64> {
        match i16_le(&self.bytes, 4) {
            0x7FFF => None,
            raw => Some(convert::from_fahrenheit(raw as f64 / 10.0)),
        }
    }

    pub fn max_outside_temperature(&self) -> Option<f64> {
        match i16_le(&self.bytes, 6) {
            i16::MIN => None,
            raw => Some(convert::from_fahrenheit(raw as f64 / 10.0)),
        }
    }

    pub fn min_outside_temperature(&self) -> Option<f64> {
        match i16_le(&self.bytes, 8) {
            0x7FFF => None,
            raw => Some(convert::from_fahrenheit(raw as f64 / 10.0)),
        }
    }

    /// Rainfall over the archive interval in mm; raw collector clicks
    pub fn rainfall(&self) -> Option<f64> {
        Some(convert::from_rain_clicks(u16_le(&self.bytes, 10) as f64))
    }

    pub fn rain_rate(&self) -> Option<f64> {
        match u16_le(&self.bytes, 12) {
            0xFFFF => None,
            raw => Some(convert::from_rain_clicks(raw as f64)),
        }
    }

    pub fn barometer(&self) -> Option<f64> {
        match u16_le(&self.bytes, 14) {
            0 => None,
            raw => Some(convert::from_in_hg_thousandths(raw as f64)),
        }
    }

    pub fn solar_radiation(&self) -> Option<i32> {
        match i16_le(&self.bytes, 16) {
            0x7FFF => None,
            raw => Some(raw as i32),
        }
    }

    pub fn inside_temperature(&self) -> Option<f64> {
        match i16_le(&self.bytes, 20) {
            0x7FFF => None,
            raw => Some(convert::from_fahrenheit(raw as f64 / 10.0)),
        }
    }

    pub fn inside_humidity(&self) -> Option<i32> {
        opt_u8(&self.bytes, 22).map(i32::from)
    }

    pub fn outside_humidity(&self) -> Option<i32> {
        opt_u8(&self.bytes, 23).map(i32::from)
    }

    /// Average wind over the interval in km/h; raw mph, sentinel 0xFF
    pub fn wind_speed(&self) -> Option<f64> {
        opt_u8(&self.bytes, 24).map(|mph| convert::from_mph(mph as f64))
    }

    /// Highest gust over the interval in km/h
    pub fn wind_gust(&self) -> Option<f64> {
        opt_u8(&self.bytes, 25).map(|mph| convert::from_mph(mph as f64))
    }

    /// Prevailing wind direction; raw sixteenths of a turn, sentinel 0xFF
    pub fn wind_direction(&self) -> Option<i32> {
        match self.bytes[27] {
            code if code < 16 => Some((code as f64 * 22.5).round() as i32),
            _ => None,
        }
    }

    pub fn uv_index(&self) -> Option<f64> {
        opt_u8(&self.bytes, 28).map(|raw| raw as f64 / 10.0)
    }

    /// Measured evapotranspiration in mm; raw thousandths of an inch,
    /// 0 means "not measured"
    pub fn evapotranspiration(&self) -> Option<f64> {
        match self.bytes[29] {
            0 => None,
            raw => Some(convert::from_in_thousandths(raw as f64)),
        }
    }

    pub fn extra_humidity(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 2);
        opt_u8(&self.bytes, 43 + index).map(i32::from)
    }

    pub fn extra_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 3);
        opt_u8(&self.bytes, 45 + index).map(|raw| convert::from_fahrenheit(raw as f64 - 90.0))
    }

    pub fn leaf_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 2);
        opt_u8(&self.bytes, 34 + index).map(|raw| convert::from_fahrenheit(raw as f64 - 90.0))
    }

    pub fn leaf_wetness(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 2);
        match self.bytes[36 + index] {
            v if v > 15 => None,
            v => Some(i32::from(v)),
        }
    }

    pub fn soil_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 4);
        opt_u8(&self.bytes, 38 + index).map(|raw| convert::from_fahrenheit(raw as f64 - 90.0))
    }

    pub fn soil_moisture(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 4);
        opt_u8(&self.bytes, 48 + index).map(i32::from)
    }

    /// Decodes the record into a normalized observation, deriving the
    /// quantities the station left out.
    pub fn to_observation(&self, station: Uuid, offseter: &TimeOffseter) -> Result<Observation> {
        let time = self.timestamp_utc(offseter)?;
        let mut obs = Observation::new(station, time);

        obs.outside_temperature = self.outside_temperature();
        obs.min_outside_temperature = self.min_outside_temperature();
        obs.max_outside_temperature = self.max_outside_temperature();
        obs.inside_temperature = self.inside_temperature();
        obs.inside_humidity = self.inside_humidity();
        obs.outside_humidity = self.outside_humidity();
        obs.barometer = self.barometer();
        obs.rainfall = self.rainfall();
        obs.rain_rate = self.rain_rate();
        obs.solar_radiation = self.solar_radiation();
        obs.uv_index = self.uv_index();
        obs.wind_speed = self.wind_speed();
        obs.wind_gust = self.wind_gust();
        obs.wind_direction = self.wind_direction();

        let temp = obs.outside_temperature;
        let hum = obs.outside_humidity.map(f64::from);
        let wind = obs.wind_speed;

        obs.dew_point = match (temp, hum) {
            (Some(t), Some(h)) => Some(wxmath::dew_point(t, h)),
            _ => None,
        };
        obs.heat_index = match (temp, hum) {
            (Some(t), Some(h)) => Some(wxmath::heat_index(t, h)),
            _ => None,
        };
        obs.wind_chill = match (temp, wind) {
            (Some(t), Some(w)) => Some(wxmath::wind_chill(t, w)),
            _ => None,
        };
        obs.thsw_index = match (temp, hum, wind) {
            (Some(t), Some(h), Some(w)) => Some(match obs.solar_radiation {
                Some(solar) => wxmath::thsw_radiation(t, h, w, solar as f64),
                None => wxmath::thsw(t, h, w),
            }),
            _ => None,
        };

        obs.evapotranspiration = self.evapotranspiration().or_else(|| {
            match (temp, hum, wind, obs.solar_radiation) {
                (Some(t), Some(h), Some(w), Some(solar)) => Some(wxmath::evapotranspiration(
                    t,
                    h,
                    w,
                    solar as f64,
                    offseter.latitude(),
                    offseter.longitude(),
                    offseter.elevation() as f64,
                    time,
                    offseter.measure_step(),
                )),
                _ => None,
            }
        });
        obs.insolation_time = obs.solar_radiation.map(|solar| {
            if wxmath::is_sunny(solar as f64, offseter.latitude(), offseter.longitude(), time) {
                offseter.measure_step() as i32
            } else {
                0
            }
        });

        for i in 0..3 {
            obs.extra_temperatures[i] = self.extra_temperature(i);
        }
        for i in 0..2 {
            obs.extra_humidities[i] = self.extra_humidity(i);
            obs.leaf_temperatures[i] = self.leaf_temperature(i);
            obs.leaf_wetnesses[i] = self.leaf_wetness(i);
        }
        for i in 0..4 {
            obs.soil_temperatures[i] = self.soil_temperature(i);
            obs.soil_moistures[i] = self.soil_moisture(i);
        }
        Ok(obs)
    }
}

/// One wire page: sequence byte, five records, four unused bytes and a
/// page-level CRC.
#[derive(Debug, Clone)]
pub struct ArchivePage {
    sequence: u8,
    records: Vec<ArchiveRecord>,
}

impl ArchivePage {
    /// Whole-page CRC check without decoding anything.
    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() == ARCHIVE_PAGE_SIZE && crc_valid(bytes)
    }

    /// Parses a page. A failed CRC rejects the page in full; no record in
    /// it is trusted, however plausible it looks.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ARCHIVE_PAGE_SIZE {
            return Err(Error::MalformedLength {
                expected: ARCHIVE_PAGE_SIZE,
                actual: bytes.len(),
            });
        }
        let bytes = &bytes[..ARCHIVE_PAGE_SIZE];
        if !crc_valid(bytes) {
            return Err(Error::ChecksumInvalid);
        }
        let mut records = Vec::with_capacity(RECORDS_PER_PAGE);
        for i in 0..RECORDS_PER_PAGE {
            let start = 1 + i * ARCHIVE_RECORD_SIZE;
            records.push(ArchiveRecord::from_bytes(&bytes[start..start + ARCHIVE_RECORD_SIZE])?);
        }
        Ok(ArchivePage {
            sequence: bytes[0],
            records,
        })
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    /// Whether a record should be stored: not a placeholder, strictly newer
    /// than the watermark, and not from the future beyond a small skew
    /// tolerance. Irrelevant records are dropped, not errors.
    pub fn is_record_relevant(
        record: &ArchiveRecord,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        offseter: &TimeOffseter,
    ) -> bool {
        if record.is_placeholder() {
            return false;
        }
        let time = match record.timestamp_utc(offseter) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "archive record carries an undecodable timestamp");
                return false;
            }
        };
        time > since && time <= now + Duration::minutes(FUTURE_TOLERANCE_MINUTES)
    }

    /// Decodes the records newer than `since`, in index order, and returns
    /// them with the advanced watermark. The watermark never regresses.
    pub fn extract_new_records(
        &self,
        station: Uuid,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        offseter: &TimeOffseter,
    ) -> (Vec<Observation>, DateTime<Utc>) {
        let mut observations = Vec::new();
        let mut watermark = since;
        for record in &self.records {
            if !Self::is_record_relevant(record, since, now, offseter) {
                continue;
            }
            match record.to_observation(station, offseter) {
                Ok(obs) => {
                    if obs.time > watermark {
                        watermark = obs.time;
                    }
                    observations.push(obs);
                }
                Err(e) => warn!(error = %e, "skipping undecodable archive record"),
            }
        }
        debug!(
            sequence = self.sequence,
            accepted = observations.len(),
            "archive page processed"
        );
        (observations, watermark)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;

    fn offseter() -> TimeOffseter {
        TimeOffseter::from_offset_minutes(60).unwrap()
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_record_date_packing_round_trip() {
        let bytes = record_bytes(2024, 5, 10, 14, 35, 200, 50);
        let record = ArchiveRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.local_date(), (2024, 5, 10));
        assert_eq!(record.local_time(), (14, 35));
        // local 14:35 at UTC+1 is 13:35Z
        let time = record.timestamp_utc(&offseter()).unwrap();
        assert_eq!(time, utc(13, 35));
    }

    #[test]
    fn test_placeholder_never_decodes() {
        let record = ArchiveRecord::from_bytes(&placeholder_record()).unwrap();
        assert!(record.is_placeholder());
        assert!(!ArchivePage::is_record_relevant(
            &record,
            utc(0, 0),
            utc(23, 0),
            &offseter()
        ));
    }

    #[test]
    fn test_record_sentinels_and_conversion() {
        let bytes = record_bytes(2024, 5, 10, 14, 0, 200, 0xFF);
        let record = ArchiveRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.outside_humidity(), None);
        assert_eq!(record.max_outside_temperature(), None);
        assert_eq!(record.min_outside_temperature(), None);
        assert_eq!(record.barometer(), None);
        assert_eq!(record.solar_radiation(), None);
        let temp = record.outside_temperature().unwrap();
        assert!((temp - (-6.67)).abs() < 0.01);
    }

    #[test]
    fn test_corrupt_page_yields_nothing() {
        let records = [
            record_bytes(2024, 5, 10, 10, 0, 200, 50),
            record_bytes(2024, 5, 10, 10, 5, 201, 50),
            placeholder_record(),
            placeholder_record(),
            placeholder_record(),
        ];
        let mut bytes = page_bytes(0, records);
        bytes[30] ^= 0x10;
        assert!(!ArchivePage::is_valid(&bytes));
        assert!(matches!(
            ArchivePage::parse(&bytes),
            Err(Error::ChecksumInvalid)
        ));
    }

    #[test]
    fn test_extract_filters_placeholders_and_old_records() {
        let records = [
            record_bytes(2024, 5, 10, 10, 0, 200, 50), // at watermark: dropped
            record_bytes(2024, 5, 10, 10, 5, 205, 51),
            record_bytes(2024, 5, 10, 10, 10, 210, 52),
            placeholder_record(),
            placeholder_record(),
        ];
        let page = ArchivePage::parse(&page_bytes(3, records)).unwrap();
        // records are local UTC+1, so 10:00 local is 09:00Z
        let since = utc(9, 0);
        let now = utc(12, 0);
        let (observations, watermark) =
            page.extract_new_records(Uuid::nil(), since, now, &offseter());
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].time, utc(9, 5));
        assert_eq!(observations[1].time, utc(9, 10));
        assert_eq!(watermark, utc(9, 10));
    }

    #[test]
    fn test_future_records_are_dropped_not_stored() {
        let records = [
            record_bytes(2024, 5, 10, 10, 5, 205, 51),
            record_bytes(2024, 5, 10, 18, 0, 210, 52), // hours ahead of now
            placeholder_record(),
            placeholder_record(),
            placeholder_record(),
        ];
        let page = ArchivePage::parse(&page_bytes(0, records)).unwrap();
        let (observations, watermark) =
            page.extract_new_records(Uuid::nil(), utc(9, 0), utc(9, 30), &offseter());
        assert_eq!(observations.len(), 1);
        assert_eq!(watermark, utc(9, 5));
    }

    #[test]
    fn test_watermark_never_regresses() {
        let records = [
            record_bytes(2024, 5, 10, 8, 0, 205, 51), // older than watermark
            placeholder_record(),
            placeholder_record(),
            placeholder_record(),
            placeholder_record(),
        ];
        let page = ArchivePage::parse(&page_bytes(0, records)).unwrap();
        let since = utc(10, 0);
        let (observations, watermark) =
            page.extract_new_records(Uuid::nil(), since, utc(11, 0), &offseter());
        assert!(observations.is_empty());
        assert_eq!(watermark, since);
    }

    #[test]
    fn test_watermark_monotonic_across_pages() {
        let offseter = offseter();
        let mut since = utc(8, 0);
        for (h, m) in [(9u32, 0u32), (9, 30), (10, 0)] {
            let records = [
                record_bytes(2024, 5, 10, h, m, 200, 50),
                placeholder_record(),
                placeholder_record(),
                placeholder_record(),
                placeholder_record(),
            ];
            let page = ArchivePage::parse(&page_bytes(0, records)).unwrap();
            let (observations, watermark) =
                page.extract_new_records(Uuid::nil(), since, utc(23, 0), &offseter);
            for obs in &observations {
                assert!(obs.time > since);
            }
            assert!(watermark >= since);
            since = watermark;
        }
        assert_eq!(since, utc(9, 0)); // 10:00 local at UTC+1
    }

    #[test]
    fn test_record_derives_et_and_insolation_with_full_sensors() {
        let mut bytes = record_bytes(2024, 6, 21, 13, 0, 750, 50);
        bytes[16..18].copy_from_slice(&800i16.to_le_bytes()); // solar
        bytes[24] = 8; // avg wind 8 mph
        let record = ArchiveRecord::from_bytes(&bytes).unwrap();
        let mut ctx = TimeOffseter::from_offset_minutes(0).unwrap();
        ctx.set_coordinates(45.0, 0.0, 100);
        ctx.set_measure_step(30);
        let obs = record.to_observation(Uuid::nil(), &ctx).unwrap();
        assert!(obs.evapotranspiration.is_some());
        assert_eq!(obs.insolation_time, Some(30));
    }
}
