//! Live frame decoding
//!
//! The station answers a live poll with two fixed-layout 99-byte sub-frames
//! ("frame A" and "frame B"), each carrying its own trailing CRC-16. Multi-
//! byte integers are little-endian; the CRC is big-endian. Every sensor
//! field has a per-field "missing" sentinel which decodes to `None` before
//! any unit conversion happens.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::types::convert;
use crate::core::{Error, Observation, Result, LIVE_FRAME_SIZE};
use crate::time::TimeOffseter;
use crate::wxmath;

/// CCITT polynomial, no reflection, zero seed
const CRC_POLY: u16 = 0x1021;

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_crc_table();

/// Running CRC-16 over a byte slice, seeded at zero.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        CRC_TABLE[((crc >> 8) ^ byte as u16) as usize] ^ (crc << 8)
    })
}

/// A frame that includes its trailing 2-byte checksum is valid iff the
/// running CRC over the entire frame, checksum included, is zero.
pub fn crc_valid(frame: &[u8]) -> bool {
    frame.len() >= 3 && crc16(frame) == 0
}

/// Writes the checksum of `buf[..len-2]` into the trailing two bytes.
/// Used by test fixtures; production code only ever validates.
pub fn crc_append(buf: &mut [u8]) {
    let len = buf.len();
    debug_assert!(len >= 3);
    let crc = crc16(&buf[..len - 2]);
    buf[len - 2..].copy_from_slice(&crc.to_be_bytes());
}

fn u8_at(frame: &[u8], offset: usize) -> u8 {
    frame[offset]
}

fn u16_le(frame: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([frame[offset], frame[offset + 1]])
}

fn i16_le(frame: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([frame[offset], frame[offset + 1]])
}

/// u8 field whose sentinel is 0xFF
fn opt_u8(frame: &[u8], offset: usize) -> Option<u8> {
    match u8_at(frame, offset) {
        0xFF => None,
        v => Some(v),
    }
}

/// Signed tenths-of-°F field whose sentinel is 0x7FFF, decoded to °C
fn opt_temp_tenths(frame: &[u8], offset: usize) -> Option<f64> {
    match i16_le(frame, offset) {
        0x7FFF => None,
        raw => Some(convert::from_fahrenheit(raw as f64 / 10.0)),
    }
}

/// One-byte temperature with a 90 °F bias (extra/soil/leaf probes)
fn opt_temp_biased(frame: &[u8], offset: usize) -> Option<f64> {
    opt_u8(frame, offset).map(|raw| convert::from_fahrenheit(raw as f64 - 90.0))
}

/// Barometric trend codes reported in frame A, as a read-only table.
pub fn bar_trend_text(code: i8) -> Option<&'static str> {
    match code {
        -60 => Some("falling rapidly"),
        -20 => Some("falling slowly"),
        0 => Some("steady"),
        20 => Some("rising slowly"),
        60 => Some("rising rapidly"),
        _ => None,
    }
}

/// Forecast icon bit combinations reported in frame A.
pub fn forecast_text(icons: u8) -> Option<&'static str> {
    match icons {
        0x08 => Some("sunny"),
        0x06 => Some("partly cloudy"),
        0x02 => Some("mostly cloudy"),
        0x03 => Some("mostly cloudy, rain"),
        0x12 => Some("mostly cloudy, snow"),
        0x13 => Some("mostly cloudy, rain or snow"),
        0x07 => Some("partly cloudy, rain"),
        0x16 => Some("partly cloudy, snow"),
        0x17 => Some("partly cloudy, rain or snow"),
        _ => None,
    }
}

/// A validated pair of live sub-frames with typed accessors.
#[derive(Debug, Clone)]
pub struct LiveFrames {
    a: Vec<u8>,
    b: Vec<u8>,
}

impl LiveFrames {
    /// Validates and wraps the two sub-frames. Both must carry the right
    /// length, marker, packet type and an intact CRC before any field is
    /// trusted.
    pub fn decode(frame_a: &[u8], frame_b: &[u8]) -> Result<Self> {
        for frame in [frame_a, frame_b] {
            if frame.len() < LIVE_FRAME_SIZE {
                return Err(Error::MalformedLength {
                    expected: LIVE_FRAME_SIZE,
                    actual: frame.len(),
                });
            }
            if !crc_valid(&frame[..LIVE_FRAME_SIZE]) {
                return Err(Error::ChecksumInvalid);
            }
            if &frame[..3] != b"LOO" {
                return Err(Error::protocol("live frame marker missing"));
            }
        }
        if frame_a[4] != 0 {
            return Err(Error::protocol(format!(
                "frame A has packet type {}, expected 0",
                frame_a[4]
            )));
        }
        if frame_b[4] != 1 {
            return Err(Error::protocol(format!(
                "frame B has packet type {}, expected 1",
                frame_b[4]
            )));
        }
        Ok(LiveFrames {
            a: frame_a[..LIVE_FRAME_SIZE].to_vec(),
            b: frame_b[..LIVE_FRAME_SIZE].to_vec(),
        })
    }

    /// Barometric trend code (frame A byte 3)
    pub fn bar_trend(&self) -> i8 {
        self.a[3] as i8
    }

    /// Forecast icon bits (frame A byte 89)
    pub fn forecast_icons(&self) -> u8 {
        self.a[89]
    }

    /// Atmospheric pressure in bar; raw thousandths of inHg, sentinel 0
    pub fn barometer(&self) -> Option<f64> {
        match u16_le(&self.a, 7) {
            0 => None,
            raw => Some(convert::from_in_hg_thousandths(raw as f64)),
        }
    }

    pub fn inside_temperature(&self) -> Option<f64> {
        opt_temp_tenths(&self.a, 9)
    }

    pub fn inside_humidity(&self) -> Option<i32> {
        opt_u8(&self.a, 11).map(i32::from)
    }

    pub fn outside_temperature(&self) -> Option<f64> {
        opt_temp_tenths(&self.a, 12)
    }

    pub fn outside_humidity(&self) -> Option<i32> {
        opt_u8(&self.a, 33).map(i32::from)
    }

    /// Wind speed in km/h; raw mph, sentinel 0xFF
    pub fn wind_speed(&self) -> Option<f64> {
        opt_u8(&self.a, 14).map(|mph| convert::from_mph(mph as f64))
    }

    /// Wind direction in degrees; 0 means no data, 1-360 otherwise
    pub fn wind_direction(&self) -> Option<i32> {
        match u16_le(&self.a, 16) {
            0 => None,
            dir if dir <= 360 => Some(dir as i32),
            _ => None,
        }
    }

    /// Ten-minute wind gust in km/h (frame B); raw mph, sentinel 0xFFFF
    pub fn wind_gust(&self) -> Option<f64> {
        match u16_le(&self.b, 22) {
            0xFFFF => None,
            raw => Some(convert::from_mph(raw as f64)),
        }
    }

    /// Rain rate in mm/h; raw collector clicks per hour, sentinel 0xFFFF
    pub fn rain_rate(&self) -> Option<f64> {
        match u16_le(&self.a, 41) {
            0xFFFF => None,
            raw => Some(convert::from_rain_clicks(raw as f64)),
        }
    }

    /// Solar radiation in W/m²; sentinel 0x7FFF
    pub fn solar_radiation(&self) -> Option<i32> {
        match i16_le(&self.a, 44) {
            0x7FFF => None,
            raw => Some(raw as i32),
        }
    }

    /// UV index; raw tenths, sentinel 0xFF
    pub fn uv_index(&self) -> Option<f64> {
        opt_u8(&self.a, 43).map(|raw| raw as f64 / 10.0)
    }

    /// Station-computed dew point in °C (frame B); whole °F, sentinel 255
    pub fn dew_point(&self) -> Option<f64> {
        match i16_le(&self.b, 30) {
            255 => None,
            raw => Some(convert::from_fahrenheit(raw as f64)),
        }
    }

    /// Station-computed heat index in °C (frame B); whole °F, sentinel 255
    pub fn heat_index(&self) -> Option<f64> {
        match i16_le(&self.b, 35) {
            255 => None,
            raw => Some(convert::from_fahrenheit(raw as f64)),
        }
    }

    /// Station-computed wind chill in °C (frame B); whole °F, sentinel 255
    pub fn wind_chill(&self) -> Option<f64> {
        match i16_le(&self.b, 37) {
            255 => None,
            raw => Some(convert::from_fahrenheit(raw as f64)),
        }
    }

    /// Station-computed THSW in °C (frame B); whole °F, sentinel 255
    pub fn thsw_index(&self) -> Option<f64> {
        match i16_le(&self.b, 39) {
            255 => None,
            raw => Some(convert::from_fahrenheit(raw as f64)),
        }
    }

    pub fn extra_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 3);
        opt_temp_biased(&self.a, 18 + index)
    }

    pub fn extra_humidity(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 2);
        opt_u8(&self.a, 34 + index).map(i32::from)
    }

    pub fn soil_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 4);
        opt_temp_biased(&self.a, 25 + index)
    }

    pub fn leaf_temperature(&self, index: usize) -> Option<f64> {
        debug_assert!(index < 2);
        opt_temp_biased(&self.a, 29 + index)
    }

    pub fn soil_moisture(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 4);
        opt_u8(&self.a, 62 + index).map(i32::from)
    }

    pub fn leaf_wetness(&self, index: usize) -> Option<i32> {
        debug_assert!(index < 2);
        match u8_at(&self.a, 66 + index) {
            v if v > 15 => None,
            v => Some(i32::from(v)),
        }
    }

    /// Builds the normalized observation for one live poll.
    ///
    /// Quantities the station dashes out are derived from the fields it did
    /// report, using the standard approximations in `wxmath`. Rainfall and
    /// interval evapotranspiration only exist in archive records and stay
    /// `None` here.
    pub fn to_observation(
        &self,
        station: Uuid,
        time: DateTime<Utc>,
        context: &TimeOffseter,
    ) -> Observation {
        let mut obs = Observation::new(station, time);
        obs.barometer = self.barometer();
        obs.inside_temperature = self.inside_temperature();
        obs.inside_humidity = self.inside_humidity();
        obs.outside_temperature = self.outside_temperature();
        obs.outside_humidity = self.outside_humidity();
        obs.wind_speed = self.wind_speed();
        obs.wind_direction = self.wind_direction();
        obs.wind_gust = self.wind_gust();
        obs.rain_rate = self.rain_rate();
        obs.solar_radiation = self.solar_radiation();
        obs.uv_index = self.uv_index();

        let temp = obs.outside_temperature;
        let hum = obs.outside_humidity.map(f64::from);
        let wind = obs.wind_speed;

        obs.dew_point = self.dew_point().or_else(|| match (temp, hum) {
            (Some(t), Some(h)) => Some(wxmath::dew_point(t, h)),
            _ => None,
        });
        obs.heat_index = self.heat_index().or_else(|| match (temp, hum) {
            (Some(t), Some(h)) => Some(wxmath::heat_index(t, h)),
            _ => None,
        });
        obs.wind_chill = self.wind_chill().or_else(|| match (temp, wind) {
            (Some(t), Some(w)) => Some(wxmath::wind_chill(t, w)),
            _ => None,
        });
        obs.thsw_index = self.thsw_index().or_else(|| match (temp, hum, wind) {
            (Some(t), Some(h), Some(w)) => Some(match obs.solar_radiation {
                Some(solar) => wxmath::thsw_radiation(t, h, w, solar as f64),
                None => wxmath::thsw(t, h, w),
            }),
            _ => None,
        });

        obs.insolation_time = obs.solar_radiation.and_then(|solar| {
            if wxmath::is_sunny(solar as f64, context.latitude(), context.longitude(), time) {
                Some(context.measure_step() as i32)
            } else {
                Some(0)
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
        obs
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_crc_known_value() {
        // CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc_round_trip_all_lengths() {
        for len in 3..64usize {
            let mut buf: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37)).collect();
            crc_append(&mut buf);
            assert!(crc_valid(&buf), "length {len}");
        }
    }

    #[test]
    fn test_crc_detects_single_bit_flip() {
        let mut buf: Vec<u8> = (0..32u8).collect();
        crc_append(&mut buf);
        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut flipped = buf.clone();
                flipped[byte] ^= 1 << bit;
                assert!(!crc_valid(&flipped), "flip at byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let a = empty_frame_a();
        let err = LiveFrames::decode(&a[..50], &a).unwrap_err();
        assert!(matches!(err, Error::MalformedLength { expected: 99, .. }));
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut a = empty_frame_a();
        let b = empty_frame_b();
        a[12] ^= 0x01;
        let err = LiveFrames::decode(&a, &b).unwrap_err();
        assert!(matches!(err, Error::ChecksumInvalid));
    }

    #[test]
    fn test_decode_rejects_wrong_packet_type() {
        let a = empty_frame_a();
        // frame A passed twice: second should fail the type check
        let err = LiveFrames::decode(&a, &a).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_sentinels_decode_to_none() {
        let frames = LiveFrames::decode(&empty_frame_a(), &empty_frame_b()).unwrap();
        assert_eq!(frames.outside_temperature(), None);
        assert_eq!(frames.outside_humidity(), None);
        assert_eq!(frames.inside_humidity(), None);
        assert_eq!(frames.wind_speed(), None);
        assert_eq!(frames.wind_direction(), None);
        assert_eq!(frames.barometer(), None);
        assert_eq!(frames.solar_radiation(), None);
        assert_eq!(frames.rain_rate(), None);
        assert_eq!(frames.dew_point(), None);
        assert_eq!(frames.thsw_index(), None);
    }

    #[test]
    fn test_valid_fields_are_unit_converted() {
        let mut a = empty_frame_a();
        set_u16_le(&mut a, 7, 29_920); // one standard atmosphere
        set_u16_le(&mut a, 12, 200); // 20.0 °F
        a[14] = 10; // 10 mph
        set_u16_le(&mut a, 16, 270);
        a[33] = 42;
        crc_append(&mut a);
        let frames = LiveFrames::decode(&a, &empty_frame_b()).unwrap();

        let temp = frames.outside_temperature().unwrap();
        assert!((temp - (20.0 - 32.0) / 1.8).abs() < 1e-9);
        assert!((frames.barometer().unwrap() - 1.013).abs() < 1e-3);
        assert!((frames.wind_speed().unwrap() - 16.093_44).abs() < 1e-5);
        assert_eq!(frames.wind_direction(), Some(270));
        assert_eq!(frames.outside_humidity(), Some(42));
    }

    /// Two valid sub-frames with humidity at its sentinel and a raw
    /// temperature of 200 tenths decode to an observation with no humidity
    /// and a converted temperature, never a passed-through sentinel.
    #[test]
    fn test_observation_from_sentinel_mix() {
        let mut a = empty_frame_a();
        set_u16_le(&mut a, 12, 200); // 20.0 °F
        a[33] = 0xFF; // outside humidity sentinel
        crc_append(&mut a);
        let frames = LiveFrames::decode(&a, &empty_frame_b()).unwrap();

        let ctx = crate::time::TimeOffseter::from_offset_minutes(0).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let obs = frames.to_observation(Uuid::nil(), time, &ctx);

        assert!(obs.outside_humidity.is_none());
        let temp = obs.outside_temperature.unwrap();
        assert!((temp - (-6.67)).abs() < 0.01, "got {temp}");
        // no humidity means no dew point either, not a garbage derivation
        assert!(obs.dew_point.is_none());
    }

    #[test]
    fn test_observation_derives_missing_quantities() {
        let mut a = empty_frame_a();
        set_u16_le(&mut a, 12, 750); // 75.0 °F
        a[33] = 60; // 60 % RH
        a[14] = 10; // 10 mph wind
        crc_append(&mut a);
        let frames = LiveFrames::decode(&a, &empty_frame_b()).unwrap();

        let ctx = crate::time::TimeOffseter::from_offset_minutes(0).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let obs = frames.to_observation(Uuid::nil(), time, &ctx);

        let t = obs.outside_temperature.unwrap();
        let dp = obs.dew_point.unwrap();
        assert!((dp - wxmath::dew_point(t, 60.0)).abs() < 1e-9);
        assert!(obs.heat_index.is_some());
        assert!(obs.wind_chill.is_some());
        assert!(obs.thsw_index.is_some());
    }

    #[test]
    fn test_lookup_tables() {
        assert_eq!(bar_trend_text(-60), Some("falling rapidly"));
        assert_eq!(bar_trend_text(0), Some("steady"));
        assert_eq!(bar_trend_text(33), None);
        assert_eq!(forecast_text(0x08), Some("sunny"));
        assert_eq!(forecast_text(0xFF), None);
    }
}
