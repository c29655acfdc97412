use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One normalized station reading, in metric units, ready for the sink.
///
/// Every physical quantity is optional: a `None` means the sensor is absent
/// or reported its per-field "missing" sentinel on the wire. Sentinels never
/// survive decoding.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    /// Station this reading belongs to
    pub station: Uuid,
    /// UTC timestamp of the reading
    pub time: DateTime<Utc>,
    /// Atmospheric pressure in bar
    pub barometer: Option<f64>,
    /// Inside temperature in °C
    pub inside_temperature: Option<f64>,
    /// Inside relative humidity in %
    pub inside_humidity: Option<i32>,
    /// Outside temperature in °C
    pub outside_temperature: Option<f64>,
    /// Outside relative humidity in %
    pub outside_humidity: Option<i32>,
    /// Lowest outside temperature over the archive interval in °C
    pub min_outside_temperature: Option<f64>,
    /// Highest outside temperature over the archive interval in °C
    pub max_outside_temperature: Option<f64>,
    /// Wind speed in km/h
    pub wind_speed: Option<f64>,
    /// Wind direction in degrees (1-360)
    pub wind_direction: Option<i32>,
    /// Wind gust speed in km/h
    pub wind_gust: Option<f64>,
    /// Rainfall over the interval in mm
    pub rainfall: Option<f64>,
    /// Rain rate in mm/h
    pub rain_rate: Option<f64>,
    /// Solar radiation in W/m²
    pub solar_radiation: Option<i32>,
    /// UV index
    pub uv_index: Option<f64>,
    /// Dew point in °C
    pub dew_point: Option<f64>,
    /// Heat index in °C
    pub heat_index: Option<f64>,
    /// Wind chill in °C
    pub wind_chill: Option<f64>,
    /// Temperature-Humidity-Sun-Wind apparent temperature in °C
    pub thsw_index: Option<f64>,
    /// Reference evapotranspiration over the interval in mm
    pub evapotranspiration: Option<f64>,
    /// Minutes of the interval counted as sunny
    pub insolation_time: Option<i32>,
    /// Supplementary temperature probes in °C
    pub extra_temperatures: [Option<f64>; 3],
    /// Supplementary humidity probes in %
    pub extra_humidities: [Option<i32>; 2],
    /// Soil temperature probes in °C
    pub soil_temperatures: [Option<f64>; 4],
    /// Soil moisture probes in centibars
    pub soil_moistures: [Option<i32>; 4],
    /// Leaf temperature probes in °C
    pub leaf_temperatures: [Option<f64>; 2],
    /// Leaf wetness probes (0-15)
    pub leaf_wetnesses: [Option<i32>; 2],
}

impl Observation {
    /// Creates an empty observation for a station at a point in time.
    pub fn new(station: Uuid, time: DateTime<Utc>) -> Self {
        Observation {
            station,
            time,
            barometer: None,
            inside_temperature: None,
            inside_humidity: None,
            outside_temperature: None,
            outside_humidity: None,
            min_outside_temperature: None,
            max_outside_temperature: None,
            wind_speed: None,
            wind_direction: None,
            wind_gust: None,
            rainfall: None,
            rain_rate: None,
            solar_radiation: None,
            uv_index: None,
            dew_point: None,
            heat_index: None,
            wind_chill: None,
            thsw_index: None,
            evapotranspiration: None,
            insolation_time: None,
            extra_temperatures: [None; 3],
            extra_humidities: [None; 2],
            soil_temperatures: [None; 4],
            soil_moistures: [None; 4],
            leaf_temperatures: [None; 2],
            leaf_wetnesses: [None; 2],
        }
    }
}

/// Unit conversions applied while decoding wire fields. Only ever called on
/// values that already passed their sentinel check.
pub mod convert {
    /// Fahrenheit to Celsius
    pub fn from_fahrenheit(f: f64) -> f64 {
        (f - 32.0) / 1.8
    }

    /// Celsius to Fahrenheit
    pub fn to_fahrenheit(c: f64) -> f64 {
        c * 1.8 + 32.0
    }

    /// Miles per hour to km/h
    pub fn from_mph(mph: f64) -> f64 {
        mph * 1.609_344
    }

    /// km/h to m/s
    pub fn kmh_to_ms(kmh: f64) -> f64 {
        kmh / 3.6
    }

    /// Thousandths of inches of mercury to bar
    pub fn from_in_hg_thousandths(raw: f64) -> f64 {
        raw / 1000.0 * 0.033_863_886_666_667
    }

    /// Rain collector clicks (0.2 mm tipping bucket) to mm
    pub fn from_rain_clicks(clicks: f64) -> f64 {
        clicks * 0.2
    }

    /// Thousandths of inches to mm
    pub fn from_in_thousandths(raw: f64) -> f64 {
        raw / 1000.0 * 25.4
    }
}
