//! Derived meteorological quantities
//!
//! Standard approximations used to fill in quantities the station does not
//! report itself: Magnus-Tetens dew point, the NWS heat index regression,
//! the Davis wind-chill rule, the THSW apparent temperature, a solar-position
//! based insolation test and FAO-56 Penman-Monteith reference
//! evapotranspiration. Magic constants come verbatim from the FAO-56 and
//! Davis application notes; do not "improve" them.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::core::types::convert;

/// Solar constant in W/m²
const SOLAR_CONSTANT: f64 = 1370.0;

/// Fraction of the clear-sky maximum above which an interval counts as sunny
const SUNSHINE_THRESHOLD: f64 = 0.8;

/// Dew point in °C via the Magnus-Tetens approximation.
pub fn dew_point(temperature: f64, humidity: f64) -> f64 {
    let gamma = (humidity / 100.0).ln() + 17.27 * temperature / (237.7 + temperature);
    237.7 * gamma / (17.27 - gamma)
}

/// Heat index in °C following the NWS Rothfusz regression, with the two
/// documented correction branches for very dry and very humid air.
pub fn heat_index(temperature: f64, humidity: f64) -> f64 {
    let t = convert::to_fahrenheit(temperature);
    let rh = humidity;

    // Below the regression's domain the NWS uses the simple Steadman blend.
    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    if (simple + t) / 2.0 < 80.0 {
        return convert::from_fahrenheit(simple);
    }

    let mut hi = -42.379 + 2.04901523 * t + 10.14333127 * rh
        - 0.22475541 * t * rh
        - 6.83783e-3 * t * t
        - 5.481717e-2 * rh * rh
        + 1.22874e-3 * t * t * rh
        + 8.5282e-4 * t * rh * rh
        - 1.99e-6 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
    } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 2.0);
    }
    convert::from_fahrenheit(hi)
}

/// Wind chill in °C, Davis flavour: the NWS formula, bypassed entirely below
/// 5 mph or above 91.4 °F and never reported above the air temperature.
pub fn wind_chill(temperature: f64, wind_speed: f64) -> f64 {
    let t = convert::to_fahrenheit(temperature);
    let v = wind_speed / 1.609_344; // km/h -> mph
    if v < 5.0 || t > 91.4 {
        return temperature;
    }
    let chill = 35.74 + 0.6215 * t - 35.75 * v.powf(0.16) + 0.4275 * t * v.powf(0.16);
    convert::from_fahrenheit(chill.min(t))
}

/// Water vapour pressure in hPa.
fn vapour_pressure(temperature: f64, humidity: f64) -> f64 {
    humidity / 100.0 * 6.105 * (17.27 * temperature / (237.7 + temperature)).exp()
}

/// THSW apparent temperature in °C without a radiation term.
pub fn thsw(temperature: f64, humidity: f64, wind_speed: f64) -> f64 {
    let e = vapour_pressure(temperature, humidity);
    let ws = convert::kmh_to_ms(wind_speed);
    temperature + 0.33 * e - 0.70 * ws - 4.00
}

/// THSW apparent temperature in °C including net absorbed radiation.
pub fn thsw_radiation(
    temperature: f64,
    humidity: f64,
    wind_speed: f64,
    solar_radiation: f64,
) -> f64 {
    let e = vapour_pressure(temperature, humidity);
    let ws = convert::kmh_to_ms(wind_speed);
    temperature + 0.348 * e - 0.70 * ws + 0.70 * solar_radiation / (ws + 10.0) - 4.25
}

/// Solar geometry for one instant, shared by the insolation test and the
/// evapotranspiration computation.
struct SolarPosition {
    /// Sine of the solar altitude angle
    sin_altitude: f64,
    /// Solar declination in radians
    declination: f64,
    /// Hour angle in radians (0 at solar noon)
    hour_angle: f64,
    /// Day of year
    day_of_year: f64,
}

fn solar_position(latitude: f64, longitude: f64, time: DateTime<Utc>) -> SolarPosition {
    let day = time.ordinal() as f64;
    let phi = latitude.to_radians();

    let declination = 0.409 * (2.0 * std::f64::consts::PI * day / 365.0 - 1.39).sin();

    // Seasonal correction for solar time (equation of time), in hours
    let b = 2.0 * std::f64::consts::PI * (day - 81.0) / 364.0;
    let eot = 0.1645 * (2.0 * b).sin() - 0.1255 * b.cos() - 0.025 * b.sin();

    let clock_hours = time.hour() as f64
        + time.minute() as f64 / 60.0
        + time.second() as f64 / 3600.0;
    let solar_hours = clock_hours + longitude / 15.0 + eot;
    let hour_angle = std::f64::consts::PI / 12.0 * (solar_hours - 12.0);

    let sin_altitude =
        phi.sin() * declination.sin() + phi.cos() * declination.cos() * hour_angle.cos();

    SolarPosition {
        sin_altitude,
        declination,
        hour_angle,
        day_of_year: day,
    }
}

/// Whether measured solar radiation beats the season-adjusted clear-sky
/// threshold for this place and instant, i.e. the interval counts as sunny.
pub fn is_sunny(solar_radiation: f64, latitude: f64, longitude: f64, time: DateTime<Utc>) -> bool {
    let pos = solar_position(latitude, longitude, time);
    if pos.sin_altitude <= 0.0 {
        return false;
    }
    let transmissivity =
        0.73 + 0.06 * (2.0 * std::f64::consts::PI * pos.day_of_year / 365.0).cos();
    let clear_sky = SOLAR_CONSTANT * transmissivity * pos.sin_altitude;
    solar_radiation > SUNSHINE_THRESHOLD * clear_sky
}

/// FAO-56 Penman-Monteith reference evapotranspiration over one measurement
/// interval, in mm.
///
/// Hourly-form equation scaled to the interval length; albedo 0.23; soil heat
/// flux 0.1·Rn by day and 0.5·Rn by night, per the FAO hourly guidance.
#[allow(clippy::too_many_arguments)]
pub fn evapotranspiration(
    temperature: f64,
    humidity: f64,
    wind_speed: f64,
    solar_radiation: f64,
    latitude: f64,
    longitude: f64,
    elevation: f64,
    time: DateTime<Utc>,
    interval_minutes: u32,
) -> f64 {
    let hours = interval_minutes as f64 / 60.0;
    let u2 = convert::kmh_to_ms(wind_speed);

    // Saturation and actual vapour pressure, kPa
    let es = 0.6108 * (17.27 * temperature / (temperature + 237.3)).exp();
    let ea = es * humidity / 100.0;
    // Slope of the vapour pressure curve, kPa/°C
    let delta = 4098.0 * es / ((temperature + 237.3) * (temperature + 237.3));
    // Psychrometric constant from local pressure, kPa/°C
    let pressure = 101.3 * ((293.0 - 0.0065 * elevation) / 293.0).powf(5.26);
    let gamma = 0.000665 * pressure;

    // Measured shortwave radiation over the interval, MJ/m²
    let rs = solar_radiation * hours * 3600.0 / 1.0e6;

    // Extraterrestrial radiation over the interval (FAO-56 eq. 28)
    let pos = solar_position(latitude, longitude, time);
    let phi = latitude.to_radians();
    let dr = 1.0
        + 0.033 * (2.0 * std::f64::consts::PI * pos.day_of_year / 365.0).cos();
    let half = std::f64::consts::PI * hours / 24.0;
    let w1 = pos.hour_angle - half;
    let w2 = pos.hour_angle + half;
    let gsc = 0.0820; // MJ/m²/min
    let ra = (12.0 * 60.0 / std::f64::consts::PI)
        * gsc
        * dr
        * ((w2 - w1) * phi.sin() * pos.declination.sin()
            + phi.cos() * pos.declination.cos() * (w2.sin() - w1.sin()));
    let ra = ra.max(0.0);

    // Net radiation with albedo 0.23 and a longwave loss term
    let rso = (0.75 + 2.0e-5 * elevation) * ra;
    let ratio = if rso > 1.0e-9 {
        (rs / rso).clamp(0.3, 1.0)
    } else {
        0.5
    };
    let sigma = 2.043e-10 * hours; // Stefan-Boltzmann per interval, MJ/m²/K⁴
    let tk = temperature + 273.16;
    let rnl = sigma * tk.powi(4) * (0.34 - 0.14 * ea.sqrt()) * (1.35 * ratio - 0.35);
    let rn = (1.0 - 0.23) * rs - rnl;

    let g = if pos.sin_altitude > 0.0 { 0.1 * rn } else { 0.5 * rn };

    let et = (0.408 * delta * (rn - g)
        + gamma * (37.0 * hours / (temperature + 273.0)) * u2 * (es - ea))
        / (delta + gamma * (1.0 + 0.34 * u2));
    et.max(0.0)
}
