use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::Result;
use super::types::Observation;

/// Station metadata as known to the sink.
#[derive(Debug, Clone)]
pub struct StationDetails {
    /// Opaque station identifier
    pub id: Uuid,
    /// Human-readable station name
    pub name: String,
    /// Polling period in minutes
    pub polling_period: u32,
    /// Timestamp of the most recent archived observation
    pub last_archive_time: DateTime<Utc>,
}

/// Storage backend consumed by the protocol engine.
///
/// The engine never assumes more than single-statement atomicity: a crash
/// between `insert_observation` and `update_last_archive_time` re-processes
/// the same records on restart, and storage is expected to be idempotent per
/// (station, timestamp).
#[allow(async_fn_in_trait)]
pub trait ObservationSink {
    /// Stores one observation. Returns false when the sink refused the row.
    async fn insert_observation(&self, observation: &Observation) -> Result<bool>;

    /// Advances the archive watermark for a station.
    async fn update_last_archive_time(&self, station: Uuid, time: DateTime<Utc>) -> Result<bool>;

    /// Resolves a station by the coordinates it reports during the identify
    /// step. Elevation in feet, latitude/longitude in tenths of a degree,
    /// exactly as they come off the wire.
    async fn lookup_station_by_coordinates(
        &self,
        elevation: i32,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<StationDetails>>;

    /// Fetches metadata for a known station.
    async fn get_station_details(&self, station: Uuid) -> Result<Option<StationDetails>>;
}
