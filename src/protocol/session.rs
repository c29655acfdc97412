//! Station session state machine
//!
//! One session owns one deadline-bounded channel to one physical logger and
//! drives the wake/identify/poll/archive protocol over it. The driver loop
//! processes exactly one state transition at a time; every suspension point
//! is either a channel operation (already deadline-bounded) or the poll-tick
//! timer, and a cancellation that races a completed operation is discarded
//! because only the first outcome is ever delivered.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive::ArchivePage;
use super::frame::{crc16, crc_valid, LiveFrames};
use crate::channel::{Connector, DeadlineChannel};
use crate::core::{
    Error, ObservationSink, Result, StationDetails, ACK, ARCHIVE_PAGE_SIZE, LIVE_FRAME_SIZE,
    MAX_RETRIES,
};
use crate::time::TimeOffseter;

/// Protocol command strings
const WAKE: &[u8] = b"\n";
const WAKE_ECHO: &[u8] = b"\n\r";
const IDENTIFY: &[u8] = b"EEBRD 0B 06\n";
const MEASURE: &[u8] = b"LPS 3 2\n";
const ARCHIVE: &[u8] = b"DMPAFT\n";

/// Identify payload: latitude, longitude, elevation, CRC
const IDENTIFY_PAYLOAD_SIZE: usize = 8;
/// Archive dump header: page count, first record index, CRC
const ARCHIVE_HEADER_SIZE: usize = 6;

/// Session states, one per protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    SendingWakeStation,
    WaitingEchoStation,
    SendingIdentifyRequest,
    WaitingIdentifyAck,
    WaitingIdentifyData,
    WaitingNextPollTick,
    SendingWakeMeasure,
    WaitingEchoMeasure,
    SendingMeasureRequest,
    WaitingMeasureAck,
    WaitingMeasureData,
    SendingArchiveRequest,
    WaitingArchiveAck,
    SendingArchiveParams,
    WaitingArchiveParamsAck,
    WaitingArchivePage,
    Stopped,
}

/// Session timing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for ordinary command/response exchanges
    pub exchange_timeout: StdDuration,
    /// Deadline for the wake echo, which the console answers quickly or
    /// not at all
    pub wake_timeout: StdDuration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            exchange_timeout: StdDuration::from_secs(5),
            wake_timeout: StdDuration::from_secs(2),
        }
    }
}

/// Drives the protocol against one station and feeds the sink.
pub struct StationSession<C: Connector, S: ObservationSink> {
    channel: DeadlineChannel<C>,
    sink: S,
    offseter: TimeOffseter,
    config: SessionConfig,
    stop: CancellationToken,
    state: SessionState,
    timeouts: u32,
    transmission_errors: u32,
    station: Option<StationDetails>,
    /// Archive watermark: newest archived observation known to be stored
    last_archive: DateTime<Utc>,
    /// Whether the next wake leads into an archive dump instead of a poll
    archive_pending: bool,
    /// Pages left in the dump currently being streamed
    pages_remaining: u16,
}

impl<C: Connector, S: ObservationSink> StationSession<C, S> {
    pub fn new(
        connector: C,
        sink: S,
        offseter: TimeOffseter,
        config: SessionConfig,
    ) -> Self {
        let channel = DeadlineChannel::new(connector, Some(config.exchange_timeout));
        StationSession {
            channel,
            sink,
            offseter,
            config,
            stop: CancellationToken::new(),
            state: SessionState::Starting,
            timeouts: 0,
            transmission_errors: 0,
            station: None,
            last_archive: DateTime::<Utc>::MIN_UTC,
            archive_pending: false,
            pages_remaining: 0,
        }
    }

    /// Token that stops the session from any context. Cancelling is
    /// idempotent; pending timer and I/O waits are abandoned at the next
    /// suspension point and the channel is closed.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transmission_errors(&self) -> u32 {
        self.transmission_errors
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Runs the session to completion. Returns `Ok(())` after an external
    /// stop and the terminal error otherwise. There is no automatic
    /// reconnection; restarting is the scheduler's call.
    pub async fn run(&mut self) -> Result<()> {
        let stop = self.stop.clone();
        let mut state = SessionState::Starting;
        loop {
            if stop.is_cancelled() {
                state = SessionState::Stopped;
            }
            self.state = state;
            if state == SessionState::Stopped {
                self.channel.close();
                info!("session stopped");
                return Ok(());
            }

            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    state = SessionState::Stopped;
                    continue;
                }
                outcome = self.step(state) => outcome,
            };

            state = match outcome {
                Ok(next) => next,
                Err(e) if e.is_retryable() => {
                    match &e {
                        Error::Timeout(_) => self.timeouts += 1,
                        _ => self.transmission_errors += 1,
                    }
                    if self.timeouts >= MAX_RETRIES || self.transmission_errors >= MAX_RETRIES {
                        error!(
                            state = ?state,
                            timeouts = self.timeouts,
                            transmission_errors = self.transmission_errors,
                            error = %e,
                            "retry budget exhausted, stopping session"
                        );
                        self.state = SessionState::Stopped;
                        self.channel.close();
                        return Err(e);
                    }
                    warn!(state = ?state, error = %e, "retrying step");
                    if let Err(flush_err) = self.channel.flush_pending().await {
                        error!(error = %flush_err, "channel lost while flushing before retry");
                        self.state = SessionState::Stopped;
                        self.channel.close();
                        return Err(flush_err);
                    }
                    retry_state(state)
                }
                Err(e) => {
                    error!(state = ?state, error = %e, "fatal session error");
                    self.state = SessionState::Stopped;
                    self.channel.close();
                    return Err(e);
                }
            };
        }
    }

    async fn step(&mut self, state: SessionState) -> Result<SessionState> {
        use SessionState::*;
        match state {
            Starting => {
                self.channel.connect(Some(self.config.exchange_timeout)).await?;
                Ok(SendingWakeStation)
            }
            SendingWakeStation | SendingWakeMeasure => {
                self.channel.write_all(WAKE, Some(self.config.wake_timeout)).await?;
                Ok(if state == SendingWakeStation {
                    WaitingEchoStation
                } else {
                    WaitingEchoMeasure
                })
            }
            WaitingEchoStation => {
                self.channel
                    .read_until(WAKE_ECHO, Some(self.config.wake_timeout))
                    .await?;
                Ok(SendingIdentifyRequest)
            }
            WaitingEchoMeasure => {
                self.channel
                    .read_until(WAKE_ECHO, Some(self.config.wake_timeout))
                    .await?;
                Ok(if self.archive_pending {
                    SendingArchiveRequest
                } else {
                    SendingMeasureRequest
                })
            }
            SendingIdentifyRequest => {
                self.channel.write_all(IDENTIFY, None).await?;
                Ok(WaitingIdentifyAck)
            }
            WaitingIdentifyAck => {
                self.expect_ack().await?;
                Ok(WaitingIdentifyData)
            }
            WaitingIdentifyData => self.handle_identify_data().await,
            WaitingNextPollTick => self.wait_next_tick().await,
            SendingMeasureRequest => {
                self.channel.write_all(MEASURE, None).await?;
                Ok(WaitingMeasureAck)
            }
            WaitingMeasureAck => {
                self.expect_ack().await?;
                Ok(WaitingMeasureData)
            }
            WaitingMeasureData => self.handle_measure_data().await,
            SendingArchiveRequest => {
                self.channel.write_all(ARCHIVE, None).await?;
                Ok(WaitingArchiveAck)
            }
            WaitingArchiveAck => {
                self.expect_ack().await?;
                Ok(SendingArchiveParams)
            }
            SendingArchiveParams => {
                let params = self.archive_params();
                self.channel.write_all(&params, None).await?;
                Ok(WaitingArchiveParamsAck)
            }
            WaitingArchiveParamsAck => self.handle_archive_header().await,
            WaitingArchivePage => self.handle_archive_page().await,
            Stopped => Ok(Stopped),
        }
    }

    /// Reads the single-byte command acknowledgement. Anything but the ACK
    /// value is a protocol violation the caller retries.
    async fn expect_ack(&mut self) -> Result<()> {
        let byte = self.channel.read_exactly(1, None).await?;
        if byte[0] != ACK {
            return Err(Error::protocol(format!(
                "expected ack 0x{ACK:02X}, got 0x{:02X}",
                byte[0]
            )));
        }
        Ok(())
    }

    async fn handle_identify_data(&mut self) -> Result<SessionState> {
        let payload = self
            .channel
            .read_exactly(IDENTIFY_PAYLOAD_SIZE, None)
            .await?;
        if !crc_valid(&payload) {
            return Err(Error::ChecksumInvalid);
        }
        let latitude = i16::from_le_bytes([payload[0], payload[1]]) as f64 / 10.0;
        let longitude = i16::from_le_bytes([payload[2], payload[3]]) as f64 / 10.0;
        let elevation_ft = i16::from_le_bytes([payload[4], payload[5]]) as i32;

        let details = self
            .sink
            .lookup_station_by_coordinates(elevation_ft, latitude, longitude)
            .await?
            .ok_or(Error::UnknownStation {
                latitude,
                longitude,
                elevation: elevation_ft,
            })?;

        info!(
            station = %details.id,
            name = %details.name,
            polling_period = details.polling_period,
            "station identified"
        );
        let elevation_m = (elevation_ft as f64 * 0.3048).round() as i32;
        self.offseter.set_coordinates(latitude, longitude, elevation_m);
        self.offseter.set_measure_step(details.polling_period);
        self.last_archive = details.last_archive_time;
        self.station = Some(details);
        self.clear_retry_counters();
        Ok(SessionState::WaitingNextPollTick)
    }

    /// Sleeps until the next multiple of the polling period. Aligning on
    /// the boundary instead of "now + period" keeps poll times from
    /// drifting across retries.
    async fn wait_next_tick(&mut self) -> Result<SessionState> {
        let period = self.polling_period_secs();
        let now = Utc::now().timestamp();
        let next = (now.div_euclid(period) + 1) * period;
        let wait = StdDuration::from_secs((next - now).max(1) as u64);
        debug!(seconds = wait.as_secs(), "sleeping until next poll boundary");
        tokio::time::sleep(wait).await;

        let elapsed = Utc::now() - self.last_archive;
        self.archive_pending = elapsed > Duration::seconds(self.polling_period_secs());
        Ok(SessionState::SendingWakeMeasure)
    }

    async fn handle_measure_data(&mut self) -> Result<SessionState> {
        let data = self.channel.read_exactly(2 * LIVE_FRAME_SIZE, None).await?;
        let frames = LiveFrames::decode(&data[..LIVE_FRAME_SIZE], &data[LIVE_FRAME_SIZE..])?;
        let station_id = self.station_id()?;
        let observation = frames.to_observation(station_id, Utc::now(), &self.offseter);
        if !self.sink.insert_observation(&observation).await? {
            warn!(station = %station_id, "sink refused live observation");
        }
        self.clear_retry_counters();
        Ok(SessionState::WaitingNextPollTick)
    }

    /// Parameter block for the archive dump: the watermark as station-local
    /// packed date and time, with a trailing CRC.
    fn archive_params(&self) -> [u8; 6] {
        let local = self.offseter.convert_utc_to_local(self.last_archive);
        let year = local.year().max(2000);
        let date =
            (local.day() as u16) | ((local.month() as u16) << 5) | (((year - 2000) as u16) << 9);
        let time = (local.hour() * 100 + local.minute()) as u16;
        let mut params = [0u8; 6];
        params[0..2].copy_from_slice(&date.to_le_bytes());
        params[2..4].copy_from_slice(&time.to_le_bytes());
        let crc = crc16(&params[..4]);
        params[4..6].copy_from_slice(&crc.to_be_bytes());
        params
    }

    async fn handle_archive_header(&mut self) -> Result<SessionState> {
        self.expect_ack().await?;
        let header = self.channel.read_exactly(ARCHIVE_HEADER_SIZE, None).await?;
        if !crc_valid(&header) {
            return Err(Error::ChecksumInvalid);
        }
        let pages = u16::from_le_bytes([header[0], header[1]]);
        let first_index = u16::from_le_bytes([header[2], header[3]]);
        debug!(pages, first_index, "archive dump header");
        self.pages_remaining = pages;
        self.archive_pending = false;
        if pages == 0 {
            self.clear_retry_counters();
            return Ok(SessionState::WaitingNextPollTick);
        }
        // confirm the header to start the page stream
        self.channel.write_all(&[ACK], None).await?;
        Ok(SessionState::WaitingArchivePage)
    }

    async fn handle_archive_page(&mut self) -> Result<SessionState> {
        let bytes = self.channel.read_exactly(ARCHIVE_PAGE_SIZE, None).await?;
        let page = ArchivePage::parse(&bytes)?;
        let station_id = self.station_id()?;
        let now = Utc::now();
        let (observations, watermark) =
            page.extract_new_records(station_id, self.last_archive, now, &self.offseter);
        for observation in &observations {
            if !self.sink.insert_observation(observation).await? {
                warn!(station = %station_id, time = %observation.time, "sink refused archive observation");
            }
        }
        if watermark > self.last_archive {
            self.sink
                .update_last_archive_time(station_id, watermark)
                .await?;
            self.last_archive = watermark;
        }
        self.clear_retry_counters();
        self.pages_remaining = self.pages_remaining.saturating_sub(1);
        if self.pages_remaining == 0 {
            info!(station = %station_id, watermark = %self.last_archive, "archive catch-up complete");
            return Ok(SessionState::WaitingNextPollTick);
        }
        // acknowledge to receive the next page
        self.channel.write_all(&[ACK], None).await?;
        Ok(SessionState::WaitingArchivePage)
    }

    fn station_id(&self) -> Result<uuid::Uuid> {
        self.station
            .as_ref()
            .map(|s| s.id)
            .ok_or_else(|| Error::protocol("station not identified yet"))
    }

    fn polling_period_secs(&self) -> i64 {
        let minutes = self
            .station
            .as_ref()
            .map(|s| s.polling_period.max(1))
            .unwrap_or(10);
        minutes as i64 * 60
    }

    fn clear_retry_counters(&mut self) {
        self.timeouts = 0;
        self.transmission_errors = 0;
    }
}

/// Where a failed step resumes: timeouts and transmission errors re-run the
/// request that opened the current exchange.
fn retry_state(failed: SessionState) -> SessionState {
    use SessionState::*;
    match failed {
        Starting => Starting,
        SendingWakeStation | WaitingEchoStation => SendingWakeStation,
        SendingIdentifyRequest | WaitingIdentifyAck | WaitingIdentifyData => SendingIdentifyRequest,
        SendingWakeMeasure | WaitingEchoMeasure => SendingWakeMeasure,
        SendingMeasureRequest | WaitingMeasureAck | WaitingMeasureData => SendingMeasureRequest,
        SendingArchiveRequest | WaitingArchiveAck | SendingArchiveParams
        | WaitingArchiveParamsAck | WaitingArchivePage => SendingArchiveRequest,
        WaitingNextPollTick => WaitingNextPollTick,
        Stopped => Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::DuplexConnector;
    use crate::core::Observation;
    use crate::protocol::archive::fixtures as archive_fixtures;
    use crate::protocol::frame::fixtures as frame_fixtures;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use uuid::Uuid;

    struct MockSink {
        station: Option<StationDetails>,
        observations: Mutex<Vec<Observation>>,
        archive_updates: Mutex<Vec<DateTime<Utc>>>,
    }

    impl MockSink {
        fn new(station: Option<StationDetails>) -> Self {
            MockSink {
                station,
                observations: Mutex::new(Vec::new()),
                archive_updates: Mutex::new(Vec::new()),
            }
        }
    }

    impl ObservationSink for &MockSink {
        async fn insert_observation(&self, observation: &Observation) -> Result<bool> {
            self.observations.lock().unwrap().push(observation.clone());
            Ok(true)
        }

        async fn update_last_archive_time(
            &self,
            _station: Uuid,
            time: DateTime<Utc>,
        ) -> Result<bool> {
            self.archive_updates.lock().unwrap().push(time);
            Ok(true)
        }

        async fn lookup_station_by_coordinates(
            &self,
            _elevation: i32,
            _latitude: f64,
            _longitude: f64,
        ) -> Result<Option<StationDetails>> {
            Ok(self.station.clone())
        }

        async fn get_station_details(&self, _station: Uuid) -> Result<Option<StationDetails>> {
            Ok(self.station.clone())
        }
    }

    fn station_details(last_archive: DateTime<Utc>) -> StationDetails {
        StationDetails {
            id: Uuid::new_v4(),
            name: "roof-station".into(),
            polling_period: 10,
            last_archive_time: last_archive,
        }
    }

    fn identify_payload() -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&436i16.to_le_bytes()); // 43.6°
        payload[2..4].copy_from_slice(&14i16.to_le_bytes()); // 1.4°
        payload[4..6].copy_from_slice(&495i16.to_le_bytes()); // feet
        crate::protocol::frame::crc_append(&mut payload);
        payload
    }

    async fn serve_wake_and_identify(far: &mut DuplexStream) {
        let mut byte = [0u8; 1];
        far.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"\n");
        far.write_all(b"\n\r").await.unwrap();
        let mut request = [0u8; IDENTIFY.len()];
        far.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, IDENTIFY);
        far.write_all(&[ACK]).await.unwrap();
        far.write_all(&identify_payload()).await.unwrap();
    }

    async fn serve_wake(far: &mut DuplexStream) {
        let mut byte = [0u8; 1];
        far.read_exact(&mut byte).await.unwrap();
        far.write_all(b"\n\r").await.unwrap();
    }

    fn session(
        far_sink: &MockSink,
        near: DuplexStream,
    ) -> StationSession<DuplexConnector, &MockSink> {
        let offseter = TimeOffseter::from_offset_minutes(0).unwrap();
        StationSession::new(
            DuplexConnector(Some(near)),
            far_sink,
            offseter,
            SessionConfig::default(),
        )
    }

    /// Full live poll: wake, identify, tick, wake, measure, store, stop.
    #[tokio::test(start_paused = true)]
    async fn test_live_poll_round_trip() {
        let (near, mut far) = tokio::io::duplex(4096);
        // recent watermark: no archive catch-up wanted
        let sink = MockSink::new(Some(station_details(Utc::now())));
        let mut session = session(&sink, near);
        let stop = session.stop_token();

        let script = async {
            serve_wake_and_identify(&mut far).await;
            serve_wake(&mut far).await;
            let mut request = [0u8; MEASURE.len()];
            far.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, MEASURE);
            far.write_all(&[ACK]).await.unwrap();
            let mut a = frame_fixtures::empty_frame_a();
            frame_fixtures::set_u16_le(&mut a, 12, 652); // 65.2 °F
            a[33] = 47;
            crate::protocol::frame::crc_append(&mut a);
            far.write_all(&a).await.unwrap();
            far.write_all(&frame_fixtures::empty_frame_b()).await.unwrap();
            // next wake means the poll completed; stop the session
            let mut byte = [0u8; 1];
            far.read_exact(&mut byte).await.unwrap();
            stop.cancel();
        };

        let (run, _) = tokio::join!(session.run(), script);
        run.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        let stored = sink.observations.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].outside_humidity, Some(47));
        let temp = stored[0].outside_temperature.unwrap();
        assert!((temp - (65.2 - 32.0) / 1.8).abs() < 1e-6);
    }

    /// An unknown station is a configuration mismatch: fatal, no retry.
    #[tokio::test(start_paused = true)]
    async fn test_unknown_station_is_fatal() {
        let (near, mut far) = tokio::io::duplex(4096);
        let sink = MockSink::new(None);
        let mut session = session(&sink, near);

        let script = async {
            serve_wake_and_identify(&mut far).await;
        };

        let (run, _) = tokio::join!(session.run(), script);
        assert!(matches!(run, Err(Error::UnknownStation { .. })));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    /// A wrong acknowledgement byte increments the transmission-error
    /// counter, re-sends the measure request, and the fifth consecutive
    /// failure stops the session.
    #[tokio::test(start_paused = true)]
    async fn test_bad_ack_retries_then_stops() {
        let (near, mut far) = tokio::io::duplex(4096);
        let sink = MockSink::new(Some(station_details(Utc::now())));
        let mut session = session(&sink, near);

        let script = async {
            serve_wake_and_identify(&mut far).await;
            serve_wake(&mut far).await;
            for _ in 0..MAX_RETRIES {
                let mut request = [0u8; MEASURE.len()];
                far.read_exact(&mut request).await.unwrap();
                assert_eq!(&request, MEASURE);
                far.write_all(&[0x15]).await.unwrap();
            }
        };

        let (run, _) = tokio::join!(session.run(), script);
        assert!(matches!(run, Err(Error::Protocol(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.transmission_errors(), MAX_RETRIES);
    }

    /// A stale watermark routes the session into the archive dump, whose
    /// records land in the sink and advance the watermark.
    #[tokio::test(start_paused = true)]
    async fn test_archive_catch_up() {
        let (near, mut far) = tokio::io::duplex(8192);
        let last_archive = Utc::now() - Duration::hours(2);
        let sink = MockSink::new(Some(station_details(last_archive)));
        let mut session = session(&sink, near);
        let stop = session.stop_token();

        let now_local = Utc::now();
        let record_time = now_local - Duration::minutes(30);
        let script = async {
            serve_wake_and_identify(&mut far).await;
            serve_wake(&mut far).await;

            let mut request = [0u8; ARCHIVE.len()];
            far.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, ARCHIVE);
            far.write_all(&[ACK]).await.unwrap();

            let mut params = [0u8; 6];
            far.read_exact(&mut params).await.unwrap();
            assert!(crc_valid(&params));
            far.write_all(&[ACK]).await.unwrap();

            let mut header = [0u8; ARCHIVE_HEADER_SIZE];
            header[0..2].copy_from_slice(&1u16.to_le_bytes()); // one page
            header[2..4].copy_from_slice(&0u16.to_le_bytes());
            crate::protocol::frame::crc_append(&mut header);
            far.write_all(&header).await.unwrap();

            let mut byte = [0u8; 1];
            far.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], ACK);

            let records = [
                archive_fixtures::record_bytes(
                    record_time.year(),
                    record_time.month(),
                    record_time.day(),
                    record_time.hour(),
                    record_time.minute(),
                    700,
                    55,
                ),
                archive_fixtures::placeholder_record(),
                archive_fixtures::placeholder_record(),
                archive_fixtures::placeholder_record(),
                archive_fixtures::placeholder_record(),
            ];
            far.write_all(&archive_fixtures::page_bytes(0, records))
                .await
                .unwrap();

            // session goes back to the tick; next wake ends the test
            let mut byte = [0u8; 1];
            far.read_exact(&mut byte).await.unwrap();
            stop.cancel();
        };

        let (run, _) = tokio::join!(session.run(), script);
        run.unwrap();

        let stored = sink.observations.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].outside_humidity, Some(55));
        let updates = sink.archive_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], stored[0].time);
        assert!(updates[0] > last_archive);
    }

    /// A peer that never accepts the dial costs one timeout per attempt;
    /// the connect is retried until the budget runs out, not abandoned on
    /// the first miss.
    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_retried_up_to_budget() {
        struct StalledConnector;

        impl Connector for StalledConnector {
            type Stream = DuplexStream;

            async fn connect(&mut self) -> std::io::Result<DuplexStream> {
                std::future::pending().await
            }
        }

        let sink = MockSink::new(None);
        let offseter = TimeOffseter::from_offset_minutes(0).unwrap();
        let mut session =
            StationSession::new(StalledConnector, &sink, offseter, SessionConfig::default());
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.timeouts(), MAX_RETRIES);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    /// Stopping twice is harmless and a stopped session reports `Ok`.
    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (near, _far) = tokio::io::duplex(64);
        let sink = MockSink::new(Some(station_details(Utc::now())));
        let mut session = session(&sink, near);
        let stop = session.stop_token();
        stop.cancel();
        stop.cancel();
        session.run().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_retry_state_mapping() {
        assert_eq!(
            retry_state(SessionState::WaitingMeasureAck),
            SessionState::SendingMeasureRequest
        );
        assert_eq!(
            retry_state(SessionState::WaitingEchoStation),
            SessionState::SendingWakeStation
        );
        assert_eq!(
            retry_state(SessionState::WaitingArchivePage),
            SessionState::SendingArchiveRequest
        );
    }

    #[test]
    fn test_archive_params_carry_valid_crc() {
        let (near, _far) = tokio::io::duplex(64);
        let sink = MockSink::new(Some(station_details(Utc::now())));
        let session = session(&sink, near);
        let params = session.archive_params();
        assert!(crc_valid(&params));
    }
}
