//! The sensor-hub application protocol (SH2), layered on the transport.
//!
//! [`SensorHub`] is the client-facing entry point. It owns the HAL, the
//! transport state and a [`Client`] implementation, and is driven by calling
//! [`SensorHub::service`] whenever the hub signals a transfer: from an idle
//! loop, a dedicated thread, or directly from the interrupt handler's
//! bottom half.
//!
//! Request/response calls (`product_ids`, `sensor_config`, `read_frs`, …)
//! are synchronous: they compose the request, hand it to the transport, and
//! then pump `service` internally until the hub's matching response has
//! completed the operation. At most one operation is in flight at a time;
//! sensor events and asynchronous notifications keep flowing to the client
//! while a call is waiting.

pub mod frs;
mod input;
mod ops;
mod reports;

pub use self::reports::{FeatureFlags, SensorConfig};

use self::frs::SensorMetadata;
use self::input::TimestampTracker;
use self::ops::{GetFrs, Op, Outcome, SetFrs};
use self::reports::{CommandReq, CommandResp, ReportLengths};
use crate::bytes::{ByteReader, FromBytes};
use crate::hal::Hal;
use crate::tare::Quaternion;
use crate::transport::{advert, Delivery, Endpoint, Reassembly, Shtp, Stats as TransportStats};
use crate::Error;
use core::cmp;
use heapless::{String, Vec};

/// Product id entries the hub reports.
pub const NUM_PROD_ID_ENTRIES: usize = 4;
/// Error records accepted per error-log query.
pub const MAX_ERROR_RECORDS: usize = 16;

const MAX_VERSION_LEN: usize = 16;

// Sensorhub app advertisement tags.
const TAG_SH2_VERSION: u8 = 0x80;
const TAG_SH2_REPORT_LENGTHS: u8 = 0x81;

// One-byte payloads of the executable app's "device" channel.
const EXEC_RESP_RESET_COMPLETE: u8 = 1;

enum_with_unknown! {
    /// Sensor identifiers assigned by the hub.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SensorId(u8) {
        Accelerometer = 0x01,
        GyroscopeCalibrated = 0x02,
        MagneticFieldCalibrated = 0x03,
        LinearAcceleration = 0x04,
        RotationVector = 0x05,
        Gravity = 0x06,
        GyroscopeUncalibrated = 0x07,
        GameRotationVector = 0x08,
        GeomagneticRotationVector = 0x09,
        Pressure = 0x0A,
        AmbientLight = 0x0B,
        Humidity = 0x0C,
        Proximity = 0x0D,
        Temperature = 0x0E,
        MagneticFieldUncalibrated = 0x0F,
        TapDetector = 0x10,
        StepCounter = 0x11,
        SignificantMotion = 0x12,
        StabilityClassifier = 0x13,
        RawAccelerometer = 0x14,
        RawGyroscope = 0x15,
        RawMagnetometer = 0x16,
        StepDetector = 0x18,
        ShakeDetector = 0x19,
        FlipDetector = 0x1A,
        PickupDetector = 0x1B,
        StabilityDetector = 0x1C,
        PersonalActivityClassifier = 0x1E,
        SleepDetector = 0x1F,
        TiltDetector = 0x20,
        PocketDetector = 0x21,
        CircleDetector = 0x22,
        HeartRateMonitor = 0x23,
        ArVrStabilizedRv = 0x28,
        ArVrStabilizedGrv = 0x29,
        GyroIntegratedRv = 0x2A,
    }
}

enum_with_unknown! {
    /// Oscillator the hub is running from.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum OscType(u8) {
        Internal = 0,
        ExternalCrystal = 1,
        ExternalClock = 2,
    }
}

bitflags::bitflags! {
    /// Sensors to enable dynamic calibration for.
    pub struct CalSensors: u8 {
        const ACCEL = 0x01;
        const GYRO = 0x02;
        const MAG = 0x04;
        const PLANAR = 0x08;
    }
}

bitflags::bitflags! {
    /// Axes a tare applies to.
    pub struct TareAxes: u8 {
        const X = 0x01;
        const Y = 0x02;
        const Z = 0x04;
    }
}

/// Rotation vector the tare is computed against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TareBasis {
    RotationVector = 0,
    GamingRotationVector = 1,
    GeomagneticRotationVector = 2,
}

/// One entry of the hub's product id report.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ProductId {
    pub reset_cause: u8,
    pub sw_version_major: u8,
    pub sw_version_minor: u8,
    pub sw_part_number: u32,
    pub sw_build_number: u32,
    pub sw_version_patch: u16,
}

/// One record from the hub's error log.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    pub severity: u8,
    pub sequence: u8,
    pub source: u8,
    pub error: u8,
    pub module: u8,
    pub code: u8,
}

/// Event counters of one sensor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub offered: u32,
    pub accepted: u32,
    pub on: u32,
    pub attempted: u32,
}

/// One sensor event, delivered while its cargo is being parsed.
#[derive(Debug, Copy, Clone)]
pub struct SensorEvent<'a> {
    pub sensor: SensorId,
    /// Microsecond timestamp of the event, extended to 64 bits.
    pub timestamp_us: u64,
    /// The raw report, starting with its report id.
    pub data: &'a [u8],
}

/// Out-of-band notifications from the hub.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsyncEvent {
    /// The hub reset and finished starting up.
    Reset,
    /// An FRS record was changed on the hub.
    FrsChange { record_id: u16 },
}

/// Receiver for sensor events and asynchronous notifications.
pub trait Client {
    fn sensor_event(&mut self, event: &SensorEvent<'_>);
    fn async_event(&mut self, event: AsyncEvent);
}

/// Listener tokens handed to the transport; one per handler the session
/// registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Handler {
    SensorHubAdvert,
    ExecutableAdvert,
    Control,
    InputNormal,
    InputWake,
    InputGyroRv,
    Device,
}

/// Diagnostic counters of the session layer.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Zero-length cargos on the control channel.
    pub empty_payloads: u32,
    /// Reports whose id is missing from the learned length table.
    pub unknown_report_ids: u32,
    /// Malformed payloads on the executable app's device channel.
    pub exec_bad_payload: u32,
}

/// SH2 protocol state.
pub(crate) struct Session {
    control_chan: Option<u8>,
    version: String<MAX_VERSION_LEN>,
    report_lens: ReportLengths,

    advert_done: bool,
    got_init_resp: bool,
    called_reset_callback: bool,

    next_cmd_seq: u8,
    op: Option<Op>,
    op_result: Option<Result<(), Error>>,

    timestamps: TimestampTracker,
    stats: SessionStats,
}

impl Session {
    fn new() -> Self {
        Session {
            control_chan: None,
            version: String::new(),
            report_lens: ReportLengths::new(),
            advert_done: false,
            got_init_resp: false,
            called_reset_callback: false,
            next_cmd_seq: 0,
            op: None,
            op_result: None,
            timestamps: TimestampTracker::new(),
            stats: SessionStats::default(),
        }
    }

    /// Allocates the sequence number for a command-class request.
    fn alloc_cmd_seq(&mut self) -> u8 {
        let seq = self.next_cmd_seq;
        self.next_cmd_seq = seq.wrapping_add(1);
        seq
    }

    /// Handles one advertisement TLV addressed to a session listener.
    fn on_advert(&mut self, handler: Handler, tag: u8, value: &[u8]) {
        match handler {
            Handler::SensorHubAdvert => match tag {
                TAG_SH2_VERSION => {
                    self.version = bounded_version(advert::cstr(value));
                }
                TAG_SH2_REPORT_LENGTHS => self.report_lens.load(value),
                advert::TAG_NULL => {
                    // End of the sensorhub app's advertisement: the channel
                    // bindings are final now.
                    self.advert_done = true;
                }
                _ => {}
            },
            Handler::ExecutableAdvert => {
                // No tags are defined for the executable app.
            }
            _ => {}
        }
    }

    /// Handles a cargo on the sensorhub control channel.
    fn on_control<H: Hal, C: Client>(
        &mut self,
        payload: &[u8],
        shtp: &mut Shtp<Handler>,
        hal: &mut H,
        client: &mut C,
    ) {
        if payload.is_empty() {
            self.stats.empty_payloads += 1;
            return;
        }

        let mut cursor = 0;
        while cursor < payload.len() {
            let id = payload[cursor];
            let len = usize::from(self.report_lens.len_of(id));
            if len == 0 {
                self.stats.unknown_report_ids += 1;
                return;
            }
            let report = &payload[cursor..cmp::min(cursor + len, payload.len())];

            self.unsolicited(report, client);
            self.op_rx(report, shtp, hal);
            cursor += len;
        }
    }

    /// Checks a control report for unsolicited notifications.
    fn unsolicited<C: Client>(&mut self, report: &[u8], client: &mut C) {
        if report.first() != Some(&reports::COMMAND_RESP) {
            return;
        }
        let Ok(resp) = CommandResp::from_bytes(&mut ByteReader::new(report)) else {
            return;
        };
        if resp.command == (reports::CMD_INITIALIZE | reports::INIT_UNSOLICITED)
            && resp.r[1] == reports::INIT_SYSTEM
        {
            // The hub restarted on its own.
            self.got_init_resp = true;
        }
        if resp.command == (reports::CMD_FRS | reports::INIT_UNSOLICITED) {
            let record_id = u16::from(resp.r[1]) | u16::from(resp.r[2]) << 8;
            client.async_event(AsyncEvent::FrsChange { record_id });
        }
    }

    /// Hands a control report to the operation in progress, if any.
    fn op_rx<H: Hal>(&mut self, report: &[u8], shtp: &mut Shtp<Handler>, hal: &mut H) {
        let Some(mut op) = self.op.take() else {
            return;
        };
        let control = self.control_chan.unwrap_or(0);
        let outcome = op.rx(report, control, shtp, hal);
        self.op = Some(op);
        if let Outcome::Done(status) = outcome {
            trace!("operation completed: {:?}", status);
            self.op_result = Some(status);
        }
    }

    /// Handles a cargo on the executable app's "device" channel.
    fn on_device<C: Client>(&mut self, payload: &[u8], client: &mut C) {
        if payload.len() != 1 {
            self.stats.exec_bad_payload += 1;
            return;
        }
        match payload[0] {
            EXEC_RESP_RESET_COMPLETE => client.async_event(AsyncEvent::Reset),
            _ => self.stats.exec_bad_payload += 1,
        }
    }
}

/// Driver for one sensor hub.
pub struct SensorHub<H: Hal, C: Client> {
    hal: H,
    transport: Shtp<Handler>,
    rx: Reassembly,
    session: Session,
    client: C,
}

impl<H: Hal, C: Client> SensorHub<H, C> {
    /// Resets the hub into normal operation and prepares the driver.
    ///
    /// The hub follows up with its advertisement and a reset notification;
    /// call [`SensorHub::service`] to receive them. Operations fail until
    /// the advertisement has named the control channel.
    pub fn new(mut hal: H, client: C) -> Result<Self, Error> {
        hal.reset(false)?;

        let mut transport = Shtp::new(H::MAX_TRANSFER);
        transport.listen_advert(&mut hal, "sensorhub", Handler::SensorHubAdvert)?;
        transport.listen_channel("sensorhub", "control", Handler::Control)?;
        transport.listen_channel("sensorhub", "inputNormal", Handler::InputNormal)?;
        transport.listen_channel("sensorhub", "inputWake", Handler::InputWake)?;
        transport.listen_channel("sensorhub", "inputGyroRv", Handler::InputGyroRv)?;
        transport.listen_advert(&mut hal, "executable", Handler::ExecutableAdvert)?;
        transport.listen_channel("executable", "device", Handler::Device)?;

        Ok(SensorHub {
            hal,
            transport,
            rx: Reassembly::new(),
            session: Session::new(),
            client,
        })
    }

    /// Waits for one transfer from the hub and processes it.
    ///
    /// Sensor events and asynchronous notifications observed in the transfer
    /// are delivered to the client before this returns.
    pub fn service(&mut self) -> Result<(), Error> {
        let received = self.hal.wait_transfer()?;
        let delivery = self
            .transport
            .assemble(&mut self.rx, received.data, received.timestamp_us);
        if let Some(delivery) = delivery {
            self.deliver(delivery);
        }
        self.notify_reset();
        Ok(())
    }

    /// Version string the sensorhub app advertised.
    pub fn version(&self) -> &str {
        self.session.version.as_str()
    }

    /// Whether the startup advertisement has completed.
    pub fn advertisement_done(&self) -> bool {
        self.session.advert_done
    }

    /// Transport-level diagnostic counters.
    pub fn transport_stats(&self) -> TransportStats {
        *self.transport.stats()
    }

    /// Session-level diagnostic counters.
    pub fn stats(&self) -> SessionStats {
        self.session.stats
    }

    /// The client given to [`SensorHub::new`].
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Tears the driver down, returning the HAL and the client.
    pub fn release(self) -> (H, C) {
        (self.hal, self.client)
    }

    /// Queries the product ids of the hub.
    pub fn product_ids(&mut self) -> Result<Vec<ProductId, NUM_PROD_ID_ENTRIES>, Error> {
        match self.run_op(Op::ProductIds { ids: Vec::new() })? {
            Op::ProductIds { ids } => Ok(ids),
            _ => unreachable!(),
        }
    }

    /// Reads the current configuration of `sensor`.
    pub fn sensor_config(&mut self, sensor: SensorId) -> Result<SensorConfig, Error> {
        match self.run_op(Op::GetSensorConfig { sensor, config: None })? {
            Op::GetSensorConfig { config, .. } => config.ok_or(Error::Protocol),
            _ => unreachable!(),
        }
    }

    /// Configures `sensor`, enabling or disabling its reports.
    pub fn set_sensor_config(
        &mut self,
        sensor: SensorId,
        config: &SensorConfig,
    ) -> Result<(), Error> {
        self.run_op(Op::SetSensorConfig { sensor, config: config.clone() })?;
        Ok(())
    }

    /// Reads the FRS record `record_id` into `words`, returning the number
    /// of words the record holds (0 for an empty record).
    pub fn read_frs(&mut self, record_id: u16, words: &mut [u32]) -> Result<usize, Error> {
        let max = cmp::min(words.len(), frs::MAX_FRS_WORDS) as u16;
        if max == 0 {
            return Err(Error::BadParam);
        }
        match self.run_op(Op::GetFrs(GetFrs::new(record_id, max, false)))? {
            Op::GetFrs(get) => {
                let read = get.words();
                words[..read.len()].copy_from_slice(read);
                Ok(read.len())
            }
            _ => unreachable!(),
        }
    }

    /// Writes `words` as the new contents of the FRS record `record_id`.
    pub fn write_frs(&mut self, record_id: u16, words: &[u32]) -> Result<(), Error> {
        let mut data = Vec::new();
        if words.is_empty() || data.extend_from_slice(words).is_err() {
            return Err(Error::BadParam);
        }
        self.run_op(Op::SetFrs(SetFrs::new(record_id, data)))?;
        Ok(())
    }

    /// Reads and decodes the metadata record describing `sensor`.
    pub fn metadata(&mut self, sensor: SensorId) -> Result<SensorMetadata, Error> {
        let record_id = frs::metadata_record(sensor).ok_or(Error::BadParam)?;
        match self.run_op(Op::GetFrs(GetFrs::new(
            record_id,
            frs::MAX_FRS_WORDS as u16,
            true,
        )))? {
            Op::GetFrs(get) => get.metadata.ok_or(Error::Hub),
            _ => unreachable!(),
        }
    }

    /// Reads the hub's error log at `severity` and below into `records`,
    /// returning how many were stored.
    pub fn errors(&mut self, severity: u8, records: &mut [ErrorRecord]) -> Result<usize, Error> {
        let max = cmp::min(records.len(), MAX_ERROR_RECORDS);
        match self.run_op(Op::GetErrors {
            seq: 0,
            severity,
            max,
            records: Vec::new(),
        })? {
            Op::GetErrors { records: read, .. } => {
                records[..read.len()].copy_from_slice(&read);
                Ok(read.len())
            }
            _ => unreachable!(),
        }
    }

    /// Queries the event counters of `sensor`.
    pub fn counts(&mut self, sensor: SensorId) -> Result<Counts, Error> {
        match self.run_op(Op::GetCounts {
            seq: 0,
            sensor,
            counts: Counts::default(),
        })? {
            Op::GetCounts { counts, .. } => Ok(counts),
            _ => unreachable!(),
        }
    }

    /// Clears the event counters of `sensor`.
    pub fn clear_counts(&mut self, sensor: SensorId) -> Result<(), Error> {
        let mut p = [0; 9];
        p[0] = reports::COUNTS_CLEAR_COUNTS;
        p[1] = sensor.into();
        self.send_command(reports::CMD_COUNTS, p)
    }

    /// Re-initializes the sensor hub.
    pub fn reinitialize(&mut self) -> Result<(), Error> {
        self.run_op(Op::Reinit { seq: 0 })?;
        Ok(())
    }

    /// Saves dynamic calibration data to the hub's flash now.
    pub fn save_dcd_now(&mut self) -> Result<(), Error> {
        self.run_op(Op::SaveDcdNow { seq: 0 })?;
        Ok(())
    }

    /// Queries which oscillator the hub runs from.
    pub fn osc_type(&mut self) -> Result<OscType, Error> {
        match self.run_op(Op::GetOscType { seq: 0, osc: OscType::Internal })? {
            Op::GetOscType { osc, .. } => Ok(osc),
            _ => unreachable!(),
        }
    }

    /// Enables dynamic calibration for the given sensors and disables it for
    /// the rest.
    pub fn configure_calibration(&mut self, sensors: CalSensors) -> Result<(), Error> {
        self.run_op(Op::CalConfig { seq: 0, sensors })?;
        Ok(())
    }

    /// Aligns the rotation-vector synchronization to now.
    pub fn sync_rv_now(&mut self) -> Result<(), Error> {
        self.send_command1(reports::CMD_SYNC, reports::SYNC_SYNC_NOW)
    }

    /// Enables or disables external rotation-vector synchronization.
    pub fn set_ext_sync(&mut self, enabled: bool) -> Result<(), Error> {
        self.send_command1(
            reports::CMD_SYNC,
            if enabled {
                reports::SYNC_ENABLE_EXT_SYNC
            } else {
                reports::SYNC_DISABLE_EXT_SYNC
            },
        )
    }

    /// Enables or disables automatic saving of dynamic calibration data.
    pub fn set_dcd_auto_save(&mut self, enabled: bool) -> Result<(), Error> {
        self.send_command1(reports::CMD_DCD_SAVE, if enabled { 0 } else { 1 })
    }

    /// Flushes the FIFO of `sensor`, waiting for the hub's confirmation.
    pub fn flush(&mut self, sensor: SensorId) -> Result<(), Error> {
        self.run_op(Op::ForceFlush { sensor })?;
        Ok(())
    }

    /// Tares the given axes against `basis` now.
    pub fn tare_now(&mut self, axes: TareAxes, basis: TareBasis) -> Result<(), Error> {
        let mut p = [0; 9];
        p[0] = reports::TARE_TARE_NOW;
        p[1] = axes.bits();
        p[2] = basis as u8;
        self.send_command(reports::CMD_TARE, p)
    }

    /// Persists the current tare to flash.
    pub fn persist_tare(&mut self) -> Result<(), Error> {
        self.send_command1(reports::CMD_TARE, reports::TARE_PERSIST_TARE)
    }

    /// Clears the tare, restoring the identity reorientation.
    pub fn clear_tare(&mut self) -> Result<(), Error> {
        self.send_command1(reports::CMD_TARE, reports::TARE_SET_REORIENTATION)
    }

    /// Reorients the hub's rotation vector by a fixed quaternion.
    pub fn set_reorientation(&mut self, orientation: &Quaternion) -> Result<(), Error> {
        let mut p = [0; 9];
        p[0] = reports::TARE_SET_REORIENTATION;
        p[1..3].copy_from_slice(&to_q14(orientation.x).to_le_bytes());
        p[3..5].copy_from_slice(&to_q14(orientation.y).to_le_bytes());
        p[5..7].copy_from_slice(&to_q14(orientation.z).to_le_bytes());
        p[7..9].copy_from_slice(&to_q14(orientation.w).to_le_bytes());
        self.send_command(reports::CMD_TARE, p)
    }

    /// Fires a command whose only parameter is `p0`.
    fn send_command1(&mut self, command: u8, p0: u8) -> Result<(), Error> {
        let mut p = [0; 9];
        p[0] = p0;
        self.send_command(command, p)
    }

    /// Fires a command and completes once it is on the wire.
    fn send_command(&mut self, command: u8, p: [u8; 9]) -> Result<(), Error> {
        let req = CommandReq {
            seq: self.session.alloc_cmd_seq(),
            command,
            p,
        };
        self.run_op(Op::SendCmd { req })?;
        Ok(())
    }

    /// Runs one operation to completion, pumping the receive path while it
    /// is pending.
    fn run_op(&mut self, mut op: Op) -> Result<Op, Error> {
        if self.session.op.is_some() {
            return Err(Error::OpInProgress);
        }
        self.session.op_result = None;

        match op.start(&mut self.session, &mut self.transport, &mut self.hal)? {
            Outcome::Done(status) => return status.map(|()| op),
            Outcome::Pending => {}
        }

        self.session.op = Some(op);
        loop {
            if let Some(status) = self.session.op_result.take() {
                let op = self.session.op.take().unwrap();
                return status.map(|()| op);
            }
            if let Err(e) = self.service() {
                // The wait failed (eg. a HAL timeout); the operation is
                // abandoned.
                self.session.op = None;
                return Err(e);
            }
        }
    }

    /// Routes one completed cargo to its handler.
    fn deliver(&mut self, delivery: Delivery<Handler>) {
        let payload = self.rx.payload();
        match delivery.target {
            Endpoint::Transport => {
                let session = &mut self.session;
                self.transport.process_command(payload, &mut |handler, tag, value| {
                    session.on_advert(handler, tag, value)
                });
                // With the advertisement processed, the control channel can
                // be resolved by name.
                if self.session.advert_done && self.session.control_chan.is_none() {
                    self.session.control_chan = self.transport.channel_no("sensorhub", "control");
                }
            }
            Endpoint::App(Handler::Control) => {
                self.session
                    .on_control(payload, &mut self.transport, &mut self.hal, &mut self.client)
            }
            Endpoint::App(Handler::InputNormal) | Endpoint::App(Handler::InputWake) => {
                self.session
                    .on_input(payload, delivery.timestamp_us, &mut self.client)
            }
            Endpoint::App(Handler::InputGyroRv) => {
                self.session
                    .on_input_gyro_rv(payload, delivery.timestamp_us, &mut self.client)
            }
            Endpoint::App(Handler::Device) => self.session.on_device(payload, &mut self.client),
            Endpoint::App(Handler::SensorHubAdvert) | Endpoint::App(Handler::ExecutableAdvert) => {
                // Advert tokens never bind to a channel.
            }
        }
    }

    /// Delivers the one-time reset notification once the hub has both
    /// restarted and finished advertising.
    fn notify_reset(&mut self) {
        if self.session.advert_done
            && self.session.got_init_resp
            && !self.session.called_reset_callback
        {
            self.session.called_reset_callback = true;
            self.client.async_event(AsyncEvent::Reset);
        }
    }
}

/// Q-point 14 fixed-point conversion used by the tare commands.
fn to_q14(x: f32) -> i16 {
    (x * (2 << 14) as f32) as i16
}

fn bounded_version(s: &str) -> String<MAX_VERSION_LEN> {
    let mut version = String::new();
    for c in s.chars() {
        if version.push(c).is_err() {
            break;
        }
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{frame, hub_advertisement, RecordingClient, ScriptedHal};
    use std::vec::Vec as StdVec;

    const CONTROL: u8 = 2;

    /// A hub that has been reset and has processed its advertisement.
    fn hub() -> SensorHub<ScriptedHal, RecordingClient> {
        let mut hal = ScriptedHal::new();
        hal.push_transfer(&frame(0, 0, &hub_advertisement()), 0);
        let mut hub = SensorHub::new(hal, RecordingClient::default()).unwrap();
        hub.service().unwrap();
        hub
    }

    fn command_resp(command_seq: u8, command: u8, resp_seq: u8, r: [u8; 11]) -> StdVec<u8> {
        let mut v = std::vec![reports::COMMAND_RESP, 0, command, command_seq, resp_seq];
        v.extend_from_slice(&r);
        v
    }

    fn prod_id_resp(major: u8) -> StdVec<u8> {
        let mut v = std::vec![reports::PROD_ID_RESP, 1, major, 0];
        v.extend_from_slice(&0x2734_5678u32.to_le_bytes());
        v.extend_from_slice(&0x42u32.to_le_bytes());
        v.extend_from_slice(&7u16.to_le_bytes());
        v.extend_from_slice(&[0, 0]);
        v
    }

    fn frs_read_resp(data_len: u8, status: u8, offset: u16, d0: u32, d1: u32) -> StdVec<u8> {
        let mut v = std::vec![reports::FRS_READ_RESP, (data_len << 4) | status];
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&d0.to_le_bytes());
        v.extend_from_slice(&d1.to_le_bytes());
        v.extend_from_slice(&0x1F1Fu16.to_le_bytes());
        v.extend_from_slice(&[0, 0]);
        v
    }

    fn frs_write_resp(status: u8, offset: u16) -> StdVec<u8> {
        let mut v = std::vec![reports::FRS_WRITE_RESP, status];
        v.extend_from_slice(&offset.to_le_bytes());
        v
    }

    #[test]
    fn startup_processes_advertisement() {
        let hub = hub();
        assert!(hub.advertisement_done());
        assert_eq!(hub.version(), "1.1.0");
        assert_eq!(hub.session.control_chan, Some(CONTROL));
        assert_eq!(hub.session.report_lens.len_of(0xF1), 16);
        // Nothing was transmitted during startup.
        assert!(hub.hal.sent.is_empty());
        assert_eq!(hub.hal.resets, [false]);
    }

    #[test]
    fn operations_fail_before_advertisement() {
        let hal = ScriptedHal::new();
        let mut hub = SensorHub::new(hal, RecordingClient::default()).unwrap();
        assert_eq!(hub.reinitialize(), Err(Error::BadParam));
    }

    #[test]
    fn product_id_query() {
        let mut hub = hub();
        let mut cargo = StdVec::new();
        for major in 0..4 {
            cargo.extend_from_slice(&prod_id_resp(major));
        }
        hub.hal.push_transfer(&frame(CONTROL, 0, &cargo), 0);

        let ids = hub.product_ids().unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[2].sw_version_major, 2);
        assert_eq!(ids[0].sw_part_number, 0x2734_5678);
        assert_eq!(hub.hal.sent[0], &[0x06, 0x00, CONTROL, 0x00, 0xF9, 0x00][..]);
    }

    #[test]
    fn get_counts_two_part_response() {
        let mut hub = hub();
        let mut r0 = [0u8; 11];
        r0[3..7].copy_from_slice(&100u32.to_le_bytes());
        r0[7..11].copy_from_slice(&90u32.to_le_bytes());
        let mut r1 = [0u8; 11];
        r1[3..7].copy_from_slice(&80u32.to_le_bytes());
        r1[7..11].copy_from_slice(&70u32.to_le_bytes());

        // A stale response with a foreign command sequence is ignored.
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &command_resp(0x55, reports::CMD_COUNTS, 1, r1)), 0);
        hub.hal
            .push_transfer(&frame(CONTROL, 1, &command_resp(0, reports::CMD_COUNTS, 0, r0)), 0);
        hub.hal
            .push_transfer(&frame(CONTROL, 2, &command_resp(0, reports::CMD_COUNTS, 1, r1)), 0);

        let counts = hub.counts(SensorId::Accelerometer).unwrap();
        assert_eq!(
            counts,
            Counts { offered: 100, accepted: 90, on: 80, attempted: 70 }
        );
        assert_eq!(
            hub.hal.sent[0][4..],
            [0xF2, 0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn sensor_events_flow_while_operation_waits() {
        let mut hub = hub();
        let mut input = std::vec![0xFBu8];
        input.extend_from_slice(&0u32.to_le_bytes());
        input.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        hub.hal.push_transfer(&frame(3, 0, &input), 5000);

        let mut r = [0u8; 11];
        r[3..7].copy_from_slice(&1u32.to_le_bytes());
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &command_resp(0, reports::CMD_COUNTS, 0, r)), 0);
        hub.hal
            .push_transfer(&frame(CONTROL, 1, &command_resp(0, reports::CMD_COUNTS, 1, r)), 0);

        hub.counts(SensorId::Accelerometer).unwrap();
        assert_eq!(hub.client_mut().sensor.len(), 1);
        assert_eq!(hub.client_mut().sensor[0].0, SensorId::Accelerometer);
        assert_eq!(hub.client_mut().sensor[0].1, 5000);
    }

    #[test]
    fn sensor_config_roundtrip() {
        let mut hub = hub();
        let config = SensorConfig {
            wakeup_enabled: true,
            change_sensitivity: 5,
            report_interval_us: 10_000,
            ..SensorConfig::default()
        };
        hub.set_sensor_config(SensorId::GameRotationVector, &config).unwrap();
        assert_eq!(hub.hal.sent[0][4..7], [0xFD, 0x08, 0x04]);

        // A response for some other sensor must not complete the get.
        let mut other = std::vec![reports::GET_FEATURE_RESP, 0x05, 0x00];
        other.extend_from_slice(&[0; 14]);
        let mut resp = std::vec![reports::GET_FEATURE_RESP, 0x08, 0x04];
        resp.extend_from_slice(&5u16.to_le_bytes());
        resp.extend_from_slice(&10_000u32.to_le_bytes());
        resp.extend_from_slice(&0u32.to_le_bytes());
        resp.extend_from_slice(&0u32.to_le_bytes());
        hub.hal.push_transfer(&frame(CONTROL, 0, &other), 0);
        hub.hal.push_transfer(&frame(CONTROL, 1, &resp), 0);

        let read = hub.sensor_config(SensorId::GameRotationVector).unwrap();
        assert_eq!(read, config);
    }

    #[test]
    fn frs_read_accumulates_words() {
        let mut hub = hub();
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &frs_read_resp(2, 0, 0, 11, 22)), 0);
        // RecordCompleted on the final pair.
        hub.hal
            .push_transfer(&frame(CONTROL, 1, &frs_read_resp(2, 3, 2, 33, 44)), 0);

        let mut words = [0u32; 8];
        let n = hub.read_frs(0x1F1F, &mut words).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&words[..4], &[11, 22, 33, 44]);
        assert_eq!(hub.hal.sent[0][4..], [0xF4, 0, 0, 0, 0x1F, 0x1F, 8, 0]);
    }

    #[test]
    fn frs_read_failure_statuses() {
        let mut hub = hub();
        let mut words = [0u32; 8];

        // Busy fails the read.
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &frs_read_resp(0, 2, 0, 0, 0)), 0);
        assert_eq!(hub.read_frs(0x1F1F, &mut words), Err(Error::Hub));

        // An empty record reads zero words.
        hub.hal
            .push_transfer(&frame(CONTROL, 1, &frs_read_resp(0, 5, 0, 0, 0)), 0);
        assert_eq!(hub.read_frs(0x1F1F, &mut words), Ok(0));
    }

    #[test]
    fn metadata_revision_2_decode() {
        let mut hub = hub();
        let words: [u32; 13] = [
            0x0003_0201,
            0x0010_0000,
            0x0000_ABCD,
            0x0002_0100,
            1000,
            0,
            0x000A_0000,
            0x0002_000A,
            0x0000_0004,
            0xDDCC_BBAA,
            0x6463_6261,
            0x6867_6665,
            0x0000_6A69,
        ];
        let mut seq = 0;
        for pair in words.chunks(2) {
            let offset = seq * 2;
            let last = (offset as usize + pair.len()) == words.len();
            let status = if last { 3 } else { 0 };
            let d1 = pair.get(1).copied().unwrap_or(0);
            hub.hal.push_transfer(
                &frame(
                    CONTROL,
                    seq as u8,
                    &frs_read_resp(pair.len() as u8, status, offset, pair[0], d1),
                ),
                0,
            );
            seq += 1;
        }

        let meta = hub.metadata(SensorId::RotationVector).unwrap();
        assert_eq!(meta.revision, 2);
        assert_eq!(meta.power_ma, 0x0100);
        assert_eq!(meta.min_period_us, 1000);
        assert_eq!(meta.q_point1, 0x000A);
        assert_eq!(meta.q_point2, 0x0002);
        assert_eq!(&meta.sensor_specific[..], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&meta.vendor_id[..], b"abcdefghij");
        // The read requested the metadata record with the full block size.
        assert_eq!(hub.hal.sent[0][4..], [0xF4, 0, 0, 0, 0x0B, 0xE3, 72, 0]);
    }

    #[test]
    fn frs_write_streams_words() {
        let mut hub = hub();
        hub.hal.push_transfer(&frame(CONTROL, 0, &frs_write_resp(4, 0)), 0); // ready
        hub.hal.push_transfer(&frame(CONTROL, 1, &frs_write_resp(0, 2)), 0); // received
        hub.hal.push_transfer(&frame(CONTROL, 2, &frs_write_resp(3, 3)), 0); // completed

        hub.write_frs(0x7979, &[0xA1, 0xA2, 0xA3]).unwrap();

        assert_eq!(hub.hal.sent[0][4..], [0xF7, 0, 3, 0, 0x79, 0x79]);
        assert_eq!(
            hub.hal.sent[1][4..],
            [0xF6, 0, 0, 0, 0xA1, 0, 0, 0, 0xA2, 0, 0, 0]
        );
        assert_eq!(
            hub.hal.sent[2][4..],
            [0xF6, 0, 2, 0, 0xA3, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn frs_write_failure() {
        let mut hub = hub();
        hub.hal.push_transfer(&frame(CONTROL, 0, &frs_write_resp(5, 0)), 0); // failed
        assert_eq!(hub.write_frs(0x7979, &[1]), Err(Error::Hub));
        assert_eq!(hub.write_frs(0x7979, &[]), Err(Error::BadParam));
    }

    #[test]
    fn error_log_reads_until_terminator() {
        let mut hub = hub();
        let mut cargo = StdVec::new();
        let mut r = [0u8; 11];
        r[..6].copy_from_slice(&[1, 0, 3, 4, 5, 6]);
        cargo.extend_from_slice(&command_resp(0, reports::CMD_ERRORS, 0, r));
        r[..6].copy_from_slice(&[2, 1, 9, 8, 7, 6]);
        cargo.extend_from_slice(&command_resp(0, reports::CMD_ERRORS, 1, r));
        let mut terminator = [0u8; 11];
        terminator[2] = 255;
        cargo.extend_from_slice(&command_resp(0, reports::CMD_ERRORS, 2, terminator));
        hub.hal.push_transfer(&frame(CONTROL, 0, &cargo), 0);

        let mut records = [ErrorRecord::default(); 8];
        let n = hub.errors(1, &mut records).unwrap();
        assert_eq!(n, 2);
        assert_eq!(records[0].source, 3);
        assert_eq!(records[1].severity, 2);
        // The request carried the severity parameter.
        assert_eq!(hub.hal.sent[0][4..7], [0xF2, 0, 1]);
        assert_eq!(hub.hal.sent[0][7], 1);
    }

    #[test]
    fn reinitialize_reports_hub_failure() {
        let mut hub = hub();
        let mut r = [0u8; 11];
        r[0] = 1;
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &command_resp(0, reports::CMD_INITIALIZE, 0, r)), 0);
        assert_eq!(hub.reinitialize(), Err(Error::Hub));

        hub.hal
            .push_transfer(&frame(CONTROL, 1, &command_resp(1, reports::CMD_INITIALIZE, 0, [0; 11])), 0);
        assert_eq!(hub.reinitialize(), Ok(()));
    }

    #[test]
    fn flush_matches_sensor() {
        let mut hub = hub();
        hub.hal.push_transfer(
            &frame(CONTROL, 0, &[reports::FLUSH_COMPLETED, SensorId::Gravity.into()]),
            0,
        );
        hub.hal.push_transfer(
            &frame(CONTROL, 1, &[reports::FLUSH_COMPLETED, SensorId::Accelerometer.into()]),
            0,
        );
        assert_eq!(hub.flush(SensorId::Accelerometer), Ok(()));
        assert_eq!(hub.hal.sent[0][4..], [0xF0, 0x01]);
    }

    #[test]
    fn osc_type_query() {
        let mut hub = hub();
        let mut r = [0u8; 11];
        r[0] = 1;
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &command_resp(0, reports::CMD_GET_OSC_TYPE, 0, r)), 0);
        assert_eq!(hub.osc_type(), Ok(OscType::ExternalCrystal));
    }

    #[test]
    fn fire_and_forget_commands_complete_on_tx() {
        let mut hub = hub();
        // No scripted responses at all: completion happens on transmit.
        hub.tare_now(TareAxes::Z, TareBasis::RotationVector).unwrap();
        hub.persist_tare().unwrap();
        hub.clear_tare().unwrap();
        hub.sync_rv_now().unwrap();
        hub.set_ext_sync(true).unwrap();
        hub.set_dcd_auto_save(false).unwrap();
        hub.clear_counts(SensorId::Gravity).unwrap();

        // tare_now carried axes and basis, with sequence number 0.
        assert_eq!(hub.hal.sent[0][4..9], [0xF2, 0, 3, 0, 4]);
        // Command sequence numbers increment per request.
        assert_eq!(hub.hal.sent[1][5], 1);
        assert_eq!(hub.hal.sent[6][5], 6);
        // DCD auto-save disabled encodes as parameter 1.
        assert_eq!(hub.hal.sent[5][4..8], [0xF2, 5, 9, 1]);
    }

    #[test]
    fn reorientation_packs_q14() {
        let mut hub = hub();
        let q = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: -0.5 };
        hub.set_reorientation(&q).unwrap();
        let sent = &hub.hal.sent[0][4..];
        assert_eq!(sent[..4], [0xF2, 0, 3, 2]);
        // x, y zero; z = -0.5 in Q14 (as the hub consumes it); w saturates.
        assert_eq!(sent[4..8], [0, 0, 0, 0]);
        assert_eq!(&sent[8..10], &(-16384i16).to_le_bytes());
        assert_eq!(&sent[10..12], &i16::MAX.to_le_bytes());
    }

    #[test]
    fn one_operation_at_a_time() {
        let mut hub = hub();
        hub.session.op = Some(Op::Reinit { seq: 0 });
        assert_eq!(hub.reinitialize(), Err(Error::OpInProgress));
        hub.session.op = None;
    }

    #[test]
    fn hal_timeout_abandons_operation() {
        let mut hub = hub();
        // No scripted response: the wait runs dry.
        assert_eq!(hub.reinitialize(), Err(Error::Timeout));
        assert!(hub.session.op.is_none());

        // The slot is free again.
        hub.hal
            .push_transfer(&frame(CONTROL, 0, &command_resp(1, reports::CMD_INITIALIZE, 0, [0; 11])), 0);
        assert_eq!(hub.reinitialize(), Ok(()));
    }

    #[test]
    fn unsolicited_frs_change_event() {
        let mut hub = hub();
        let mut r = [0u8; 11];
        r[1] = 0x34;
        r[2] = 0x12;
        hub.hal.push_transfer(
            &frame(
                CONTROL,
                0,
                &command_resp(9, reports::CMD_FRS | reports::INIT_UNSOLICITED, 0, r),
            ),
            0,
        );
        hub.service().unwrap();
        assert_eq!(
            hub.client_mut().events,
            [AsyncEvent::FrsChange { record_id: 0x1234 }]
        );
    }

    #[test]
    fn executable_reset_event() {
        let mut hub = hub();
        hub.hal.push_transfer(&frame(1, 0, &[EXEC_RESP_RESET_COMPLETE]), 0);
        hub.service().unwrap();
        assert_eq!(hub.client_mut().events, [AsyncEvent::Reset]);

        hub.hal.push_transfer(&frame(1, 1, &[9]), 0);
        hub.service().unwrap();
        hub.hal.push_transfer(&frame(1, 2, &[1, 2]), 0);
        hub.service().unwrap();
        assert_eq!(hub.stats().exec_bad_payload, 2);
        assert_eq!(hub.client_mut().events.len(), 1);
    }

    #[test]
    fn startup_reset_notification_fires_once() {
        let mut hub = hub();
        let mut r = [0u8; 11];
        r[1] = reports::INIT_SYSTEM;
        let unsolicited = command_resp(
            0,
            reports::CMD_INITIALIZE | reports::INIT_UNSOLICITED,
            0,
            r,
        );
        hub.hal.push_transfer(&frame(CONTROL, 0, &unsolicited), 0);
        hub.service().unwrap();
        assert_eq!(hub.client_mut().events, [AsyncEvent::Reset]);

        hub.hal.push_transfer(&frame(CONTROL, 1, &unsolicited), 0);
        hub.service().unwrap();
        assert_eq!(hub.client_mut().events.len(), 1);
    }
}
