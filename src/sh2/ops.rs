//! The request/response operation state machines.
//!
//! Each client API call maps to one [`Op`]: a request composed at start, and
//! a receive step that inspects every control-channel report until it has
//! seen the one(s) addressed to it. Reports that do not belong to the active
//! operation (wrong report id, wrong command, wrong command sequence) are
//! ignored without comment, since the control channel carries unsolicited
//! traffic interleaved with responses.

use super::frs::{self, FrsReadStatus, FrsWriteStatus, SensorMetadata, MAX_FRS_WORDS};
use super::reports::{
    self, CommandReq, CommandResp, FlushCompleted, ForceFlushReq, FrsReadReq, FrsReadResp,
    FrsWriteDataReq, FrsWriteReq, FrsWriteResp, GetFeatureReq, GetFeatureResp, ProdIdReq,
    ProdIdResp, SensorConfig, SetFeatureCmd,
};
use super::{
    CalSensors, Counts, ErrorRecord, Handler, OscType, ProductId, SensorId, Session,
    MAX_ERROR_RECORDS, NUM_PROD_ID_ENTRIES,
};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::hal::Hal;
use crate::transport::Shtp;
use crate::Error;
use heapless::Vec;

/// Resolution of one operation step.
pub(crate) enum Outcome {
    /// Keep waiting for reports.
    Pending,
    /// The operation finished with the given status.
    Done(Result<(), Error>),
}

/// State of an FRS read in progress.
pub(crate) struct GetFrs {
    pub frs_type: u16,
    pub want_metadata: bool,
    max_words: u16,
    words: [u32; MAX_FRS_WORDS],
    last_offset: u16,
    count: u16,
    pub metadata: Option<SensorMetadata>,
}

impl GetFrs {
    pub fn new(frs_type: u16, max_words: u16, want_metadata: bool) -> Self {
        GetFrs {
            frs_type,
            want_metadata,
            max_words,
            words: [0; MAX_FRS_WORDS],
            last_offset: 0,
            count: 0,
            metadata: None,
        }
    }

    /// Words read from the record, valid once the operation completed.
    pub fn words(&self) -> &[u32] {
        &self.words[..usize::from(self.count)]
    }
}

/// State of an FRS write in progress.
pub(crate) struct SetFrs {
    pub frs_type: u16,
    pub data: Vec<u32, MAX_FRS_WORDS>,
    offset: u16,
}

impl SetFrs {
    pub fn new(frs_type: u16, data: Vec<u32, MAX_FRS_WORDS>) -> Self {
        SetFrs { frs_type, data, offset: 0 }
    }
}

/// The active operation and its state.
pub(crate) enum Op {
    /// Fire a command and complete as soon as it is on the wire.
    SendCmd { req: CommandReq },
    ProductIds { ids: Vec<ProductId, NUM_PROD_ID_ENTRIES> },
    GetSensorConfig { sensor: SensorId, config: Option<SensorConfig> },
    SetSensorConfig { sensor: SensorId, config: SensorConfig },
    GetFrs(GetFrs),
    SetFrs(SetFrs),
    GetErrors {
        seq: u8,
        severity: u8,
        max: usize,
        records: Vec<ErrorRecord, MAX_ERROR_RECORDS>,
    },
    GetCounts { seq: u8, sensor: SensorId, counts: Counts },
    Reinit { seq: u8 },
    SaveDcdNow { seq: u8 },
    CalConfig { seq: u8, sensors: CalSensors },
    ForceFlush { sensor: SensorId },
    GetOscType { seq: u8, osc: OscType },
}

fn parse<'a, T: FromBytes<'a>>(report: &'a [u8]) -> Option<T> {
    T::from_bytes(&mut ByteReader::new(report)).ok()
}

fn command_u32(r: &[u8; 11], at: usize) -> u32 {
    u32::from_le_bytes([r[at], r[at + 1], r[at + 2], r[at + 3]])
}

impl Op {
    /// Composes and sends the request, then resolves the tx-complete step.
    ///
    /// An error here means the operation never started; the caller must not
    /// wait for it.
    pub(crate) fn start<H: Hal>(
        &mut self,
        session: &mut Session,
        shtp: &mut Shtp<Handler>,
        hal: &mut H,
    ) -> Result<Outcome, Error> {
        let Some(control) = session.control_chan else {
            // No advertisement yet, so no control channel to talk on.
            return Err(Error::BadParam);
        };

        let mut buf = [0; 20];
        let buf_len = buf.len();
        let mut writer = ByteWriter::new(&mut buf);
        match self {
            Op::SendCmd { req } => req.to_bytes(&mut writer)?,
            Op::ProductIds { .. } => ProdIdReq.to_bytes(&mut writer)?,
            Op::GetSensorConfig { sensor, .. } => {
                GetFeatureReq { feature_report_id: u8::from(*sensor) }.to_bytes(&mut writer)?
            }
            Op::SetSensorConfig { sensor, config } => SetFeatureCmd {
                feature_report_id: u8::from(*sensor),
                config: &*config,
            }
            .to_bytes(&mut writer)?,
            Op::GetFrs(get) => FrsReadReq {
                read_offset: 0,
                frs_type: get.frs_type,
                block_size: get.max_words,
            }
            .to_bytes(&mut writer)?,
            Op::SetFrs(set) => {
                set.offset = 0;
                FrsWriteReq {
                    length: set.data.len() as u16,
                    frs_type: set.frs_type,
                }
                .to_bytes(&mut writer)?
            }
            Op::GetErrors { seq, severity, .. } => {
                *seq = session.alloc_cmd_seq();
                let mut p = [0; 9];
                p[0] = *severity;
                CommandReq { seq: *seq, command: reports::CMD_ERRORS, p }.to_bytes(&mut writer)?
            }
            Op::GetCounts { seq, sensor, .. } => {
                *seq = session.alloc_cmd_seq();
                let mut p = [0; 9];
                p[0] = reports::COUNTS_GET_COUNTS;
                p[1] = u8::from(*sensor);
                CommandReq { seq: *seq, command: reports::CMD_COUNTS, p }.to_bytes(&mut writer)?
            }
            Op::Reinit { seq } => {
                *seq = session.alloc_cmd_seq();
                let mut p = [0; 9];
                p[0] = reports::INIT_SYSTEM;
                CommandReq { seq: *seq, command: reports::CMD_INITIALIZE, p }
                    .to_bytes(&mut writer)?
            }
            Op::SaveDcdNow { seq } => {
                *seq = session.alloc_cmd_seq();
                CommandReq { seq: *seq, command: reports::CMD_DCD, p: [0; 9] }
                    .to_bytes(&mut writer)?
            }
            Op::CalConfig { seq, sensors } => {
                *seq = session.alloc_cmd_seq();
                let mut p = [0; 9];
                p[0] = sensors.contains(CalSensors::ACCEL) as u8;
                p[1] = sensors.contains(CalSensors::GYRO) as u8;
                p[2] = sensors.contains(CalSensors::MAG) as u8;
                p[4] = sensors.contains(CalSensors::PLANAR) as u8;
                CommandReq { seq: *seq, command: reports::CMD_ME_CAL, p }.to_bytes(&mut writer)?
            }
            Op::ForceFlush { sensor } => {
                ForceFlushReq { sensor_id: u8::from(*sensor) }.to_bytes(&mut writer)?
            }
            Op::GetOscType { seq, .. } => {
                *seq = session.alloc_cmd_seq();
                CommandReq { seq: *seq, command: reports::CMD_GET_OSC_TYPE, p: [0; 9] }
                    .to_bytes(&mut writer)?
            }
        }
        let used = buf_len - writer.space_left();
        shtp.send(hal, control, &buf[..used])?;
        Ok(self.tx_done())
    }

    /// The request reached the wire.
    fn tx_done(&self) -> Outcome {
        match self {
            // Fire-and-forget operations are done once sent.
            Op::SendCmd { .. } | Op::SetSensorConfig { .. } => Outcome::Done(Ok(())),
            _ => Outcome::Pending,
        }
    }

    /// Offers one control-channel report to the operation.
    pub(crate) fn rx<H: Hal>(
        &mut self,
        report: &[u8],
        control: u8,
        shtp: &mut Shtp<Handler>,
        hal: &mut H,
    ) -> Outcome {
        match self {
            Op::SendCmd { .. } | Op::SetSensorConfig { .. } => Outcome::Pending,

            Op::ProductIds { ids } => {
                let Some(resp) = parse::<ProdIdResp>(report) else {
                    return Outcome::Pending;
                };
                let _ = ids.push(ProductId {
                    reset_cause: resp.reset_cause,
                    sw_version_major: resp.sw_ver_major,
                    sw_version_minor: resp.sw_ver_minor,
                    sw_part_number: resp.sw_part_number,
                    sw_build_number: resp.sw_build_number,
                    sw_version_patch: resp.sw_ver_patch,
                });
                if ids.is_full() {
                    Outcome::Done(Ok(()))
                } else {
                    Outcome::Pending
                }
            }

            Op::GetSensorConfig { sensor, config } => {
                let Some(resp) = parse::<GetFeatureResp>(report) else {
                    return Outcome::Pending;
                };
                if resp.feature_report_id != u8::from(*sensor) {
                    return Outcome::Pending;
                }
                *config = Some(resp.config);
                Outcome::Done(Ok(()))
            }

            Op::GetFrs(get) => {
                let Some(resp) = parse::<FrsReadResp>(report) else {
                    return Outcome::Pending;
                };
                let status = FrsReadStatus::from(resp.status());
                match status {
                    FrsReadStatus::UnrecognizedFrsType
                    | FrsReadStatus::Busy
                    | FrsReadStatus::OffsetOutOfRange
                    | FrsReadStatus::DeviceError => return Outcome::Done(Err(Error::Hub)),
                    FrsReadStatus::RecordEmpty => {
                        get.count = 0;
                        return Outcome::Done(Ok(()));
                    }
                    _ => {}
                }

                let max = usize::from(get.max_words).min(MAX_FRS_WORDS);
                let offset = usize::from(resp.word_offset);
                if offset < max {
                    get.words[offset] = resp.data0;
                    get.last_offset = resp.word_offset;
                }
                if resp.data_len() == 2 && offset + 1 < max {
                    get.words[offset + 1] = resp.data1;
                    get.last_offset = resp.word_offset + 1;
                }

                match status {
                    FrsReadStatus::RecordCompleted
                    | FrsReadStatus::BlockCompleted
                    | FrsReadStatus::BlockAndRecordCompleted => {
                        get.count = get.last_offset + 1;
                        if get.want_metadata {
                            let metadata = frs::decode_metadata(get.words());
                            get.metadata = Some(metadata);
                        }
                        Outcome::Done(Ok(()))
                    }
                    _ => Outcome::Pending,
                }
            }

            Op::SetFrs(set) => {
                let Some(resp) = parse::<FrsWriteResp>(report) else {
                    return Outcome::Pending;
                };
                let mut send_more = false;
                let mut completed = None;
                match FrsWriteStatus::from(resp.status) {
                    FrsWriteStatus::Received | FrsWriteStatus::Ready => send_more = true,
                    FrsWriteStatus::WriteCompleted => completed = Some(Ok(())),
                    FrsWriteStatus::RecordValid => {
                        // That's nice, keep waiting.
                    }
                    FrsWriteStatus::UnrecognizedFrsType
                    | FrsWriteStatus::Busy
                    | FrsWriteStatus::Failed
                    | FrsWriteStatus::NotReady
                    | FrsWriteStatus::InvalidLength
                    | FrsWriteStatus::InvalidRecord
                    | FrsWriteStatus::DeviceError
                    | FrsWriteStatus::ReadOnly => completed = Some(Err(Error::Hub)),
                    FrsWriteStatus::Unknown(_) => {}
                }

                if send_more && usize::from(set.offset) < set.data.len() {
                    let offset = set.offset;
                    let mut next = usize::from(offset);
                    let data0 = set.data[next];
                    next += 1;
                    let data1 = if next < set.data.len() {
                        let word = set.data[next];
                        next += 1;
                        word
                    } else {
                        0
                    };
                    set.offset = next as u16;

                    let mut buf = [0; 12];
                    let mut writer = ByteWriter::new(&mut buf);
                    let req = FrsWriteDataReq { offset, data0, data1 };
                    if req.to_bytes(&mut writer).is_err() {
                        return Outcome::Done(Err(Error::Eof));
                    }
                    if let Err(e) = shtp.send(hal, control, &buf) {
                        return Outcome::Done(Err(e));
                    }
                }

                match completed {
                    Some(status) => Outcome::Done(status),
                    None => Outcome::Pending,
                }
            }

            Op::GetErrors { seq, records, max, .. } => {
                let Some(resp) = parse::<CommandResp>(report) else {
                    return Outcome::Pending;
                };
                if resp.command != reports::CMD_ERRORS || resp.command_seq != *seq {
                    return Outcome::Pending;
                }
                if resp.r[2] == 255 {
                    // No further errors to report.
                    return Outcome::Done(Ok(()));
                }
                if records.len() < *max {
                    let _ = records.push(ErrorRecord {
                        severity: resp.r[0],
                        sequence: resp.r[1],
                        source: resp.r[2],
                        error: resp.r[3],
                        module: resp.r[4],
                        code: resp.r[5],
                    });
                }
                Outcome::Pending
            }

            Op::GetCounts { seq, counts, .. } => {
                let Some(resp) = parse::<CommandResp>(report) else {
                    return Outcome::Pending;
                };
                if resp.command != reports::CMD_COUNTS || resp.command_seq != *seq {
                    return Outcome::Pending;
                }
                if resp.resp_seq == 0 {
                    counts.offered = command_u32(&resp.r, 3);
                    counts.accepted = command_u32(&resp.r, 7);
                } else {
                    counts.on = command_u32(&resp.r, 3);
                    counts.attempted = command_u32(&resp.r, 7);
                }
                if resp.resp_seq == 1 {
                    Outcome::Done(Ok(()))
                } else {
                    Outcome::Pending
                }
            }

            Op::Reinit { seq } => {
                command_status(report, reports::CMD_INITIALIZE, *seq)
            }

            Op::SaveDcdNow { seq } => command_status(report, reports::CMD_DCD, *seq),

            Op::CalConfig { seq, .. } => command_status(report, reports::CMD_ME_CAL, *seq),

            Op::ForceFlush { sensor } => {
                let Some(resp) = parse::<FlushCompleted>(report) else {
                    return Outcome::Pending;
                };
                if resp.sensor_id != u8::from(*sensor) {
                    return Outcome::Pending;
                }
                Outcome::Done(Ok(()))
            }

            Op::GetOscType { seq, osc } => {
                let Some(resp) = parse::<CommandResp>(report) else {
                    return Outcome::Pending;
                };
                if resp.command != reports::CMD_GET_OSC_TYPE || resp.command_seq != *seq {
                    return Outcome::Pending;
                }
                *osc = OscType::from(resp.r[0]);
                Outcome::Done(Ok(()))
            }
        }
    }
}

/// Completion rule shared by the simple command operations: match the
/// command and sequence, then fail if the hub reported a non-zero status.
fn command_status(report: &[u8], command: u8, seq: u8) -> Outcome {
    let Some(resp) = parse::<CommandResp>(report) else {
        return Outcome::Pending;
    };
    if resp.command != command || resp.command_seq != seq {
        return Outcome::Pending;
    }
    if resp.r[0] != 0 {
        Outcome::Done(Err(Error::Hub))
    } else {
        Outcome::Done(Ok(()))
    }
}
