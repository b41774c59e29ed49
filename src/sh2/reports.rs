//! Wire formats of the control-channel reports.
//!
//! Control cargos concatenate fixed-length reports; each starts with a 1-byte
//! report id, and its length comes from the table the hub advertises at
//! startup ([`ReportLengths`]). Encoders write the id themselves; decoders
//! check it and refuse payloads for a different report.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Error;
use heapless::Vec;

// Report ids on the control channel.
pub const GET_FEATURE_REQ: u8 = 0xFE;
pub const SET_FEATURE_CMD: u8 = 0xFD;
pub const GET_FEATURE_RESP: u8 = 0xFC;
pub const BASE_TIMESTAMP_REF: u8 = 0xFB;
pub const TIMESTAMP_REBASE: u8 = 0xFA;
pub const PROD_ID_REQ: u8 = 0xF9;
pub const PROD_ID_RESP: u8 = 0xF8;
pub const FRS_WRITE_REQ: u8 = 0xF7;
pub const FRS_WRITE_DATA_REQ: u8 = 0xF6;
pub const FRS_WRITE_RESP: u8 = 0xF5;
pub const FRS_READ_REQ: u8 = 0xF4;
pub const FRS_READ_RESP: u8 = 0xF3;
pub const COMMAND_REQ: u8 = 0xF2;
pub const COMMAND_RESP: u8 = 0xF1;
pub const FORCE_SENSOR_FLUSH: u8 = 0xF0;
pub const FLUSH_COMPLETED: u8 = 0xEF;

// Commands and subcommands carried by COMMAND_REQ/COMMAND_RESP.
pub const CMD_ERRORS: u8 = 1;
pub const CMD_COUNTS: u8 = 2;
pub const COUNTS_GET_COUNTS: u8 = 0;
pub const COUNTS_CLEAR_COUNTS: u8 = 1;
pub const CMD_TARE: u8 = 3;
pub const TARE_TARE_NOW: u8 = 0;
pub const TARE_PERSIST_TARE: u8 = 1;
pub const TARE_SET_REORIENTATION: u8 = 2;
pub const CMD_INITIALIZE: u8 = 4;
pub const INIT_SYSTEM: u8 = 1;
pub const INIT_UNSOLICITED: u8 = 0x80;
pub const CMD_FRS: u8 = 5;
pub const CMD_DCD: u8 = 6;
pub const CMD_ME_CAL: u8 = 7;
pub const CMD_SYNC: u8 = 8;
pub const SYNC_SYNC_NOW: u8 = 0;
pub const SYNC_ENABLE_EXT_SYNC: u8 = 1;
pub const SYNC_DISABLE_EXT_SYNC: u8 = 2;
pub const CMD_DCD_SAVE: u8 = 9;
pub const CMD_GET_OSC_TYPE: u8 = 10;

/// Number of report-length table entries the hub may advertise.
pub const MAX_REPORT_IDS: usize = 64;

bitflags::bitflags! {
    /// Flag byte of the feature reports.
    pub struct FeatureFlags: u8 {
        const CHANGE_SENSITIVITY_RELATIVE = 0x01;
        const CHANGE_SENSITIVITY_ENABLED = 0x02;
        const WAKE_ENABLED = 0x04;
        const ALWAYS_ON_ENABLED = 0x08;
    }
}

/// Configuration of one sensor, as carried by the feature reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorConfig {
    pub change_sensitivity_enabled: bool,
    pub change_sensitivity_relative: bool,
    pub wakeup_enabled: bool,
    pub always_on_enabled: bool,

    /// Change-sensitivity threshold in sensor-specific units.
    pub change_sensitivity: u16,
    /// Report interval in microseconds; 0 disables the sensor.
    pub report_interval_us: u32,
    /// Batch interval in microseconds.
    pub batch_interval_us: u32,
    /// Meaning depends on the sensor.
    pub sensor_specific: u32,
}

impl SensorConfig {
    fn flags(&self) -> FeatureFlags {
        let mut flags = FeatureFlags::empty();
        flags.set(
            FeatureFlags::CHANGE_SENSITIVITY_ENABLED,
            self.change_sensitivity_enabled,
        );
        flags.set(
            FeatureFlags::CHANGE_SENSITIVITY_RELATIVE,
            self.change_sensitivity_relative,
        );
        flags.set(FeatureFlags::WAKE_ENABLED, self.wakeup_enabled);
        flags.set(FeatureFlags::ALWAYS_ON_ENABLED, self.always_on_enabled);
        flags
    }
}

/// Learned report-id → report-length table.
///
/// Populated from the sensorhub app's advertisement; length 0 means unknown
/// and terminates cargo parsing.
pub struct ReportLengths {
    entries: Vec<(u8, u8), MAX_REPORT_IDS>,
}

impl ReportLengths {
    pub const fn new() -> Self {
        ReportLengths { entries: Vec::new() }
    }

    /// Loads the table from an advertisement value of `(id, len)` pairs,
    /// replacing any earlier contents.
    pub fn load(&mut self, value: &[u8]) {
        self.entries.clear();
        for pair in value.chunks_exact(2) {
            if self.entries.push((pair[0], pair[1])).is_err() {
                warn!("report length table full, dropping id {:#04x}", pair[0]);
                break;
            }
        }
    }

    /// Length of the report `id`, or 0 if the id is unknown.
    pub fn len_of(&self, id: u8) -> u8 {
        self.entries
            .iter()
            .find(|&&(rid, _)| rid == id)
            .map(|&(_, len)| len)
            .unwrap_or(0)
    }
}

/// PROD_ID_REQ: ask for the product id reports.
pub struct ProdIdReq;

impl ToBytes for ProdIdReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(PROD_ID_REQ)?;
        writer.write_u8(0) // reserved
    }
}

/// PROD_ID_RESP: one product id entry.
pub struct ProdIdResp {
    pub reset_cause: u8,
    pub sw_ver_major: u8,
    pub sw_ver_minor: u8,
    pub sw_part_number: u32,
    pub sw_build_number: u32,
    pub sw_ver_patch: u16,
}

impl<'a> FromBytes<'a> for ProdIdResp {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != PROD_ID_RESP {
            return Err(Error::Protocol);
        }
        Ok(ProdIdResp {
            reset_cause: bytes.read_u8()?,
            sw_ver_major: bytes.read_u8()?,
            sw_ver_minor: bytes.read_u8()?,
            sw_part_number: bytes.read_u32_le()?,
            sw_build_number: bytes.read_u32_le()?,
            sw_ver_patch: bytes.read_u16_le()?,
        })
    }
}

/// GET_FEATURE_REQ: ask for one sensor's configuration.
pub struct GetFeatureReq {
    pub feature_report_id: u8,
}

impl ToBytes for GetFeatureReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(GET_FEATURE_REQ)?;
        writer.write_u8(self.feature_report_id)
    }
}

/// SET_FEATURE_CMD: configure one sensor.
pub struct SetFeatureCmd<'a> {
    pub feature_report_id: u8,
    pub config: &'a SensorConfig,
}

impl ToBytes for SetFeatureCmd<'_> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(SET_FEATURE_CMD)?;
        writer.write_u8(self.feature_report_id)?;
        writer.write_u8(self.config.flags().bits())?;
        writer.write_u16_le(self.config.change_sensitivity)?;
        writer.write_u32_le(self.config.report_interval_us)?;
        writer.write_u32_le(self.config.batch_interval_us)?;
        writer.write_u32_le(self.config.sensor_specific)
    }
}

/// GET_FEATURE_RESP: one sensor's configuration.
pub struct GetFeatureResp {
    pub feature_report_id: u8,
    pub config: SensorConfig,
}

impl<'a> FromBytes<'a> for GetFeatureResp {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != GET_FEATURE_RESP {
            return Err(Error::Protocol);
        }
        let feature_report_id = bytes.read_u8()?;
        let flags = FeatureFlags::from_bits_truncate(bytes.read_u8()?);
        Ok(GetFeatureResp {
            feature_report_id,
            config: SensorConfig {
                change_sensitivity_enabled: flags
                    .contains(FeatureFlags::CHANGE_SENSITIVITY_ENABLED),
                change_sensitivity_relative: flags
                    .contains(FeatureFlags::CHANGE_SENSITIVITY_RELATIVE),
                wakeup_enabled: flags.contains(FeatureFlags::WAKE_ENABLED),
                always_on_enabled: flags.contains(FeatureFlags::ALWAYS_ON_ENABLED),
                change_sensitivity: bytes.read_u16_le()?,
                report_interval_us: bytes.read_u32_le()?,
                batch_interval_us: bytes.read_u32_le()?,
                sensor_specific: bytes.read_u32_le()?,
            },
        })
    }
}

/// FRS_WRITE_REQ: open a record write of `length` words.
pub struct FrsWriteReq {
    pub length: u16,
    pub frs_type: u16,
}

impl ToBytes for FrsWriteReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(FRS_WRITE_REQ)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16_le(self.length)?;
        writer.write_u16_le(self.frs_type)
    }
}

/// FRS_WRITE_DATA_REQ: stream up to two words at a word offset.
pub struct FrsWriteDataReq {
    pub offset: u16,
    pub data0: u32,
    pub data1: u32,
}

impl ToBytes for FrsWriteDataReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(FRS_WRITE_DATA_REQ)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16_le(self.offset)?;
        writer.write_u32_le(self.data0)?;
        writer.write_u32_le(self.data1)
    }
}

/// FRS_WRITE_RESP: status of the write in progress.
pub struct FrsWriteResp {
    pub status: u8,
    pub word_offset: u16,
}

impl<'a> FromBytes<'a> for FrsWriteResp {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != FRS_WRITE_RESP {
            return Err(Error::Protocol);
        }
        Ok(FrsWriteResp {
            status: bytes.read_u8()?,
            word_offset: bytes.read_u16_le()?,
        })
    }
}

/// FRS_READ_REQ: read `block_size` words of a record.
pub struct FrsReadReq {
    pub read_offset: u16,
    pub frs_type: u16,
    pub block_size: u16,
}

impl ToBytes for FrsReadReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(FRS_READ_REQ)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16_le(self.read_offset)?;
        writer.write_u16_le(self.frs_type)?;
        writer.write_u16_le(self.block_size)
    }
}

/// FRS_READ_RESP: up to two record words plus read status.
pub struct FrsReadResp {
    len_status: u8,
    pub word_offset: u16,
    pub data0: u32,
    pub data1: u32,
    pub frs_type: u16,
}

impl FrsReadResp {
    /// Number of valid data words in this response (0–2).
    pub fn data_len(&self) -> u8 {
        (self.len_status >> 4) & 0x0F
    }

    /// Raw read status; see [`FrsReadStatus`].
    ///
    /// [`FrsReadStatus`]: super::frs::FrsReadStatus
    pub fn status(&self) -> u8 {
        self.len_status & 0x0F
    }
}

impl<'a> FromBytes<'a> for FrsReadResp {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != FRS_READ_RESP {
            return Err(Error::Protocol);
        }
        Ok(FrsReadResp {
            len_status: bytes.read_u8()?,
            word_offset: bytes.read_u16_le()?,
            data0: bytes.read_u32_le()?,
            data1: bytes.read_u32_le()?,
            frs_type: bytes.read_u16_le()?,
        })
    }
}

/// COMMAND_REQ: a command with its 9 parameter bytes.
#[derive(Debug, Clone)]
pub struct CommandReq {
    pub seq: u8,
    pub command: u8,
    pub p: [u8; 9],
}

impl ToBytes for CommandReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(COMMAND_REQ)?;
        writer.write_u8(self.seq)?;
        writer.write_u8(self.command)?;
        writer.write_slice(&self.p)
    }
}

/// COMMAND_RESP: response to a command, echoing its sequence number.
pub struct CommandResp {
    pub seq: u8,
    pub command: u8,
    /// Sequence number of the COMMAND_REQ this responds to.
    pub command_seq: u8,
    /// Counts multi-part responses to a single command.
    pub resp_seq: u8,
    pub r: [u8; 11],
}

impl<'a> FromBytes<'a> for CommandResp {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != COMMAND_RESP {
            return Err(Error::Protocol);
        }
        Ok(CommandResp {
            seq: bytes.read_u8()?,
            command: bytes.read_u8()?,
            command_seq: bytes.read_u8()?,
            resp_seq: bytes.read_u8()?,
            r: bytes.read_array()?,
        })
    }
}

/// FORCE_SENSOR_FLUSH: request a FIFO flush for one sensor.
pub struct ForceFlushReq {
    pub sensor_id: u8,
}

impl ToBytes for ForceFlushReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(FORCE_SENSOR_FLUSH)?;
        writer.write_u8(self.sensor_id)
    }
}

/// FLUSH_COMPLETED: the hub finished flushing one sensor.
pub struct FlushCompleted {
    pub sensor_id: u8,
}

impl<'a> FromBytes<'a> for FlushCompleted {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != FLUSH_COMPLETED {
            return Err(Error::Protocol);
        }
        Ok(FlushCompleted { sensor_id: bytes.read_u8()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &impl ToBytes) -> std::vec::Vec<u8> {
        let mut buf = [0; 32];
        let mut writer = ByteWriter::new(&mut buf);
        value.to_bytes(&mut writer).unwrap();
        let used = 32 - writer.space_left();
        buf[..used].to_vec()
    }

    #[test]
    fn command_req_layout() {
        let mut p = [0; 9];
        p[0] = COUNTS_GET_COUNTS;
        p[1] = 1;
        let req = CommandReq { seq: 7, command: CMD_COUNTS, p };
        assert_eq!(
            encode(&req),
            [0xF2, 7, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn set_feature_layout() {
        let config = SensorConfig {
            change_sensitivity_enabled: true,
            wakeup_enabled: true,
            change_sensitivity: 0x0102,
            report_interval_us: 10_000,
            batch_interval_us: 0x0A0B0C0D,
            sensor_specific: 0,
            ..SensorConfig::default()
        };
        let cmd = SetFeatureCmd { feature_report_id: 0x05, config: &config };
        assert_eq!(
            encode(&cmd),
            [
                0xFD, 0x05, 0x06, 0x02, 0x01, 0x10, 0x27, 0x00, 0x00, 0x0D, 0x0C, 0x0B, 0x0A,
                0x00, 0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn feature_resp_roundtrips_flags() {
        let raw = [
            0xFC, 0x05, 0x0F, 0x34, 0x12, 0x10, 0x27, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00,
        ];
        let resp = GetFeatureResp::from_bytes(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(resp.feature_report_id, 0x05);
        assert!(resp.config.change_sensitivity_enabled);
        assert!(resp.config.change_sensitivity_relative);
        assert!(resp.config.wakeup_enabled);
        assert!(resp.config.always_on_enabled);
        assert_eq!(resp.config.change_sensitivity, 0x1234);
        assert_eq!(resp.config.report_interval_us, 10_000);
    }

    #[test]
    fn mismatched_report_id_is_rejected() {
        let raw = [0xF0u8; 16];
        assert!(CommandResp::from_bytes(&mut ByteReader::new(&raw)).is_err());
        assert!(FrsReadResp::from_bytes(&mut ByteReader::new(&raw)).is_err());
    }

    #[test]
    fn frs_read_resp_len_status() {
        let raw = [
            0xF3, 0x23, 0x04, 0x00, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00, 0x01, 0xE3,
            0x00, 0x00,
        ];
        let resp = FrsReadResp::from_bytes(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(resp.data_len(), 2);
        assert_eq!(resp.status(), 3);
        assert_eq!(resp.word_offset, 4);
        assert_eq!(resp.data0, 0x12345678);
        assert_eq!(resp.frs_type, 0xE301);
    }

    #[test]
    fn report_length_table() {
        let mut lens = ReportLengths::new();
        lens.load(&[0xF1, 16, 0xF8, 16, 0x01, 10]);
        assert_eq!(lens.len_of(0xF1), 16);
        assert_eq!(lens.len_of(0x01), 10);
        assert_eq!(lens.len_of(0x42), 0);

        // Reloading replaces the table.
        lens.load(&[0x02, 6]);
        assert_eq!(lens.len_of(0xF1), 0);
        assert_eq!(lens.len_of(0x02), 6);
    }
}
