//! Flash Record System (FRS) records: status codes, the sensor → metadata
//! record mapping, and the revision-dependent metadata decode.

use super::SensorId;
use heapless::Vec;

/// Longest FRS record, in 32-bit words, the driver will read or write.
pub const MAX_FRS_WORDS: usize = 72;

/// Capacity for metadata vendor-id and sensor-specific byte strings.
pub const MAX_METADATA_BYTES: usize = 48;

// Metadata record ids, one per sensor.
pub const META_RAW_ACCELEROMETER: u16 = 0xE301;
pub const META_ACCELEROMETER: u16 = 0xE302;
pub const META_LINEAR_ACCELERATION: u16 = 0xE303;
pub const META_GRAVITY: u16 = 0xE304;
pub const META_RAW_GYROSCOPE: u16 = 0xE305;
pub const META_GYROSCOPE_CALIBRATED: u16 = 0xE306;
pub const META_GYROSCOPE_UNCALIBRATED: u16 = 0xE307;
pub const META_RAW_MAGNETOMETER: u16 = 0xE308;
pub const META_MAGNETIC_FIELD_CALIBRATED: u16 = 0xE309;
pub const META_MAGNETIC_FIELD_UNCALIBRATED: u16 = 0xE30A;
pub const META_ROTATION_VECTOR: u16 = 0xE30B;
pub const META_GAME_ROTATION_VECTOR: u16 = 0xE30C;
pub const META_GEOMAGNETIC_ROTATION_VECTOR: u16 = 0xE30D;
pub const META_PRESSURE: u16 = 0xE30E;
pub const META_AMBIENT_LIGHT: u16 = 0xE30F;
pub const META_HUMIDITY: u16 = 0xE310;
pub const META_PROXIMITY: u16 = 0xE311;
pub const META_TEMPERATURE: u16 = 0xE312;
pub const META_TAP_DETECTOR: u16 = 0xE313;
pub const META_STEP_DETECTOR: u16 = 0xE314;
pub const META_STEP_COUNTER: u16 = 0xE315;
pub const META_SIGNIFICANT_MOTION: u16 = 0xE316;
pub const META_STABILITY_CLASSIFIER: u16 = 0xE317;
pub const META_SHAKE_DETECTOR: u16 = 0xE318;
pub const META_FLIP_DETECTOR: u16 = 0xE319;
pub const META_PICKUP_DETECTOR: u16 = 0xE31A;
pub const META_STABILITY_DETECTOR: u16 = 0xE31B;
pub const META_PERSONAL_ACTIVITY_CLASSIFIER: u16 = 0xE31C;
pub const META_SLEEP_DETECTOR: u16 = 0xE31D;
pub const META_TILT_DETECTOR: u16 = 0xE31E;
pub const META_POCKET_DETECTOR: u16 = 0xE31F;
pub const META_CIRCLE_DETECTOR: u16 = 0xE320;

enum_with_unknown! {
    /// Status nibble of an FRS read response.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum FrsReadStatus(u8) {
        NoError = 0,
        UnrecognizedFrsType = 1,
        Busy = 2,
        RecordCompleted = 3,
        OffsetOutOfRange = 4,
        RecordEmpty = 5,
        BlockCompleted = 6,
        BlockAndRecordCompleted = 7,
        DeviceError = 8,
    }
}

enum_with_unknown! {
    /// Status byte of an FRS write response.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum FrsWriteStatus(u8) {
        Received = 0,
        UnrecognizedFrsType = 1,
        Busy = 2,
        WriteCompleted = 3,
        Ready = 4,
        Failed = 5,
        /// Data arrived while not in write mode.
        NotReady = 6,
        InvalidLength = 7,
        RecordValid = 8,
        InvalidRecord = 9,
        DeviceError = 10,
        ReadOnly = 11,
    }
}

/// Metadata record id describing `sensor`, if the hub keeps one.
pub fn metadata_record(sensor: SensorId) -> Option<u16> {
    Some(match sensor {
        SensorId::RawAccelerometer => META_RAW_ACCELEROMETER,
        SensorId::Accelerometer => META_ACCELEROMETER,
        SensorId::LinearAcceleration => META_LINEAR_ACCELERATION,
        SensorId::Gravity => META_GRAVITY,
        SensorId::RawGyroscope => META_RAW_GYROSCOPE,
        SensorId::GyroscopeCalibrated => META_GYROSCOPE_CALIBRATED,
        SensorId::GyroscopeUncalibrated => META_GYROSCOPE_UNCALIBRATED,
        SensorId::RawMagnetometer => META_RAW_MAGNETOMETER,
        SensorId::MagneticFieldCalibrated => META_MAGNETIC_FIELD_CALIBRATED,
        SensorId::MagneticFieldUncalibrated => META_MAGNETIC_FIELD_UNCALIBRATED,
        SensorId::RotationVector => META_ROTATION_VECTOR,
        SensorId::GameRotationVector => META_GAME_ROTATION_VECTOR,
        SensorId::GeomagneticRotationVector => META_GEOMAGNETIC_ROTATION_VECTOR,
        SensorId::Pressure => META_PRESSURE,
        SensorId::AmbientLight => META_AMBIENT_LIGHT,
        SensorId::Humidity => META_HUMIDITY,
        SensorId::Proximity => META_PROXIMITY,
        SensorId::Temperature => META_TEMPERATURE,
        SensorId::TapDetector => META_TAP_DETECTOR,
        SensorId::StepDetector => META_STEP_DETECTOR,
        SensorId::StepCounter => META_STEP_COUNTER,
        SensorId::SignificantMotion => META_SIGNIFICANT_MOTION,
        SensorId::StabilityClassifier => META_STABILITY_CLASSIFIER,
        SensorId::ShakeDetector => META_SHAKE_DETECTOR,
        SensorId::FlipDetector => META_FLIP_DETECTOR,
        SensorId::PickupDetector => META_PICKUP_DETECTOR,
        SensorId::StabilityDetector => META_STABILITY_DETECTOR,
        SensorId::PersonalActivityClassifier => META_PERSONAL_ACTIVITY_CLASSIFIER,
        SensorId::SleepDetector => META_SLEEP_DETECTOR,
        SensorId::TiltDetector => META_TILT_DETECTOR,
        SensorId::PocketDetector => META_POCKET_DETECTOR,
        SensorId::CircleDetector => META_CIRCLE_DETECTOR,
        _ => return None,
    })
}

/// Decoded sensor metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorMetadata {
    pub me_version: u8,
    pub mh_version: u8,
    pub sh_version: u8,
    pub range: u32,
    pub resolution: u32,
    pub revision: u16,
    /// Power draw in 16.10 fixed-point milliamps.
    pub power_ma: u16,
    pub min_period_us: u32,
    pub fifo_max: u16,
    pub fifo_reserved: u16,
    pub batch_buffer_bytes: u16,
    pub q_point1: u16,
    pub q_point2: u16,
    pub vendor_id: Vec<u8, MAX_METADATA_BYTES>,
    pub sensor_specific: Vec<u8, MAX_METADATA_BYTES>,
}

/// Decodes a metadata FRS record.
///
/// The fixed part occupies words 0–6; where the vendor id starts depends on
/// the record's revision. Missing words decode as zero, and byte strings are
/// clipped to what the record actually contains.
pub fn decode_metadata(words: &[u32]) -> SensorMetadata {
    let word = |n: usize| words.get(n).copied().unwrap_or(0);

    let mut meta = SensorMetadata {
        me_version: word(0) as u8,
        mh_version: (word(0) >> 8) as u8,
        sh_version: (word(0) >> 16) as u8,
        range: word(1),
        resolution: word(2),
        power_ma: word(3) as u16,
        revision: (word(3) >> 16) as u16,
        min_period_us: word(4),
        fifo_max: word(5) as u16,
        fifo_reserved: (word(5) >> 16) as u16,
        batch_buffer_bytes: word(6) as u16,
        ..SensorMetadata::default()
    };
    let vendor_id_len = (word(6) >> 16) as u16;

    match meta.revision {
        0 => {
            copy_bytes(words, 7, usize::from(vendor_id_len), &mut meta.vendor_id);
        }
        1 => {
            meta.q_point1 = word(7) as u16;
            meta.q_point2 = (word(7) >> 16) as u16;
            copy_bytes(words, 8, usize::from(vendor_id_len), &mut meta.vendor_id);
        }
        2 => {
            meta.q_point1 = word(7) as u16;
            meta.q_point2 = (word(7) >> 16) as u16;
            let ss_len = word(8) as u16;
            copy_bytes(words, 9, usize::from(ss_len), &mut meta.sensor_specific);
            // One word for every 4 bytes of sensor-specific data.
            let vendor_word = 9 + (usize::from(ss_len) + 3) / 4;
            copy_bytes(words, vendor_word, usize::from(vendor_id_len), &mut meta.vendor_id);
        }
        _ => {
            debug!("unrecognized metadata revision {}", meta.revision);
        }
    }
    meta
}

fn copy_bytes(words: &[u32], start_word: usize, len: usize, out: &mut Vec<u8, MAX_METADATA_BYTES>) {
    let available = words.len().saturating_sub(start_word) * 4;
    let len = len.min(available).min(MAX_METADATA_BYTES);
    for i in 0..len {
        let word = words[start_word + i / 4];
        let byte = (word >> (8 * (i % 4))) as u8;
        if out.push(byte).is_err() {
            break;
        }
    }
}
