//! Demultiplexing of the sensor input channels.
//!
//! Input cargos concatenate fixed-length reports, like the control channel,
//! but two meta-reports thread a time base through the stream: a base
//! timestamp reference at the start, and rebase reports whenever the base
//! drifts too far for the per-report delay fields. Every other report is a
//! sensor event, stamped by combining the host-side interrupt timestamp with
//! the accumulated reference delta and the report's own delay field.

use super::reports;
use super::{Client, SensorEvent, SensorId, Session};
use crate::bytes::ByteReader;
use core::cmp;

/// Extends the hub's 32-bit microsecond timestamps to 64 bits.
///
/// Host interrupt timestamps are assumed to move forward; a decrease implies
/// the 32-bit counter rolled over.
pub(crate) struct TimestampTracker {
    last_host_int: u32,
    rollovers: u32,
}

impl TimestampTracker {
    pub(crate) const fn new() -> Self {
        TimestampTracker { last_host_int: 0, rollovers: 0 }
    }

    /// Produces the 64-bit microsecond timestamp for one sensor event.
    ///
    /// `reference_delta` and `delay` are in units of 100 µs; the low 32 bits
    /// wrap exactly like the hub's own arithmetic, so negative deltas work
    /// out near rollover as well.
    pub(crate) fn timestamp_us(
        &mut self,
        host_int: u32,
        reference_delta: i32,
        delay: u16,
    ) -> u64 {
        if host_int < self.last_host_int {
            self.rollovers += 1;
        }
        self.last_host_int = host_int;

        let adjust = (reference_delta.wrapping_add(i32::from(delay)) as u32).wrapping_mul(100);
        (u64::from(self.rollovers) << 32) + u64::from(host_int.wrapping_add(adjust))
    }
}

impl Session {
    /// Handles a cargo from `inputNormal` or `inputWake`.
    pub(crate) fn on_input<C: Client>(
        &mut self,
        payload: &[u8],
        timestamp_us: u32,
        client: &mut C,
    ) {
        let mut reference_delta: i32 = 0;
        let mut cursor = 0;

        while cursor < payload.len() {
            let id = payload[cursor];
            let len = usize::from(self.report_lens.len_of(id));
            if len == 0 {
                self.stats.unknown_report_ids += 1;
                return;
            }
            let report = &payload[cursor..cmp::min(cursor + len, payload.len())];

            match id {
                reports::BASE_TIMESTAMP_REF => {
                    let mut r = ByteReader::new(&report[1..]);
                    if let Ok(timebase) = r.read_i32_le() {
                        reference_delta = timebase.wrapping_neg();
                    }
                }
                reports::TIMESTAMP_REBASE => {
                    let mut r = ByteReader::new(&report[1..]);
                    if let Ok(timebase) = r.read_i32_le() {
                        reference_delta = reference_delta.wrapping_add(timebase);
                    }
                }
                _ => {
                    let delay = if report.len() >= 4 {
                        (u16::from(report[2] & 0xFC) << 6) + u16::from(report[3])
                    } else {
                        0
                    };
                    let event = SensorEvent {
                        sensor: SensorId::from(id),
                        timestamp_us: self.timestamps.timestamp_us(
                            timestamp_us,
                            reference_delta,
                            delay,
                        ),
                        data: report,
                    };
                    client.sensor_event(&event);
                }
            }
            cursor += len;
        }
    }

    /// Handles a cargo from `inputGyroRv`.
    ///
    /// The gyro rotation-vector channel carries raw back-to-back reports with
    /// no ids and no timestamp meta-reports; events keep the host timestamp.
    pub(crate) fn on_input_gyro_rv<C: Client>(
        &mut self,
        payload: &[u8],
        timestamp_us: u32,
        client: &mut C,
    ) {
        let len = usize::from(self.report_lens.len_of(SensorId::GyroIntegratedRv.into()));
        if len == 0 {
            self.stats.unknown_report_ids += 1;
            return;
        }
        for report in payload.chunks_exact(len) {
            let event = SensorEvent {
                sensor: SensorId::GyroIntegratedRv,
                timestamp_us: u64::from(timestamp_us),
                data: report,
            };
            client.sensor_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingClient;

    fn session() -> Session {
        let mut session = Session::new();
        // Base ref and rebase are 5 bytes; accelerometer reports 10.
        session.report_lens.load(&[0xFB, 5, 0xFA, 5, 0x01, 10, 0x2A, 14]);
        session
    }

    fn base_ref(timebase: u32) -> std::vec::Vec<u8> {
        let mut r = std::vec![0xFB];
        r.extend_from_slice(&timebase.to_le_bytes());
        r
    }

    fn accel(delay_raw: u8, delay_lsb: u8) -> std::vec::Vec<u8> {
        let mut r = std::vec![0x01, 0x00, delay_raw, delay_lsb];
        r.extend_from_slice(&[0; 6]);
        r
    }

    #[test]
    fn stamps_events_from_base_reference() {
        let mut session = session();
        let mut client = RecordingClient::default();

        // Interrupt at t=100000 µs; the batch left the hub 5 * 100 µs after
        // the report was sampled, and the report itself adds 2 * 100 µs.
        let mut payload = base_ref(5);
        payload.extend_from_slice(&accel(0, 2));
        session.on_input(&payload, 100_000, &mut client);

        assert_eq!(client.sensor.len(), 1);
        let (sensor, timestamp, data) = &client.sensor[0];
        assert_eq!(*sensor, SensorId::Accelerometer);
        assert_eq!(*timestamp, 100_000 - 500 + 200);
        assert_eq!(data.len(), 10);
    }

    #[test]
    fn rebase_shifts_reference() {
        let mut session = session();
        let mut client = RecordingClient::default();

        let mut payload = base_ref(10);
        payload.extend_from_slice(&accel(0, 0));
        // Rebase by +4 ticks.
        payload.extend_from_slice(&[0xFA, 4, 0, 0, 0]);
        payload.extend_from_slice(&accel(0, 0));
        session.on_input(&payload, 50_000, &mut client);

        assert_eq!(client.sensor.len(), 2);
        assert_eq!(client.sensor[0].1, 50_000 - 1_000);
        assert_eq!(client.sensor[1].1, 50_000 - 600);
    }

    #[test]
    fn delay_field_uses_upper_bits() {
        let mut session = session();
        let mut client = RecordingClient::default();

        // delay = ((0xFC & 0xFC) << 6) + 0xFF = 0x3F00 + 0xFF ticks.
        let mut payload = base_ref(0);
        payload.extend_from_slice(&accel(0xFC, 0xFF));
        session.on_input(&payload, 10_000_000, &mut client);

        let expect = 10_000_000 + (0x3F00 + 0xFF) * 100;
        assert_eq!(client.sensor[0].1, expect);
    }

    #[test]
    fn unknown_report_id_stops_parsing() {
        let mut session = session();
        let mut client = RecordingClient::default();

        let mut payload = accel(0, 0);
        payload.push(0x42); // unknown id; nothing after it is reachable
        payload.extend_from_slice(&accel(0, 0));
        session.on_input(&payload, 0, &mut client);

        assert_eq!(client.sensor.len(), 1);
        assert_eq!(session.stats.unknown_report_ids, 1);
    }

    #[test]
    fn timestamps_survive_rollover() {
        let mut session = session();
        let mut client = RecordingClient::default();

        let payload = accel(0, 0);
        session.on_input(&payload, 0xFFFF_FFF0, &mut client);
        session.on_input(&payload, 0x0000_0010, &mut client);
        session.on_input(&payload, 0x0000_0020, &mut client);

        assert_eq!(client.sensor[0].1, 0xFFFF_FFF0);
        assert_eq!(client.sensor[1].1, 0x1_0000_0010);
        assert_eq!(client.sensor[2].1, 0x1_0000_0020);
        assert!(client.sensor.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn gyro_rv_reports_keep_host_timestamp() {
        let mut session = session();
        let mut client = RecordingClient::default();

        let payload = [0x11u8; 28]; // two 14-byte reports
        session.on_input_gyro_rv(&payload, 777, &mut client);

        assert_eq!(client.sensor.len(), 2);
        assert_eq!(client.sensor[0].0, SensorId::GyroIntegratedRv);
        assert_eq!(client.sensor[0].1, 777);
        assert_eq!(client.sensor[1].1, 777);
        assert_eq!(client.sensor[0].2.len(), 14);
    }
}
