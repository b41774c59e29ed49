//! Firmware download (DFU) over the byte link.
//!
//! After a reset into bootloader mode the hub speaks a much simpler protocol
//! than SHTP: the host announces the image length and its packet size, then
//! streams the image in packet-sized frames. Every frame carries a CRC and
//! is answered by a single acknowledge byte; rejected frames are retried a
//! bounded number of times.

use crate::crc::crc16;
use crate::hal::Hal;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

/// The bootloader's acknowledge byte.
const ACK: u8 = b's';

/// Largest packet the bootloader accepts.
const MAX_PACKET_LEN: usize = 64;

/// Transmission attempts per frame before giving up.
const MAX_ATTEMPTS: u32 = 5;

const FIRMWARE_FORMAT: &str = "BNO_V1";
const PART_NUMBERS: [&str; 2] = ["1000-3608", "1000-3676"];

/// Access to a firmware image and its metadata.
///
/// Images are usually baked into flash or loaded from a host filesystem;
/// either way the download only needs sequential chunk reads.
pub trait Firmware {
    /// Prepares the image for reading.
    fn open(&mut self) -> Result<(), Error>;

    /// Releases the image. Called even when the download failed.
    fn close(&mut self);

    /// Looks up a metadata value, eg. `"FW-Format"`.
    fn meta(&self, key: &str) -> Option<&str>;

    /// Length of the application image in bytes.
    fn app_len(&self) -> u32;

    /// Preferred download packet length; 0 to use the default.
    fn packet_len(&self) -> u8;

    /// Copies `buf.len()` image bytes starting at `offset` into `buf`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), Error>;
}

/// Downloads `firmware` into the hub.
///
/// Resets the hub into bootloader mode and streams the image. On success the
/// hub boots the new firmware; the caller restarts normal operation by
/// constructing a fresh [`SensorHub`].
///
/// [`SensorHub`]: crate::sh2::SensorHub
pub fn download<H: Hal, F: Firmware>(hal: &mut H, firmware: &mut F) -> Result<(), Error> {
    firmware.open()?;
    let result = run(hal, firmware);
    firmware.close();
    result
}

fn run<H: Hal, F: Firmware>(hal: &mut H, firmware: &mut F) -> Result<(), Error> {
    // Refuse images that are not for this part.
    if firmware.meta("FW-Format") != Some(FIRMWARE_FORMAT) {
        return Err(Error::BadParam);
    }
    match firmware.meta("SW-Part-Number") {
        Some(part) if PART_NUMBERS.contains(&part) => {}
        _ => return Err(Error::BadParam),
    }
    let app_len = firmware.app_len();
    if app_len == 0 {
        return Err(Error::BadParam);
    }
    let mut packet_len = usize::from(firmware.packet_len());
    if packet_len == 0 || packet_len > MAX_PACKET_LEN {
        packet_len = MAX_PACKET_LEN;
    }

    hal.reset(true)?;

    let mut buf = [0; MAX_PACKET_LEN + 2];

    // Announce the image length, then the packet length.
    BigEndian::write_u32(&mut buf[..4], app_len);
    send_frame(hal, &mut buf, 4)?;
    buf[0] = packet_len as u8;
    send_frame(hal, &mut buf, 1)?;

    // Stream the image.
    let mut offset = 0;
    while offset < app_len {
        let chunk = (app_len - offset).min(packet_len as u32) as usize;
        firmware.read(offset, &mut buf[..chunk])?;
        send_frame(hal, &mut buf, chunk)?;
        offset += chunk as u32;
    }
    Ok(())
}

/// Appends the CRC to the frame staged in `buf[..len]`, transmits it, and
/// waits for the acknowledge, retrying rejected frames.
fn send_frame<H: Hal>(
    hal: &mut H,
    buf: &mut [u8; MAX_PACKET_LEN + 2],
    len: usize,
) -> Result<(), Error> {
    let crc = crc16(&buf[..len]);
    BigEndian::write_u16(&mut buf[len..len + 2], crc);

    let mut attempts = 0;
    loop {
        attempts += 1;
        let status = hal.tx(&buf[..len + 2]).and_then(|()| {
            let mut ack = [0];
            hal.rx(&mut ack)?;
            if ack[0] == ACK {
                Ok(())
            } else {
                Err(Error::Protocol)
            }
        });
        match status {
            Ok(()) => return Ok(()),
            Err(e) if attempts >= MAX_ATTEMPTS => return Err(e),
            Err(_) => warn!("dfu: frame rejected, retrying"),
        }
    }
}
