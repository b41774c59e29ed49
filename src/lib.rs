//! An embedded sensor hub driver stack.
//!
//! This crate talks to a sensor-hub coprocessor over a byte-level link. It is
//! split into the same layers the hub itself speaks:
//!
//! * [`transport`]: the Sensor Hub Transport Protocol (SHTP). Frames cargos
//!   into transfers with a 4-byte header, reassembles inbound fragments, and
//!   multiplexes named logical channels that are bound to listeners through
//!   the hub's startup advertisement.
//! * [`sh2`]: the sensor-hub application protocol layered on SHTP. Drives
//!   synchronous request/response operations (product ID, feature get/set,
//!   FRS records, command sequences, calibration, flushing) and demultiplexes
//!   the sensor event stream, reconstructing per-event timestamps.
//! * [`dfu`]: the firmware-download transport used after resetting the hub
//!   into bootloader mode.
//! * [`tare`]: quaternion helpers for re-zeroing the rotation vector
//!   heading on the host side.
//!
//! The stack is runtime and hardware-agnostic: implement the [`hal::Hal`]
//! trait once for your MCU or host platform and hand it to
//! [`sh2::SensorHub`]. All driver state lives inside the instance, so
//! multiple hubs can be driven from one program.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod bytes;
mod crc;
pub mod dfu;
mod error;
pub mod hal;
pub mod sh2;
pub mod tare;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use self::error::Error;
