//! The hardware adaptation layer connecting the stack to a byte-level link.
//!
//! The hub is usually wired up over I²C, SPI or a UART, with an interrupt
//! line that it asserts when a transfer is ready to be read. How those wires
//! are driven is platform business; the stack only needs the small set of
//! primitives below, implemented once per platform.
//!
//! The driver is a single-owner state machine: instead of registering a
//! receive upcall, it *pulls* transfers through [`Hal::wait_transfer`]. That
//! call doubles as the blocking rendezvous for synchronous operations: the
//! caller of an SH2 request suspends inside it until the hub's response has
//! been read. A HAL that wants bounded waits may return [`Error::Timeout`]
//! from `wait_transfer`, which fails the operation in progress with that
//! status.

use crate::Error;

/// One transfer read from the hub.
pub struct Received<'a> {
    /// The raw transfer, including the 4-byte frame header.
    pub data: &'a [u8],

    /// Microsecond timestamp of the interrupt that announced this transfer.
    ///
    /// Wraps at 32 bits; the SH2 layer extends it to 64 bits by counting
    /// rollovers.
    pub timestamp_us: u32,
}

/// Platform interface to the byte link of one hub.
pub trait Hal {
    /// Largest transfer, in bytes, this link can move in one transaction.
    ///
    /// Must be at least 64. The hub may advertise smaller limits at startup,
    /// which the transport then honors instead.
    const MAX_TRANSFER: usize;

    /// Resets the hub, into bootloader (DFU) mode if `dfu_mode` is set.
    ///
    /// Must be called through [`sh2::SensorHub::new`] or [`dfu::download`]
    /// before any other primitive is used.
    ///
    /// [`sh2::SensorHub::new`]: crate::sh2::SensorHub::new
    /// [`dfu::download`]: crate::dfu::download
    fn reset(&mut self, dfu_mode: bool) -> Result<(), Error>;

    /// Writes one complete transfer to the hub.
    ///
    /// May return before the transfer has physically completed, as long as
    /// later calls preserve ordering.
    fn tx(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Reads exactly `buf.len()` bytes from the hub, blocking until done.
    ///
    /// Only used in DFU mode, where the bootloader does not signal via the
    /// interrupt line.
    fn rx(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    /// Blocks until the hub signals a transfer, reads it, and returns it
    /// along with the interrupt timestamp.
    fn wait_transfer(&mut self) -> Result<Received<'_>, Error>;
}
