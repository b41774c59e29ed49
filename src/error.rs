use core::fmt;

/// Errors returned by the driver stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An argument was invalid or out of range for the request.
    BadParam,

    /// Another operation is still in progress.
    ///
    /// At most one request/response operation may be in flight per hub
    /// instance; the caller has to wait for it to finish.
    OpInProgress,

    /// The wait for the hub expired.
    ///
    /// Produced by HAL implementations that bound the transfer wait. The
    /// driver itself never times out.
    Timeout,

    /// The hub reported a protocol-level failure for the request.
    Hub,

    /// The byte link failed.
    Io,

    /// The peer violated the framing or acknowledge protocol.
    Protocol,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when a request does not fit its buffer, and when
    /// reaching EOF prematurely while decoding a report.
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::BadParam => "invalid parameter",
            Error::OpInProgress => "operation already in progress",
            Error::Timeout => "wait for hub timed out",
            Error::Hub => "hub reported an error",
            Error::Io => "byte link I/O failed",
            Error::Protocol => "peer violated protocol",
            Error::Eof => "end of buffer",
        })
    }
}
