//! Error taxonomy for the device surface

use thiserror::Error;

use crate::frame::Timecode;

/// Errors returned synchronously from the device surface.
///
/// Runtime streaming faults (signal loss, mid-stream format changes, dropped
/// frames) never appear here; they are delivered through the status/event
/// channel so the hardware thread is never interrupted by error propagation.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Requested format is not in the profile's advertised set
    #[error("format not supported by this device profile: {0}")]
    UnsupportedFormat(String),

    /// No free buffer available under the configured acquire policy
    #[error("frame pool exhausted")]
    PoolExhausted,

    /// Frame timecode does not follow the previously scheduled one
    #[error("timecode not monotonic: {incoming} does not follow {last}")]
    OutOfOrder { last: Timecode, incoming: Timecode },

    /// Operation issued in a state that does not permit it
    #[error("invalid call sequence: {0}")]
    InvalidSequence(&'static str),

    /// Any call made after `close()`
    #[error("device is closed")]
    DeviceClosed,

    /// Deck retry budget exhausted; the session is now disconnected
    #[error("deck unresponsive after {attempts} attempts")]
    DeckUnresponsive { attempts: u32 },

    #[error("driver fault: {0}")]
    Driver(#[from] DriverError),

    #[error("deck i/o: {0}")]
    DeckIo(#[from] DeckIoError),
}

/// Faults crossing the vendor driver boundary
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("hardware link unavailable: {0}")]
    LinkUnavailable(&'static str),

    #[error("driver rejected scheduled output: {0}")]
    OutputRejected(&'static str),
}

/// Faults on the RS-422 serial boundary
#[derive(Debug, Error)]
pub enum DeckIoError {
    /// No response within the transaction timeout
    #[error("transaction timed out")]
    Timeout,

    #[error("malformed response block: {0}")]
    Malformed(&'static str),

    #[error("response checksum mismatch")]
    Checksum,

    /// Deck answered NAK with the given error bits
    #[error("deck rejected command (error bits {0:#04x})")]
    Nak(u8),

    #[error("serial port closed")]
    PortClosed,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
