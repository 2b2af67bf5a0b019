//! Vendor hardware boundary.
//!
//! Everything below this seam is the card driver's business. The engine only
//! ever sees a [`DriverLink`] (the hardware clock and frame I/O) and the deck
//! module a [`DeckPort`] (the RS-422 serial transaction path). Real vendor
//! bindings and the in-tree simulator both implement these traits.

use std::time::Duration;

use crate::error::{DeckIoError, DriverError};
use crate::format::{AudioFormat, VideoFormat};
use crate::frame::{FrameFlags, Timecode};

/// What the driver hands us on one hardware tick.
pub enum DriverEvent {
    /// A captured frame: raw payload, frame-interval audio block if audio was
    /// negotiated, hardware timecode if the stream carries one.
    Frame {
        video: Vec<u8>,
        audio: Option<Vec<u8>>,
        hardware_timecode: Option<Timecode>,
        flags: FrameFlags,
    },
    /// Output cadence tick: the driver is ready for the next playback frame.
    OutputReady,
    /// Input signal disappeared.
    SignalLost,
    /// The incoming signal no longer matches the configured format.
    FormatChanged { detected: Option<VideoFormat> },
    /// The link is shutting down; no further events will arrive.
    Closed,
}

/// Per-card driver entry points. One instance per enumerated card.
pub trait CardDriver: Send {
    /// Open the streaming link in capture or playback direction.
    fn open_link(
        &self,
        video: &VideoFormat,
        audio: Option<&AudioFormat>,
        direction: LinkDirection,
    ) -> Result<Box<dyn DriverLink>, DriverError>;

    /// Open the RS-422 serial port, if the card has one.
    fn open_deck_port(&self) -> Result<Box<dyn DeckPort>, DriverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Capture,
    Playback,
}

/// Handle that forces a pending `wait_event` to return early. The one piece
/// of the link callable from outside the hardware thread.
pub type LinkWaker = std::sync::Arc<dyn Fn() + Send + Sync>;

/// The hardware-clock event source and output submission path.
///
/// `wait_event` is called only from the engine's hardware-facing thread; it
/// blocks at the frame cadence. `submit_output` hands a filled payload to the
/// card before the output deadline. The waker lets `stop()` interrupt a
/// blocked wait so shutdown never takes longer than one frame interval.
pub trait DriverLink: Send {
    fn wait_event(&mut self) -> Result<DriverEvent, DriverError>;
    fn submit_output(&mut self, payload: &[u8], timecode: &Timecode) -> Result<(), DriverError>;
    fn waker(&self) -> LinkWaker;
}

/// RS-422 serial transaction boundary.
///
/// Strictly request/response, no pipelining: `transact` writes one command
/// block and blocks up to `timeout` for the matching response block.
/// `poll_status` drains asynchronous deck status reports (timecode updates,
/// servo lock changes) that arrive between transactions.
pub trait DeckPort: Send {
    fn transact(&mut self, command: &[u8], timeout: Duration) -> Result<Vec<u8>, DeckIoError>;
    fn poll_status(&mut self) -> Option<DeckStatusReport>;
}

/// Asynchronous status report pushed by the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeckStatusReport {
    pub timecode: Option<Timecode>,
    /// Servo/timecode lock achieved
    pub locked: bool,
    /// Tape transport is physically moving
    pub transport_moving: bool,
}
