//! Hardware-thread playback path.
//!
//! Pops the next scheduled buffer on each output tick and hands it to the
//! driver before the deadline. Monotonicity was already validated on the
//! application side at schedule time, so the tick path is pop-submit-release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use tracing::{debug, warn};

use crate::engine::{DropReason, EngineState, StateCell, StreamEvent};
use crate::hal::{DriverEvent, DriverLink};
use crate::pool::FrameBuffer;
use crate::DeviceEvent;

pub(crate) struct PlaybackWorker {
    pub schedule: HeapCons<FrameBuffer>,
    pub frame_bytes: usize,
    pub events: flume::Sender<DeviceEvent>,
    pub state: Arc<StateCell>,
    pub stop: Arc<AtomicBool>,
}

impl PlaybackWorker {
    pub(crate) fn run(mut self, mut link: Box<dyn DriverLink>) {
        let mut ticks: u64 = 0;
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let event = match link.wait_event() {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "driver fault, stopping playback");
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::SignalLost);
                    break;
                }
            };
            match event {
                DriverEvent::OutputReady => {
                    match self.schedule.try_pop() {
                        Some(buffer) => {
                            let meta = buffer
                                .metadata()
                                .expect("scheduled buffers always carry metadata");
                            let timecode = meta.timecode;
                            if let Err(err) =
                                link.submit_output(&buffer.payload()[..self.frame_bytes], &timecode)
                            {
                                warn!(%err, "output submission rejected");
                                buffer.release();
                                self.state.store(EngineState::Stopping);
                                self.emit(StreamEvent::SignalLost);
                                break;
                            }
                            counter!("deckstream_frames_played").increment(1);
                            buffer.release();
                        }
                        None => {
                            // Starved output is degraded, not fatal.
                            self.emit(StreamEvent::FrameDropped {
                                sequence: ticks,
                                reason: DropReason::PlaybackUnderrun,
                            });
                            counter!("deckstream_frames_dropped").increment(1);
                        }
                    }
                    ticks += 1;
                }
                DriverEvent::FormatChanged { detected } => {
                    warn!(?detected, "output format changed");
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::FormatChanged { detected });
                    break;
                }
                DriverEvent::SignalLost => {
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::SignalLost);
                    break;
                }
                DriverEvent::Closed => break,
                DriverEvent::Frame { .. } => {
                    // Capture-direction event on a playback link; ignore.
                }
            }
        }
        // Return anything still queued to the pool before the thread exits.
        while let Some(buffer) = self.schedule.try_pop() {
            buffer.release();
        }
        debug!(ticks, "playback worker exiting");
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(DeviceEvent::Stream(event));
    }
}
