//! Hardware-thread capture path.
//!
//! Runs on the hardware-facing thread at the link's frame cadence. Nothing
//! here may block on the application: buffer acquisition is non-blocking,
//! delivery is try-send with reclaim-oldest on backpressure, and events go
//! through an unbounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::engine::{CapturedFrame, DropReason, EngineState, StateCell, StreamEvent};
use crate::format::{TimecodeSource, VideoFormat};
use crate::frame::{FrameMetadata, Timecode};
use crate::hal::{DriverEvent, DriverLink};
use crate::pool::FramePool;
use crate::DeviceEvent;

pub(crate) struct CaptureWorker {
    pub pool: Arc<FramePool>,
    pub video: VideoFormat,
    pub tx: flume::Sender<CapturedFrame>,
    /// Same channel as `tx`; the hardware thread steals the oldest queued
    /// frame from here when the pool runs dry.
    pub reclaim: flume::Receiver<CapturedFrame>,
    pub events: flume::Sender<DeviceEvent>,
    pub state: Arc<StateCell>,
    pub stop: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub(crate) fn run(self, mut link: Box<dyn DriverLink>) {
        let rate = self.video.rate();
        let drop_frame = self.video.mode.descriptor().drop_frame;
        let mut sequence: u64 = 0;
        let mut last_timecode: Option<Timecode> = None;

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let event = match link.wait_event() {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "driver fault, stopping capture");
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::SignalLost);
                    break;
                }
            };
            match event {
                DriverEvent::Frame {
                    video,
                    audio,
                    hardware_timecode,
                    flags,
                } => {
                    let timecode = match self.video.timecode_source {
                        TimecodeSource::Counter => {
                            Timecode::from_frame_index(sequence, &rate, drop_frame)
                        }
                        _ => hardware_timecode
                            .unwrap_or_else(|| Timecode::from_frame_index(sequence, &rate, drop_frame)),
                    };

                    // Strict monotonic order; a frame that does not follow the
                    // previous one is dropped, never delivered out of order.
                    if let Some(last) = last_timecode {
                        if timecode.frame_index(&rate) <= last.frame_index(&rate) {
                            debug!(%timecode, %last, "out-of-order frame dropped");
                            self.emit(StreamEvent::FrameDropped {
                                sequence,
                                reason: DropReason::OutOfOrder,
                            });
                            counter!("deckstream_frames_dropped").increment(1);
                            sequence += 1;
                            continue;
                        }
                    }

                    let Some(mut buffer) = self.acquire_or_reclaim(sequence) else {
                        sequence += 1;
                        continue;
                    };

                    let n = video.len().min(buffer.payload().len());
                    buffer.payload_mut()[..n].copy_from_slice(&video[..n]);
                    buffer.attach(FrameMetadata {
                        sequence,
                        timecode,
                        stream_timestamp: Duration::from_secs_f64(
                            sequence as f64 * rate.den as f64 / rate.num as f64,
                        ),
                        flags,
                        hdr: None,
                    });
                    buffer.mark_delivered();
                    last_timecode = Some(timecode);

                    let mut frame = CapturedFrame { buffer, audio };
                    loop {
                        match self.tx.try_send(frame) {
                            Ok(()) => break,
                            Err(flume::TrySendError::Full(back)) => {
                                // Queue full: reclaim the oldest queued frame
                                // and retry with the one we are holding.
                                frame = back;
                                if let Ok(old) = self.reclaim.try_recv() {
                                    self.emit(StreamEvent::FrameDropped {
                                        sequence: old
                                            .buffer
                                            .metadata()
                                            .map(|m| m.sequence)
                                            .unwrap_or(0),
                                        reason: DropReason::Backpressure,
                                    });
                                    counter!("deckstream_frames_dropped").increment(1);
                                    old.buffer.release();
                                } else {
                                    // Consumer drained it between our send and
                                    // recv; the retry will find room.
                                }
                            }
                            Err(flume::TrySendError::Disconnected(back)) => {
                                back.buffer.release();
                                break;
                            }
                        }
                    }
                    counter!("deckstream_frames_captured").increment(1);
                    sequence += 1;
                }
                DriverEvent::SignalLost => {
                    warn!("input signal lost");
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::SignalLost);
                    break;
                }
                DriverEvent::FormatChanged { detected } => {
                    warn!(?detected, "input format changed mid-stream");
                    self.state.store(EngineState::Stopping);
                    self.emit(StreamEvent::FormatChanged { detected });
                    break;
                }
                DriverEvent::Closed => break,
                DriverEvent::OutputReady => {
                    // Playback-direction event on a capture link; nothing to do.
                }
            }
        }
        debug!(frames = sequence, "capture worker exiting");
    }

    /// Non-blocking acquire with oldest-first reclaim on exhaustion. Returns
    /// None when the consumer holds every buffer, in which case the incoming
    /// frame is dropped.
    fn acquire_or_reclaim(&self, sequence: u64) -> Option<crate::pool::FrameBuffer> {
        if let Some(buffer) = self.pool.try_acquire() {
            return Some(buffer);
        }
        if let Ok(old) = self.reclaim.try_recv() {
            self.emit(StreamEvent::FrameDropped {
                sequence: old.buffer.metadata().map(|m| m.sequence).unwrap_or(0),
                reason: DropReason::Backpressure,
            });
            counter!("deckstream_frames_dropped").increment(1);
            old.buffer.release();
            if let Some(buffer) = self.pool.try_acquire() {
                return Some(buffer);
            }
        }
        self.emit(StreamEvent::FrameDropped {
            sequence,
            reason: DropReason::PoolExhausted,
        });
        counter!("deckstream_frames_dropped").increment(1);
        None
    }

    fn emit(&self, event: StreamEvent) {
        // Unbounded channel: never blocks the hardware thread.
        let _ = self.events.send(DeviceEvent::Stream(event));
    }
}
