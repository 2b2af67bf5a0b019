//! Capture/playback stream engine.
//!
//! One engine drives one hardware link. The hardware-facing thread is the
//! only code that talks to the driver; the application side communicates with
//! it exclusively through the frame pool's ownership transfer, a bounded
//! delivery channel (capture) or an SPSC schedule ring (playback), and the
//! event channel. The hardware thread never blocks on the application.

mod capture;
mod playback;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};
use crate::format::{AudioFormat, VideoFormat};
use crate::frame::Timecode;
use crate::hal::{CardDriver, LinkDirection, LinkWaker};
use crate::pool::{FrameBuffer, FramePool, PoolConfig};
use crate::DeviceEvent;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Configured = 1,
    Running = 2,
    Stopping = 3,
}

/// Lock-free state cell shared with the hardware thread
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> EngineState {
        match self.0.load(Ordering::Acquire) {
            0 => EngineState::Idle,
            1 => EngineState::Configured,
            2 => EngineState::Running,
            _ => EngineState::Stopping,
        }
    }

    pub(crate) fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Why a frame never reached its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Pool exhausted and nothing queued to reclaim
    PoolExhausted,
    /// Oldest queued frame reclaimed to make room for a newer one
    Backpressure,
    /// Timecode did not follow the previous frame
    OutOfOrder,
    /// Output tick arrived with an empty schedule
    PlaybackUnderrun,
}

/// Runtime stream notifications, delivered through the device event channel.
/// None of these are errors in the `Result` sense; the hardware thread
/// publishes them without ever blocking.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    FrameDropped {
        sequence: u64,
        reason: DropReason,
    },
    SignalLost,
    FormatChanged {
        detected: Option<VideoFormat>,
    },
    /// The hardware thread has exited
    Stopped,
}

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pin the hardware-facing thread to this core
    pub pin_core: Option<usize>,
    /// Delivery channel depth; defaults to the pool depth
    pub channel_depth: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pin_core: None,
            channel_depth: None,
        }
    }
}

/// A captured frame handed to the consumer: the exclusively-owned buffer plus
/// the frame interval's audio block when audio was negotiated.
pub struct CapturedFrame {
    pub buffer: FrameBuffer,
    pub audio: Option<Vec<u8>>,
}

/// The capture/playback scheduler.
pub struct StreamEngine {
    state: Arc<StateCell>,
    pool: Arc<FramePool>,
    pool_config: PoolConfig,
    config: StreamConfig,
    video: VideoFormat,
    audio: Option<AudioFormat>,
    direction: LinkDirection,
    allow_hdr: bool,
    events: flume::Sender<DeviceEvent>,
    frames_tx: flume::Sender<CapturedFrame>,
    frames_rx: flume::Receiver<CapturedFrame>,
    sched_prod: Option<Mutex<HeapProd<FrameBuffer>>>,
    last_scheduled: Mutex<Option<Timecode>>,
    stop_flag: Arc<AtomicBool>,
    waker: Option<LinkWaker>,
    hw_thread: Option<JoinHandle<()>>,
}

impl StreamEngine {
    /// Build a configured engine. The pool is allocated here, sized for the
    /// negotiated video payload, and never grows afterwards.
    pub fn new(
        video: VideoFormat,
        audio: Option<AudioFormat>,
        direction: LinkDirection,
        allow_hdr: bool,
        pool_config: PoolConfig,
        config: StreamConfig,
        events: flume::Sender<DeviceEvent>,
    ) -> Self {
        let depth = config.channel_depth.unwrap_or(pool_config.depth);
        let (frames_tx, frames_rx) = flume::bounded(depth);
        let pool = Arc::new(FramePool::new(pool_config.depth, video.frame_bytes()));
        info!(
            format = %video,
            depth = pool_config.depth,
            ?direction,
            "engine configured"
        );
        Self {
            state: Arc::new(StateCell::new(EngineState::Configured)),
            pool,
            pool_config,
            config,
            video,
            audio,
            direction,
            allow_hdr,
            events,
            frames_tx,
            frames_rx,
            sched_prod: None,
            last_scheduled: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            waker: None,
            hw_thread: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.load()
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn video_format(&self) -> &VideoFormat {
        &self.video
    }

    /// Open the hardware link and spawn the hardware-facing thread.
    pub fn start(&mut self, driver: &dyn CardDriver) -> Result<()> {
        match self.state.load() {
            EngineState::Configured => {}
            EngineState::Running => {
                return Err(DeviceError::InvalidSequence("engine already running"))
            }
            _ => return Err(DeviceError::InvalidSequence("engine not configured")),
        }

        let link = driver.open_link(&self.video, self.audio.as_ref(), self.direction)?;
        let waker = link.waker();
        self.stop_flag.store(false, Ordering::Release);
        self.state.store(EngineState::Running);

        let pin_core = self.config.pin_core;
        let handle = match self.direction {
            LinkDirection::Capture => {
                let worker = capture::CaptureWorker {
                    pool: Arc::clone(&self.pool),
                    video: self.video,
                    tx: self.frames_tx.clone(),
                    reclaim: self.frames_rx.clone(),
                    events: self.events.clone(),
                    state: Arc::clone(&self.state),
                    stop: Arc::clone(&self.stop_flag),
                };
                std::thread::Builder::new()
                    .name("deckstream-capture".into())
                    .spawn(move || {
                        pin_to(pin_core);
                        worker.run(link);
                    })
                    .map_err(|_| DeviceError::InvalidSequence("hardware thread spawn failed"))?
            }
            LinkDirection::Playback => {
                let ring = HeapRb::<FrameBuffer>::new(self.pool.depth());
                let (prod, cons) = ring.split();
                self.sched_prod = Some(Mutex::new(prod));
                *self.last_scheduled.lock().unwrap() = None;
                let worker = playback::PlaybackWorker {
                    schedule: cons,
                    frame_bytes: self.video.frame_bytes(),
                    events: self.events.clone(),
                    state: Arc::clone(&self.state),
                    stop: Arc::clone(&self.stop_flag),
                };
                std::thread::Builder::new()
                    .name("deckstream-playback".into())
                    .spawn(move || {
                        pin_to(pin_core);
                        worker.run(link);
                    })
                    .map_err(|_| DeviceError::InvalidSequence("hardware thread spawn failed"))?
            }
        };
        self.waker = Some(waker);
        self.hw_thread = Some(handle);
        info!(direction = ?self.direction, "engine running");
        Ok(())
    }

    /// Signal the hardware thread to stop and join it.
    ///
    /// Safe to call from the consumer thread while the hardware thread is
    /// mid-callback; the in-flight frame completes before the join returns.
    /// Calling stop on an engine that is not running is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match self.state.load() {
            EngineState::Idle | EngineState::Configured => return Ok(()),
            EngineState::Running | EngineState::Stopping => {}
        }
        self.stop_flag.store(true, Ordering::Release);
        if let Some(waker) = self.waker.take() {
            waker();
        }
        if let Some(handle) = self.hw_thread.take() {
            debug!("joining hardware thread");
            if handle.join().is_err() {
                warn!("hardware thread panicked during stop");
            }
        }
        self.sched_prod = None;
        self.state.store(EngineState::Idle);
        let _ = self.events.send(DeviceEvent::Stream(StreamEvent::Stopped));
        info!("engine stopped");
        Ok(())
    }

    /// Receiver end of the capture delivery channel. Frames arrive in
    /// capture order; the consumer releases each buffer when done.
    pub fn frames(&self) -> flume::Receiver<CapturedFrame> {
        self.frames_rx.clone()
    }

    /// Consumer-side buffer acquire for the playback path, honoring the
    /// configured exhaustion policy.
    pub fn acquire_buffer(&self) -> Result<FrameBuffer> {
        self.pool.acquire(&self.pool_config)
    }

    /// Queue a filled buffer for output.
    ///
    /// Validates synchronously: the buffer must carry metadata, its timecode
    /// must strictly follow the previously scheduled one, and HDR metadata is
    /// only accepted when the profile advertises it. A rejected buffer is
    /// returned to the pool before the error surfaces.
    pub fn schedule(&self, buffer: FrameBuffer) -> Result<()> {
        if self.direction != LinkDirection::Playback {
            buffer.release();
            return Err(DeviceError::InvalidSequence("engine is not in playback mode"));
        }
        match self.state.load() {
            EngineState::Running => {}
            _ => {
                buffer.release();
                return Err(DeviceError::InvalidSequence("engine is not running"));
            }
        }
        let Some(meta) = buffer.metadata() else {
            buffer.release();
            return Err(DeviceError::InvalidSequence(
                "scheduled buffer has no metadata",
            ));
        };
        if meta.hdr.is_some() && !self.allow_hdr {
            buffer.release();
            return Err(DeviceError::UnsupportedFormat(
                "profile does not advertise HDR metadata".into(),
            ));
        }
        let rate = self.video.rate();
        let incoming = meta.timecode;
        let mut last = self.last_scheduled.lock().unwrap();
        if let Some(prev) = *last {
            if incoming.frame_index(&rate) <= prev.frame_index(&rate) {
                buffer.release();
                return Err(DeviceError::OutOfOrder {
                    last: prev,
                    incoming,
                });
            }
        }
        let prod = self
            .sched_prod
            .as_ref()
            .expect("playback engine has a schedule ring while running");
        match prod.lock().unwrap().try_push(buffer) {
            Ok(()) => {
                *last = Some(incoming);
                Ok(())
            }
            Err(buffer) => {
                buffer.release();
                Err(DeviceError::PoolExhausted)
            }
        }
    }

    /// (acquired, released, exhaustion events) from the pool
    pub fn pool_stats(&self) -> (usize, usize, usize) {
        self.pool.stats()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn pin_to(core: Option<usize>) {
    if let Some(id) = core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!(core = id, "failed to pin hardware thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DisplayMode, PixelFormat};

    fn engine(direction: LinkDirection) -> (StreamEngine, flume::Receiver<DeviceEvent>) {
        let (tx, rx) = flume::unbounded();
        let video = VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8);
        let engine = StreamEngine::new(
            video,
            None,
            direction,
            false,
            PoolConfig::default(),
            StreamConfig::default(),
            tx,
        );
        (engine, rx)
    }

    #[test]
    fn fresh_engine_is_configured() {
        let (engine, _rx) = engine(LinkDirection::Capture);
        assert_eq!(engine.state(), EngineState::Configured);
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let (mut engine, _rx) = engine(LinkDirection::Capture);
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Configured);
    }

    #[test]
    fn schedule_on_capture_engine_is_rejected() {
        let (engine, _rx) = engine(LinkDirection::Capture);
        let buf = engine.pool.try_acquire().unwrap();
        assert!(matches!(
            engine.schedule(buf),
            Err(DeviceError::InvalidSequence(_))
        ));
        // rejected buffer went back to the pool
        assert_eq!(engine.pool.free_count(), engine.pool.depth());
    }
}
