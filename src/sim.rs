//! Simulated card behind the hal boundary.
//!
//! Two link flavors: a paced generator that ticks in real time for the demo
//! binary, and a scripted link fed from a channel for deterministic tests.
//! The simulated deck port decodes real command blocks and can be scripted
//! to time out or report lock, so the retry and status paths run against the
//! same wire format a real deck would speak.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::browser::{Capability, DeviceHandle, ProfileAttributes};
use crate::deck::protocol;
use crate::error::{DeckIoError, DriverError};
use crate::format::{AudioFormat, AudioSampleType, DisplayMode, PixelFormat, VideoFormat};
use crate::frame::{FrameFlags, Timecode};
use crate::hal::{
    CardDriver, DeckPort, DeckStatusReport, DriverEvent, DriverLink, LinkDirection, LinkWaker,
};

/// Profile the simulated card advertises
pub fn sim_profile() -> ProfileAttributes {
    let modes = [
        (DisplayMode::Ntsc, PixelFormat::Yuv8),
        (DisplayMode::Pal, PixelFormat::Yuv8),
        (DisplayMode::Hd1080p25, PixelFormat::Yuv8),
        (DisplayMode::Hd1080p25, PixelFormat::Yuv10),
        (DisplayMode::Hd1080p2997, PixelFormat::Yuv8),
    ];
    ProfileAttributes {
        video_modes: modes
            .iter()
            .map(|(m, p)| VideoFormat::new(*m, *p))
            .collect(),
        audio_modes: vec![
            AudioFormat {
                sample_rate: 48000,
                channels: 2,
                sample_type: AudioSampleType::Int16,
            },
            AudioFormat {
                sample_rate: 48000,
                channels: 8,
                sample_type: AudioSampleType::Int32,
            },
        ],
        capabilities: vec![
            Capability::InputFormatDetection,
            Capability::DeckControl,
            Capability::HdrMetadata,
        ],
    }
}

pub fn sim_handle() -> DeviceHandle {
    DeviceHandle {
        display_name: "Simulated Quad".into(),
        persistent_id: 0x5157_4144,
        sub_device_index: 0,
    }
}

/// Simulated card: paced links by default, scripted when a script channel is
/// installed.
pub struct SimCard {
    script: Mutex<Option<flume::Receiver<DriverEvent>>>,
    deck: Arc<DeckScript>,
}

impl SimCard {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(None),
            deck: Arc::new(DeckScript::default()),
        }
    }

    /// Install an event script; the next opened link replays it instead of
    /// generating paced frames. Returns the sender the test feeds.
    pub fn script_link(&self) -> flume::Sender<DriverEvent> {
        let (tx, rx) = flume::unbounded();
        *self.script.lock().unwrap() = Some(rx);
        tx
    }

    /// Handle for scripting the deck port (timeouts, lock reports).
    pub fn deck_script(&self) -> Arc<DeckScript> {
        Arc::clone(&self.deck)
    }
}

impl Default for SimCard {
    fn default() -> Self {
        Self::new()
    }
}

impl CardDriver for SimCard {
    fn open_link(
        &self,
        video: &VideoFormat,
        audio: Option<&AudioFormat>,
        direction: LinkDirection,
    ) -> Result<Box<dyn DriverLink>, DriverError> {
        if let Some(script) = self.script.lock().unwrap().take() {
            return Ok(Box::new(ScriptedLink {
                script,
                woken: Arc::new(AtomicBool::new(false)),
            }));
        }
        Ok(Box::new(PacedLink {
            video: *video,
            audio: audio.copied(),
            direction,
            sequence: 0,
            started: Instant::now(),
            woken: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn open_deck_port(&self) -> Result<Box<dyn DeckPort>, DriverError> {
        Ok(Box::new(SimDeckPort {
            script: Arc::clone(&self.deck),
        }))
    }
}

/// Real-time frame generator for demos.
struct PacedLink {
    video: VideoFormat,
    audio: Option<AudioFormat>,
    direction: LinkDirection,
    sequence: u64,
    started: Instant,
    woken: Arc<AtomicBool>,
}

impl DriverLink for PacedLink {
    fn wait_event(&mut self) -> Result<DriverEvent, DriverError> {
        let rate = self.video.rate();
        let due = self.started + rate.interval().mul_f64(self.sequence as f64 + 1.0);
        while Instant::now() < due {
            if self.woken.load(Ordering::Acquire) {
                return Ok(DriverEvent::Closed);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.woken.load(Ordering::Acquire) {
            return Ok(DriverEvent::Closed);
        }
        let seq = self.sequence;
        self.sequence += 1;
        match self.direction {
            LinkDirection::Playback => Ok(DriverEvent::OutputReady),
            LinkDirection::Capture => {
                let descriptor = self.video.mode.descriptor();
                // Cheap moving-bar test pattern: only the first rows vary.
                let mut payload = vec![16u8; self.video.frame_bytes()];
                let bar = (seq as usize * 4) % self.video.row_bytes().max(1);
                for row in payload.chunks_mut(self.video.row_bytes()).take(8) {
                    row[bar] = 0xeb;
                }
                let audio = self.audio.map(|a| {
                    let samples =
                        (a.sample_rate as usize * rate.den as usize) / rate.num as usize;
                    vec![0u8; samples * a.channels as usize * a.sample_type.bytes_per_sample()]
                });
                Ok(DriverEvent::Frame {
                    video: payload,
                    audio,
                    hardware_timecode: Some(Timecode::from_frame_index(
                        seq,
                        &rate,
                        descriptor.drop_frame,
                    )),
                    flags: FrameFlags {
                        field_dominance: descriptor.field_dominance,
                        vitc_present: true,
                        ltc_present: false,
                    },
                })
            }
        }
    }

    fn submit_output(&mut self, payload: &[u8], _timecode: &Timecode) -> Result<(), DriverError> {
        if payload.len() < self.video.frame_bytes() {
            return Err(DriverError::OutputRejected("short payload"));
        }
        Ok(())
    }

    fn waker(&self) -> LinkWaker {
        let woken = Arc::clone(&self.woken);
        Arc::new(move || woken.store(true, Ordering::Release))
    }
}

/// Replays a scripted event sequence; used by the integration tests.
struct ScriptedLink {
    script: flume::Receiver<DriverEvent>,
    woken: Arc<AtomicBool>,
}

impl DriverLink for ScriptedLink {
    fn wait_event(&mut self) -> Result<DriverEvent, DriverError> {
        loop {
            if self.woken.load(Ordering::Acquire) {
                return Ok(DriverEvent::Closed);
            }
            match self.script.recv_timeout(Duration::from_millis(5)) {
                Ok(event) => return Ok(event),
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(DriverEvent::Closed),
            }
        }
    }

    fn submit_output(&mut self, _payload: &[u8], _timecode: &Timecode) -> Result<(), DriverError> {
        Ok(())
    }

    fn waker(&self) -> LinkWaker {
        let woken = Arc::clone(&self.woken);
        Arc::new(move || woken.store(true, Ordering::Release))
    }
}

/// Shared deck-port script: tests mutate this while the session holds the
/// boxed port.
#[derive(Default)]
pub struct DeckScript {
    /// Next N transactions time out instead of answering
    timeouts: AtomicU64,
    /// Deck reports servo/timecode lock
    locked: AtomicBool,
    /// Pending asynchronous status reports
    reports: Mutex<Vec<DeckStatusReport>>,
    /// Transactions the port has answered
    transactions: AtomicU64,
}

impl DeckScript {
    pub fn fail_next(&self, count: u64) {
        self.timeouts.store(count, Ordering::Release);
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Release);
        self.reports.lock().unwrap().push(DeckStatusReport {
            timecode: None,
            locked,
            transport_moving: false,
        });
    }

    pub fn push_report(&self, report: DeckStatusReport) {
        self.reports.lock().unwrap().push(report);
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Acquire)
    }
}

struct SimDeckPort {
    script: Arc<DeckScript>,
}

impl DeckPort for SimDeckPort {
    fn transact(&mut self, command: &[u8], _timeout: Duration) -> Result<Vec<u8>, DeckIoError> {
        if self
            .script
            .timeouts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeckIoError::Timeout);
        }
        self.script.transactions.fetch_add(1, Ordering::AcqRel);
        match (command.first(), command.get(1)) {
            (Some(0x61), Some(0x0c)) => Ok(protocol::encode_timecode_response(&Timecode::new(
                1, 2, 3, 4, false,
            ))),
            (Some(0x20), _) | (Some(0x21), _) => Ok(protocol::ACK_BLOCK.to_vec()),
            _ => Ok(protocol::encode_nak(0x01)),
        }
    }

    fn poll_status(&mut self) -> Option<DeckStatusReport> {
        let mut reports = self.script.reports.lock().unwrap();
        if reports.is_empty() {
            None
        } else {
            Some(reports.remove(0))
        }
    }
}
