//! Device facade: the one object applications touch.
//!
//! Composes format negotiation, the stream engine and the deck session, and
//! enforces the lifecycle: `open -> configure -> start -> stop -> close`,
//! strictly in that order, with every post-close call failing `DeviceClosed`.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::browser::{Browser, Capability, DeviceHandle, ProfileAttributes};
use crate::deck::{protocol::DeckCommand, DeckControlSession, DeckStatus};
use crate::engine::{CapturedFrame, EngineState, StreamEngine};
use crate::error::{DeviceError, Result};
use crate::format::{self, AudioFormat, VideoFormat};
use crate::hal::{CardDriver, LinkDirection};
use crate::pool::FrameBuffer;
use crate::{Config, DeviceEvent};

/// What `configure` negotiates
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub video: VideoFormat,
    pub audio: Option<AudioFormat>,
    pub direction: LinkDirection,
}

/// An opened capture/playback device.
///
/// Holds a reference to the enumerated handle, not ownership of the card;
/// the handle stays valid until `close`.
pub struct Device {
    handle: DeviceHandle,
    profile: ProfileAttributes,
    driver: Arc<dyn CardDriver + Sync>,
    config: Config,
    engine: Option<StreamEngine>,
    deck: Option<DeckControlSession>,
    event_tx: flume::Sender<DeviceEvent>,
    event_rx: flume::Receiver<DeviceEvent>,
    closed: bool,
}

impl Device {
    /// Bind to an enumerated handle. Fails if the card detached since
    /// enumeration.
    pub fn open(browser: &Browser, handle: &DeviceHandle, config: Config) -> Result<Self> {
        let profile = browser
            .profile(handle)
            .ok_or(DeviceError::InvalidSequence("handle is stale; re-enumerate"))?;
        let driver = browser
            .driver(handle)
            .ok_or(DeviceError::InvalidSequence("handle is stale; re-enumerate"))?;
        let (event_tx, event_rx) = flume::unbounded();
        info!(name = %handle.display_name, "device opened");
        Ok(Self {
            handle: handle.clone(),
            profile,
            driver,
            config,
            engine: None,
            deck: None,
            event_tx,
            event_rx,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DeviceError::DeviceClosed);
        }
        Ok(())
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn profile(&self) -> &ProfileAttributes {
        &self.profile
    }

    /// Status/event notification channel: format changes, signal loss,
    /// dropped frames, deck status.
    pub fn events(&self) -> flume::Receiver<DeviceEvent> {
        self.event_rx.clone()
    }

    /// Negotiate formats against the profile and build the stream engine.
    ///
    /// All validation happens before any state is replaced, so a failed
    /// configure leaves the device exactly as it was.
    #[instrument(skip(self), fields(device = %self.handle.display_name))]
    pub fn configure(&mut self, request: StreamRequest) -> Result<()> {
        self.check_open()?;
        if let Some(engine) = &self.engine {
            if engine.state() == EngineState::Running {
                return Err(DeviceError::InvalidSequence(
                    "stop the stream before reconfiguring",
                ));
            }
        }

        let video = format::negotiate_video(&request.video, &self.profile.video_modes)?;
        let audio = match &request.audio {
            Some(requested) => Some(format::negotiate_audio(requested, &self.profile.audio_modes)?),
            None => None,
        };
        let allow_hdr = self.profile.supports(Capability::HdrMetadata);

        info!(format = %video, "stream configured");
        self.engine = Some(StreamEngine::new(
            video,
            audio,
            request.direction,
            allow_hdr,
            self.config.pool.clone(),
            self.config.stream.clone(),
            self.event_tx.clone(),
        ));
        Ok(())
    }

    /// Start streaming. Fails with `InvalidSequence` if not configured or
    /// already running.
    pub fn start(&mut self) -> Result<()> {
        self.check_open()?;
        let engine = self
            .engine
            .as_mut()
            .ok_or(DeviceError::InvalidSequence("device is not configured"))?;
        engine.start(self.driver.as_ref())
    }

    /// Stop streaming. A no-op on a device that is not running.
    pub fn stop(&mut self) -> Result<()> {
        self.check_open()?;
        match &mut self.engine {
            Some(engine) => engine.stop(),
            None => Ok(()),
        }
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine
            .as_ref()
            .map(|e| e.state())
            .unwrap_or(EngineState::Idle)
    }

    /// Frame-delivery channel for a capture stream.
    pub fn frames(&self) -> Result<flume::Receiver<CapturedFrame>> {
        self.check_open()?;
        let engine = self
            .engine
            .as_ref()
            .ok_or(DeviceError::InvalidSequence("device is not configured"))?;
        Ok(engine.frames())
    }

    /// Acquire a pool buffer to fill for playback.
    pub fn acquire_buffer(&self) -> Result<FrameBuffer> {
        self.check_open()?;
        let engine = self
            .engine
            .as_ref()
            .ok_or(DeviceError::InvalidSequence("device is not configured"))?;
        engine.acquire_buffer()
    }

    /// Queue a filled buffer for playback output.
    pub fn schedule(&self, buffer: FrameBuffer) -> Result<()> {
        if self.closed {
            buffer.release();
            return Err(DeviceError::DeviceClosed);
        }
        let Some(engine) = self.engine.as_ref() else {
            buffer.release();
            return Err(DeviceError::InvalidSequence("device is not configured"));
        };
        engine.schedule(buffer)
    }

    /// Open the RS-422 port and create the deck-control session.
    pub fn engage_deck_control(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.profile.supports(Capability::DeckControl) {
            return Err(DeviceError::InvalidSequence(
                "profile does not advertise deck control",
            ));
        }
        if self.deck.is_some() {
            return Err(DeviceError::InvalidSequence("deck control already engaged"));
        }
        let port = self.driver.open_deck_port()?;
        self.deck = Some(DeckControlSession::engage(
            port,
            self.config.deck.clone(),
            self.event_tx.clone(),
        ));
        Ok(())
    }

    /// Issue a transport command on the engaged session.
    ///
    /// `record` additionally requires the stream engine to be running in
    /// capture mode; the facade is the one place that sees both sides of
    /// that exclusion.
    pub fn send_deck_command(&mut self, command: DeckCommand) -> Result<()> {
        self.check_open()?;
        if command == DeckCommand::Record {
            let capturing = self.engine.as_ref().is_some_and(|e| {
                e.state() == EngineState::Running && e.direction() == LinkDirection::Capture
            });
            if !capturing {
                return Err(DeviceError::InvalidSequence(
                    "record requires a running capture stream",
                ));
            }
        }
        let deck = self
            .deck
            .as_mut()
            .ok_or(DeviceError::InvalidSequence("deck control is not engaged"))?;
        deck.command(command)
    }

    /// Drain deck status reports and publish the updated snapshot.
    pub fn pump_deck_status(&mut self) -> Result<()> {
        self.check_open()?;
        let deck = self
            .deck
            .as_mut()
            .ok_or(DeviceError::InvalidSequence("deck control is not engaged"))?;
        deck.pump_status();
        Ok(())
    }

    pub fn deck_status(&self) -> Option<DeckStatus> {
        self.deck.as_ref().map(|d| d.status())
    }

    pub fn disengage_deck_control(&mut self) -> Result<()> {
        self.check_open()?;
        self.deck = None;
        Ok(())
    }

    /// Stop everything and release the handle reference. Every call after
    /// this fails with `DeviceClosed`.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(engine) = &mut self.engine {
            engine.stop()?;
        }
        self.engine = None;
        self.deck = None;
        self.closed = true;
        info!(name = %self.handle.display_name, "device closed");
        Ok(())
    }
}
