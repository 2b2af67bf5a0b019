//! RS-422 deck control.
//!
//! A [`DeckControlSession`] owns the serial port for as long as deck control
//! is engaged. Commands run as strict request/response transactions with a
//! bounded retry budget; asynchronous status reports from the deck update a
//! lock-free status snapshot readable from any thread.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DeckIoError, DeviceError, Result};
use crate::frame::Timecode;
use crate::hal::DeckPort;
use crate::DeviceEvent;
use protocol::{DeckCommand, DeckResponse};

/// Transport states of the controlled deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Retry budget exhausted or session never engaged; commands are
    /// rejected until the session is re-engaged
    Disconnected,
    Idle,
    Playing,
    Recording,
    Shuttling,
    Jogging,
}

/// Retry/timeout tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckConfig {
    pub max_retries: u32,
    pub command_timeout_ms: u64,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            command_timeout_ms: 100,
        }
    }
}

/// Snapshot of deck state, published after every status report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeckStatus {
    pub transport: TransportState,
    pub timecode: Option<Timecode>,
    /// Servo/timecode lock achieved; derived from the latest status report
    pub timecode_lock: bool,
}

/// Deck notifications on the device event channel
#[derive(Debug, Clone, PartialEq)]
pub enum DeckEvent {
    StatusChanged(DeckStatus),
    /// Retry budget exhausted; the session is now disconnected
    Unresponsive { attempts: u32 },
}

/// One engagement of the deck-control port.
pub struct DeckControlSession {
    port: Box<dyn DeckPort>,
    state: TransportState,
    status: Arc<ArcSwap<DeckStatus>>,
    config: DeckConfig,
    events: flume::Sender<DeviceEvent>,
}

impl DeckControlSession {
    pub fn engage(
        port: Box<dyn DeckPort>,
        config: DeckConfig,
        events: flume::Sender<DeviceEvent>,
    ) -> Self {
        info!(
            retries = config.max_retries,
            timeout_ms = config.command_timeout_ms,
            "deck control engaged"
        );
        let status = DeckStatus {
            transport: TransportState::Idle,
            timecode: None,
            timecode_lock: false,
        };
        Self {
            port,
            state: TransportState::Idle,
            status: Arc::new(ArcSwap::from_pointee(status)),
            config,
            events,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Handle for polling deck status without holding the session.
    pub fn status_handle(&self) -> Arc<ArcSwap<DeckStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> DeckStatus {
        **self.status.load()
    }

    /// Current timecode lock; callers poll this before issuing `record`.
    pub fn timecode_locked(&self) -> bool {
        self.status.load().timecode_lock
    }

    /// Drain asynchronous status reports from the deck and publish the
    /// updated snapshot.
    pub fn pump_status(&mut self) {
        let mut changed = false;
        while let Some(report) = self.port.poll_status() {
            let prev = self.status();
            let next = DeckStatus {
                transport: self.state,
                timecode: report.timecode.or(prev.timecode),
                timecode_lock: report.locked,
            };
            if next != prev {
                self.status.store(Arc::new(next));
                changed = true;
            }
        }
        if changed {
            let _ = self
                .events
                .send(DeviceEvent::Deck(DeckEvent::StatusChanged(self.status())));
        }
    }

    /// Send a transport command, retrying on timeout up to the configured
    /// budget. Commands are idempotent at the protocol level, so a resend
    /// after a lost response is safe.
    ///
    /// Exhausting the budget disconnects the session; every later command
    /// fails with `InvalidSequence` until deck control is re-engaged.
    pub fn command(&mut self, command: DeckCommand) -> Result<()> {
        self.check_transition(&command)?;
        self.pump_status();

        let block = protocol::encode(&command);
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.port.transact(&block, timeout) {
                Ok(response) => {
                    let decoded = protocol::decode(&response).map_err(DeviceError::DeckIo)?;
                    return self.apply_response(&command, decoded);
                }
                Err(DeckIoError::Timeout) => {
                    counter!("deckstream_deck_retries").increment(1);
                    if attempts >= self.config.max_retries {
                        warn!(?command, attempts, "deck unresponsive, disconnecting");
                        self.state = TransportState::Disconnected;
                        self.publish_transport();
                        let _ = self
                            .events
                            .send(DeviceEvent::Deck(DeckEvent::Unresponsive { attempts }));
                        return Err(DeviceError::DeckUnresponsive { attempts });
                    }
                    debug!(?command, attempts, "transaction timed out, retrying");
                }
                Err(err) => return Err(DeviceError::DeckIo(err)),
            }
        }
    }

    /// Reject commands the current transport state does not permit.
    fn check_transition(&self, command: &DeckCommand) -> Result<()> {
        if self.state == TransportState::Disconnected {
            return Err(DeviceError::InvalidSequence(
                "deck session is disconnected; re-engage deck control",
            ));
        }
        // A recording transport only accepts stop; shuttle/jog would tear
        // the tape path mid-write.
        if self.state == TransportState::Recording {
            match command {
                DeckCommand::Stop | DeckCommand::TimecodeSense => {}
                _ => {
                    return Err(DeviceError::InvalidSequence(
                        "transport command not permitted while recording",
                    ))
                }
            }
        }
        Ok(())
    }

    fn apply_response(&mut self, command: &DeckCommand, response: DeckResponse) -> Result<()> {
        match response {
            DeckResponse::Ack => {
                let next = match command {
                    DeckCommand::Stop => TransportState::Idle,
                    DeckCommand::Play => TransportState::Playing,
                    DeckCommand::Record => TransportState::Recording,
                    DeckCommand::Shuttle(_) => TransportState::Shuttling,
                    DeckCommand::Jog(_) => TransportState::Jogging,
                    DeckCommand::TimecodeSense => self.state,
                };
                if next != self.state {
                    debug!(from = ?self.state, to = ?next, "transport transition");
                    self.state = next;
                    self.publish_transport();
                }
                Ok(())
            }
            DeckResponse::Nak(bits) => Err(DeviceError::DeckIo(DeckIoError::Nak(bits))),
            DeckResponse::Timecode(timecode) => {
                let prev = self.status();
                self.status.store(Arc::new(DeckStatus {
                    timecode: Some(timecode),
                    ..prev
                }));
                Ok(())
            }
        }
    }

    fn publish_transport(&self) {
        let prev = self.status();
        self.status.store(Arc::new(DeckStatus {
            transport: self.state,
            ..prev
        }));
        let _ = self
            .events
            .send(DeviceEvent::Deck(DeckEvent::StatusChanged(self.status())));
    }

    /// Read the deck's current timecode with a sense transaction.
    pub fn sense_timecode(&mut self) -> Result<Option<Timecode>> {
        self.command(DeckCommand::TimecodeSense)?;
        Ok(self.status().timecode)
    }
}

impl Drop for DeckControlSession {
    fn drop(&mut self) {
        info!("deck control disengaged");
    }
}
