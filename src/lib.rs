//! deckstream: capture/playback streaming engine with RS-422 deck control.
//!
//! The [`device::Device`] facade is the application surface: enumerate cards
//! through a [`browser::Browser`], open a handle, negotiate formats, then
//! stream frames through the pool-backed engine. Everything below the
//! [`hal`] traits belongs to the vendor driver (or the in-tree simulator).

pub mod browser;
pub mod deck;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod frame;
pub mod hal;
pub mod pool;
pub mod sim;

use serde::{Deserialize, Serialize};

pub use browser::{Browser, Capability, DeviceHandle, ProfileAttributes};
pub use deck::{protocol::DeckCommand, DeckConfig, DeckEvent, DeckStatus, TransportState};
pub use device::{Device, StreamRequest};
pub use engine::{CapturedFrame, DropReason, EngineState, StreamConfig, StreamEvent};
pub use error::{DeviceError, Result};
pub use format::{AudioFormat, DisplayMode, FormatDescriptor, PixelFormat, TimecodeSource, VideoFormat};
pub use frame::{FrameMetadata, Timecode};
pub use hal::LinkDirection;
pub use pool::{ExhaustionPolicy, PoolConfig};

/// Notifications on the device status/event channel.
///
/// Delivered asynchronously; the hardware thread publishes stream events
/// without ever blocking on the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Stream(engine::StreamEvent),
    Deck(deck::DeckEvent),
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub stream: engine::StreamConfig,
    pub pool: pool::PoolConfig,
    pub deck: deck::DeckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: engine::StreamConfig::default(),
            pool: pool::PoolConfig::default(),
            deck: deck::DeckConfig::default(),
        }
    }
}

impl Config {
    /// Layered load: built-in defaults, then an optional TOML file, then
    /// `DECKSTREAM_*` environment variables.
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(config::Environment::with_prefix("DECKSTREAM").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_loader() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.pool.depth, 4);
        assert_eq!(config.deck.max_retries, 3);
        assert_eq!(config.deck.command_timeout_ms, 100);
    }
}
