//! Device enumeration and capability queries.
//!
//! The registry is an explicit object with a clear teardown point: callers
//! construct a [`Browser`], enumerate handles from it, and drop it at
//! application shutdown. Nothing here is process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::format::{AudioFormat, VideoFormat};
use crate::hal::CardDriver;

/// Capabilities a card profile can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Card detects the incoming signal format and reports changes
    InputFormatDetection,
    /// Card accepts/emits per-frame HDR metadata
    HdrMetadata,
    /// Card has an RS-422 deck-control port
    DeckControl,
    /// Card supports internal keying
    InternalKeying,
}

/// Identity of one enumerated card
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub display_name: String,
    /// Stable across reboots and re-enumeration
    pub persistent_id: u64,
    /// Index within a multi-port card
    pub sub_device_index: u32,
}

/// Read-only capability description for one handle
#[derive(Debug, Clone)]
pub struct ProfileAttributes {
    pub video_modes: Vec<VideoFormat>,
    pub audio_modes: Vec<AudioFormat>,
    pub capabilities: Vec<Capability>,
}

impl ProfileAttributes {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

struct Entry {
    profile: ProfileAttributes,
    driver: Arc<dyn CardDriver + Sync>,
}

/// Explicit device registry.
///
/// `enumerate` reflects live attach state at call time; a handle obtained
/// from an earlier enumeration stays valid only while the card remains
/// attached.
pub struct Browser {
    cards: Mutex<HashMap<DeviceHandle, Entry>>,
}

impl Browser {
    pub fn new() -> Self {
        Self {
            cards: Mutex::new(HashMap::new()),
        }
    }

    /// Register an attached card with its profile and driver entry points.
    pub fn attach(
        &self,
        handle: DeviceHandle,
        profile: ProfileAttributes,
        driver: Arc<dyn CardDriver + Sync>,
    ) {
        info!(name = %handle.display_name, id = handle.persistent_id, "card attached");
        self.cards
            .lock()
            .unwrap()
            .insert(handle, Entry { profile, driver });
    }

    /// Remove a card; outstanding handles for it become stale.
    pub fn detach(&self, handle: &DeviceHandle) {
        info!(name = %handle.display_name, "card detached");
        self.cards.lock().unwrap().remove(handle);
    }

    /// Handles for every currently attached card.
    pub fn enumerate(&self) -> Vec<DeviceHandle> {
        let cards = self.cards.lock().unwrap();
        let mut handles: Vec<_> = cards.keys().cloned().collect();
        handles.sort_by_key(|h| (h.persistent_id, h.sub_device_index));
        handles
    }

    pub fn profile(&self, handle: &DeviceHandle) -> Option<ProfileAttributes> {
        self.cards
            .lock()
            .unwrap()
            .get(handle)
            .map(|e| e.profile.clone())
    }

    pub fn driver(&self, handle: &DeviceHandle) -> Option<Arc<dyn CardDriver + Sync>> {
        self.cards
            .lock()
            .unwrap()
            .get(handle)
            .map(|e| Arc::clone(&e.driver))
    }
}

impl Default for Browser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeckIoError, DriverError};
    use crate::format::{DisplayMode, PixelFormat};
    use crate::hal::{DeckPort, DriverLink, LinkDirection};

    struct NullDriver;

    impl CardDriver for NullDriver {
        fn open_link(
            &self,
            _video: &VideoFormat,
            _audio: Option<&AudioFormat>,
            _direction: LinkDirection,
        ) -> Result<Box<dyn DriverLink>, DriverError> {
            Err(DriverError::LinkUnavailable("null driver"))
        }

        fn open_deck_port(&self) -> Result<Box<dyn DeckPort>, DriverError> {
            Err(DriverError::LinkUnavailable("null driver"))
        }
    }

    fn handle(id: u64) -> DeviceHandle {
        DeviceHandle {
            display_name: format!("Card {id}"),
            persistent_id: id,
            sub_device_index: 0,
        }
    }

    #[test]
    fn enumeration_reflects_live_attach_state() {
        let browser = Browser::new();
        let profile = ProfileAttributes {
            video_modes: vec![VideoFormat::new(DisplayMode::Hd1080p25, PixelFormat::Yuv8)],
            audio_modes: vec![],
            capabilities: vec![Capability::DeckControl],
        };
        browser.attach(handle(2), profile.clone(), Arc::new(NullDriver));
        browser.attach(handle(1), profile, Arc::new(NullDriver));

        let handles = browser.enumerate();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].persistent_id, 1);

        browser.detach(&handle(1));
        assert_eq!(browser.enumerate().len(), 1);
        assert!(browser.profile(&handle(1)).is_none());
        assert!(browser.profile(&handle(2)).unwrap().supports(Capability::DeckControl));
    }
}
