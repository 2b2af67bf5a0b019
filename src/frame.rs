//! Frame-accurate timecode and per-frame metadata

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::format::{FieldDominance, FrameRate};

/// SMPTE timecode label (hours:minutes:seconds:frames)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    /// Drop-frame counting (29.97/59.94 cadences)
    pub drop_frame: bool,
}

impl Timecode {
    pub const ZERO: Timecode = Timecode {
        hours: 0,
        minutes: 0,
        seconds: 0,
        frames: 0,
        drop_frame: false,
    };

    pub fn new(hours: u8, minutes: u8, seconds: u8, frames: u8, drop_frame: bool) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            frames,
            drop_frame,
        }
    }

    /// Frames dropped per minute at this nominal rate (2 at 30 fps, 4 at 60)
    fn dropped_per_minute(fps: u64) -> u64 {
        fps / 15
    }

    /// Label for the `index`-th frame since 00:00:00:00.
    ///
    /// In drop-frame counting the first `fps/15` frame numbers of each minute
    /// are skipped, except every tenth minute, so wall clock and timecode stay
    /// aligned at fractional rates.
    pub fn from_frame_index(index: u64, rate: &FrameRate, drop_frame: bool) -> Self {
        let fps = rate.nominal() as u64;
        let mut adjusted = index;

        if drop_frame {
            let dpm = Self::dropped_per_minute(fps);
            let frames_per_minute = 60 * fps - dpm;
            let frames_per_ten = 600 * fps - 9 * dpm;

            let ten_blocks = index / frames_per_ten;
            let rem = index % frames_per_ten;
            // minute 0 of each block keeps its full count
            let dropped_minutes = if rem < 60 * fps {
                0
            } else {
                (rem - 60 * fps) / frames_per_minute + 1
            };
            adjusted += dpm * (9 * ten_blocks + dropped_minutes);
        }

        Self {
            hours: (adjusted / (3600 * fps) % 24) as u8,
            minutes: (adjusted / (60 * fps) % 60) as u8,
            seconds: (adjusted / fps % 60) as u8,
            frames: (adjusted % fps) as u8,
            drop_frame,
        }
    }

    /// Inverse of [`from_frame_index`](Self::from_frame_index)
    pub fn frame_index(&self, rate: &FrameRate) -> u64 {
        let fps = rate.nominal() as u64;
        let total_seconds =
            self.hours as u64 * 3600 + self.minutes as u64 * 60 + self.seconds as u64;
        let mut index = total_seconds * fps + self.frames as u64;

        if self.drop_frame {
            let dpm = Self::dropped_per_minute(fps);
            let total_minutes = self.hours as u64 * 60 + self.minutes as u64;
            index -= dpm * (total_minutes - total_minutes / 10);
        }
        index
    }

    /// Whether this label exists at the given rate (drop-frame labels skip
    /// the first frame numbers of most minutes)
    pub fn is_valid(&self, rate: &FrameRate) -> bool {
        let fps = rate.nominal() as u64;
        if self.minutes >= 60 || self.seconds >= 60 || self.frames as u64 >= fps {
            return false;
        }
        if self.drop_frame
            && self.seconds == 0
            && self.minutes % 10 != 0
            && (self.frames as u64) < Self::dropped_per_minute(fps)
        {
            return false;
        }
        true
    }

    pub fn next(&self, rate: &FrameRate) -> Self {
        Self::from_frame_index(self.frame_index(rate) + 1, rate, self.drop_frame)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}

/// Ancillary flags carried with each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags {
    pub field_dominance: FieldDominance,
    pub vitc_present: bool,
    pub ltc_present: bool,
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self {
            field_dominance: FieldDominance::Progressive,
            vitc_present: false,
            ltc_present: false,
        }
    }
}

/// Electro-optical transfer function signalled for HDR payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Eotf {
    Sdr,
    Pq,
    Hlg,
}

/// Static HDR mastering metadata attached per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub eotf: Eotf,
    /// Red, green, blue primaries as CIE 1931 x/y
    pub display_primaries: [[f64; 2]; 3],
    pub white_point: [f64; 2],
    pub max_display_mastering_luminance: f64,
    pub min_display_mastering_luminance: f64,
    pub max_cll: f64,
    pub max_fall: f64,
}

/// Per-frame metadata, immutable once attached to a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    /// Monotonic capture/schedule sequence number
    pub sequence: u64,
    pub timecode: Timecode,
    /// Hardware stream time since the stream started
    pub stream_timestamp: Duration,
    pub flags: FrameFlags,
    pub hdr: Option<HdrMetadata>,
}
