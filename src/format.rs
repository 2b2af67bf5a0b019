//! Audio/video format descriptors and exact-match mode negotiation

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// Frame rate as an exact rational (30000/1001, 25/1, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn fps(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Nominal integer rate used for timecode counting (29.97 counts as 30)
    pub fn nominal(&self) -> u32 {
        self.num.div_ceil(self.den)
    }

    /// True for 1001-denominator rates, where drop-frame timecode applies
    pub fn is_fractional(&self) -> bool {
        self.num % self.den != 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.den as f64 / self.num as f64)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{:.2}", self.fps())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldDominance {
    Progressive,
    UpperFieldFirst,
    LowerFieldFirst,
}

/// Display modes we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayMode {
    Ntsc,
    Pal,
    Hd720p50,
    Hd720p5994,
    Hd1080p24,
    Hd1080p25,
    Hd1080p2997,
    Hd1080p30,
    Hd1080i50,
    Hd1080i5994,
    Uhd2160p25,
    Uhd2160p2997,
}

/// Fixed geometry/cadence of a display mode
#[derive(Debug, Clone, Copy)]
pub struct ModeDescriptor {
    pub mode: DisplayMode,
    pub width: u32,
    pub height: u32,
    pub rate: FrameRate,
    pub field_dominance: FieldDominance,
    /// Drop-frame timecode counting applies to this cadence
    pub drop_frame: bool,
}

/// Process-wide display mode table
static MODE_TABLE: Lazy<Vec<ModeDescriptor>> = Lazy::new(|| {
    use DisplayMode::*;
    use FieldDominance::*;
    vec![
        ModeDescriptor { mode: Ntsc, width: 720, height: 486, rate: FrameRate::new(30000, 1001), field_dominance: LowerFieldFirst, drop_frame: true },
        ModeDescriptor { mode: Pal, width: 720, height: 576, rate: FrameRate::new(25, 1), field_dominance: UpperFieldFirst, drop_frame: false },
        ModeDescriptor { mode: Hd720p50, width: 1280, height: 720, rate: FrameRate::new(50, 1), field_dominance: Progressive, drop_frame: false },
        ModeDescriptor { mode: Hd720p5994, width: 1280, height: 720, rate: FrameRate::new(60000, 1001), field_dominance: Progressive, drop_frame: true },
        ModeDescriptor { mode: Hd1080p24, width: 1920, height: 1080, rate: FrameRate::new(24, 1), field_dominance: Progressive, drop_frame: false },
        ModeDescriptor { mode: Hd1080p25, width: 1920, height: 1080, rate: FrameRate::new(25, 1), field_dominance: Progressive, drop_frame: false },
        ModeDescriptor { mode: Hd1080p2997, width: 1920, height: 1080, rate: FrameRate::new(30000, 1001), field_dominance: Progressive, drop_frame: true },
        ModeDescriptor { mode: Hd1080p30, width: 1920, height: 1080, rate: FrameRate::new(30, 1), field_dominance: Progressive, drop_frame: false },
        ModeDescriptor { mode: Hd1080i50, width: 1920, height: 1080, rate: FrameRate::new(25, 1), field_dominance: UpperFieldFirst, drop_frame: false },
        ModeDescriptor { mode: Hd1080i5994, width: 1920, height: 1080, rate: FrameRate::new(30000, 1001), field_dominance: UpperFieldFirst, drop_frame: true },
        ModeDescriptor { mode: Uhd2160p25, width: 3840, height: 2160, rate: FrameRate::new(25, 1), field_dominance: Progressive, drop_frame: false },
        ModeDescriptor { mode: Uhd2160p2997, width: 3840, height: 2160, rate: FrameRate::new(30000, 1001), field_dominance: Progressive, drop_frame: true },
    ]
});

impl DisplayMode {
    pub fn descriptor(&self) -> &'static ModeDescriptor {
        MODE_TABLE
            .iter()
            .find(|d| d.mode == *self)
            .expect("every display mode has a table entry")
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 YCbCr ('2vuy')
    Yuv8,
    /// 10-bit 4:2:2 YCbCr ('v210')
    Yuv10,
    /// 8-bit ARGB
    Argb8,
    /// 8-bit BGRA
    Bgra8,
    /// 10-bit RGB ('r210')
    Rgb10,
}

impl PixelFormat {
    /// Bytes per row, including the packing each layout requires
    pub fn row_bytes(&self, width: u32) -> usize {
        match self {
            PixelFormat::Yuv8 => width as usize * 2,
            // v210 packs 6 pixels into 16 bytes, rows padded to 48-pixel groups
            PixelFormat::Yuv10 => (width as usize + 47) / 48 * 128,
            PixelFormat::Argb8 | PixelFormat::Bgra8 => width as usize * 4,
            // r210 rows padded to 64-pixel groups
            PixelFormat::Rgb10 => (width as usize + 63) / 64 * 256,
        }
    }
}

/// Where frame timecode is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimecodeSource {
    /// RP188 ancillary timecode
    Rp188,
    /// Vertical interval timecode
    Vitc,
    /// Serial (deck) timecode
    Serial,
    /// No hardware timecode; derive from a running frame counter
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioSampleType {
    Int16,
    Int32,
}

impl AudioSampleType {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioSampleType::Int16 => 2,
            AudioSampleType::Int32 => 4,
        }
    }
}

/// Negotiated audio stream settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_type: AudioSampleType,
}

impl AudioFormat {
    /// Upper bound on the byte size of one frame interval's sample block
    pub fn max_block_bytes(&self, rate: &FrameRate) -> usize {
        let samples = (self.sample_rate as usize * rate.den as usize) / rate.num as usize + 2;
        samples * self.channels as usize * self.sample_type.bytes_per_sample()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz / {} ch / {:?}",
            self.sample_rate, self.channels, self.sample_type
        )
    }
}

/// Negotiated video stream settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub mode: DisplayMode,
    pub pixel_format: PixelFormat,
    pub timecode_source: TimecodeSource,
}

impl VideoFormat {
    pub fn new(mode: DisplayMode, pixel_format: PixelFormat) -> Self {
        Self {
            mode,
            pixel_format,
            timecode_source: TimecodeSource::Counter,
        }
    }

    pub fn with_timecode_source(mut self, source: TimecodeSource) -> Self {
        self.timecode_source = source;
        self
    }

    pub fn rate(&self) -> FrameRate {
        self.mode.descriptor().rate
    }

    pub fn row_bytes(&self) -> usize {
        self.pixel_format.row_bytes(self.mode.descriptor().width)
    }

    pub fn frame_bytes(&self) -> usize {
        self.row_bytes() * self.mode.descriptor().height as usize
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.mode.descriptor();
        write!(
            f,
            "{:?} {}x{}@{} {:?}",
            self.mode, d.width, d.height, d.rate, self.pixel_format
        )
    }
}

/// Tagged audio-or-video descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatDescriptor {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// Exact-match negotiation against the modes a profile advertises.
///
/// No fuzzy matching: a mismatched buffer layout would corrupt playback, so
/// the requested descriptor must equal an advertised one field for field.
pub fn negotiate_video(requested: &VideoFormat, advertised: &[VideoFormat]) -> Result<VideoFormat> {
    advertised
        .iter()
        .find(|f| f.mode == requested.mode && f.pixel_format == requested.pixel_format)
        .map(|f| f.with_timecode_source(requested.timecode_source))
        .ok_or_else(|| DeviceError::UnsupportedFormat(requested.to_string()))
}

pub fn negotiate_audio(requested: &AudioFormat, advertised: &[AudioFormat]) -> Result<AudioFormat> {
    advertised
        .iter()
        .find(|f| *f == requested)
        .copied()
        .ok_or_else(|| DeviceError::UnsupportedFormat(requested.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_table_covers_every_mode() {
        use DisplayMode::*;
        for mode in [
            Ntsc, Pal, Hd720p50, Hd720p5994, Hd1080p24, Hd1080p25, Hd1080p2997, Hd1080p30,
            Hd1080i50, Hd1080i5994, Uhd2160p25, Uhd2160p2997,
        ] {
            let d = mode.descriptor();
            assert_eq!(d.mode, mode);
            assert!(d.width > 0 && d.height > 0);
        }
    }

    #[test]
    fn v210_row_packing() {
        // 1920 is an exact multiple of the 48-pixel group
        assert_eq!(PixelFormat::Yuv10.row_bytes(1920), 1920 / 48 * 128);
        // 720 needs padding up to the next group
        assert_eq!(PixelFormat::Yuv10.row_bytes(720), 15 * 128);
        assert_eq!(PixelFormat::Yuv8.row_bytes(1920), 3840);
    }

    #[test]
    fn negotiation_is_exact() {
        let advertised = vec![
            VideoFormat::new(DisplayMode::Hd1080p25, PixelFormat::Yuv8),
            VideoFormat::new(DisplayMode::Hd1080p25, PixelFormat::Yuv10),
        ];

        let wanted = VideoFormat::new(DisplayMode::Hd1080p25, PixelFormat::Yuv10)
            .with_timecode_source(TimecodeSource::Rp188);
        let got = negotiate_video(&wanted, &advertised).unwrap();
        assert_eq!(got.pixel_format, PixelFormat::Yuv10);
        // the caller's timecode source choice survives negotiation
        assert_eq!(got.timecode_source, TimecodeSource::Rp188);

        let missing = VideoFormat::new(DisplayMode::Uhd2160p25, PixelFormat::Yuv8);
        assert!(matches!(
            negotiate_video(&missing, &advertised),
            Err(DeviceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn descriptor_tags_by_kind() {
        let video = FormatDescriptor::Video(VideoFormat::new(
            DisplayMode::Hd1080p25,
            PixelFormat::Yuv8,
        ));
        let audio = FormatDescriptor::Audio(AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_type: AudioSampleType::Int16,
        });
        assert_ne!(video, audio);
        assert!(matches!(video, FormatDescriptor::Video(f) if f.rate().fps() == 25.0));
    }

    #[test]
    fn audio_block_bound_covers_ntsc_cadence() {
        let fmt = AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_type: AudioSampleType::Int16,
        };
        // 48000/29.97 ~ 1601.6 samples per frame; bound must cover the long frames
        let bound = fmt.max_block_bytes(&FrameRate::new(30000, 1001));
        assert!(bound >= 1602 * 2 * 2);
    }
}
