//! Native decoder seam.
//!
//! A backend decodes on threads it owns and publishes pixels only through the
//! [`FrameDecoderBridge`] lock/unlock entries, the way a callback-driven
//! native player does. Progress is reported as [`MediaEvent`]s, each tagged
//! with the load it belongs to.

mod synthetic;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::bridge::FrameDecoderBridge;
use crate::error::{BackendError, ChannelError};

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
pub use synthetic::{fill_pattern, SyntheticBackend};

/// 32-bit RGB, one `0xAARRGGBB` word per pixel (BGRA byte order).
pub const CHROMA_RV32: &str = "RV32";
pub const BYTES_PER_PIXEL: u32 = 4;

/// Pixel layout handed to the decoder together with the lock/unlock entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub chroma: &'static str,
    pub width: u32,
    pub height: u32,
    pub row_size: u32,
}

impl VideoFormat {
    /// RV32 layout for `width`x`height` pixels. Fails when a row or the whole
    /// buffer overflows.
    pub fn rv32(width: u32, height: u32) -> Result<Self, ChannelError> {
        let too_large = || ChannelError::FrameTooLarge { width, height };

        let row_size = width.checked_mul(BYTES_PER_PIXEL).ok_or_else(too_large)?;
        (height as usize)
            .checked_mul(row_size as usize)
            .ok_or_else(too_large)?;

        Ok(Self {
            chroma: CHROMA_RV32,
            width,
            height,
            row_size,
        })
    }

    /// Always fits for formats built by [`rv32`](Self::rv32).
    pub fn buffer_size(&self) -> usize {
        (self.height as usize).saturating_mul(self.row_size as usize)
    }
}

/// Progress reported by a backend while loading and playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Track info is parsed. Dimensions may still be unknown.
    MetadataParsed { dimensions: Option<(u32, u32)> },
    /// Ready to play.
    Loaded,
    EndReached,
    Error(String),
}

/// A [`MediaEvent`] tagged with the load it belongs to.
///
/// Events of a superseded load can still be queued when the next load starts;
/// the tag lets the receiver drop them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReport {
    pub load: u64,
    pub event: MediaEvent,
}

/// A callback-driven video decoder.
pub trait MediaBackend: Send {
    fn name(&self) -> &'static str;

    /// Start loading `media`. Metadata and readiness arrive as reports tagged
    /// with `load`, as does everything until the next call.
    fn load(&mut self, media: &MediaSource, load: u64) -> Result<(), BackendError>;

    /// Register the pixel format and lock/unlock entries. Must happen before
    /// playback starts; stays registered across `stop`/`load`.
    fn attach_video(&mut self, bridge: Arc<FrameDecoderBridge>, format: VideoFormat);

    fn play(&mut self);

    fn set_pause(&mut self, paused: bool);

    /// Stop decoding. No callbacks or events fire after this returns.
    fn stop(&mut self);
}

/// Which backend a worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Synthetic,
    Ffmpeg,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Synthetic => "synthetic",
            BackendKind::Ffmpeg => "ffmpeg",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synthetic" => Ok(BackendKind::Synthetic),
            "ffmpeg" => Ok(BackendKind::Ffmpeg),
            other => Err(BackendError::Unsupported {
                backend: "worker",
                media: format!("backend {}", other),
            }),
        }
    }
}

/// Build a backend that reports into `events`.
pub fn create(
    kind: BackendKind,
    events: Sender<MediaReport>,
) -> Result<Box<dyn MediaBackend>, BackendError> {
    match kind {
        BackendKind::Synthetic => Ok(Box::new(SyntheticBackend::new(events))),
        #[cfg(feature = "ffmpeg")]
        BackendKind::Ffmpeg => Ok(Box::new(FfmpegBackend::new(events)?)),
        #[cfg(not(feature = "ffmpeg"))]
        BackendKind::Ffmpeg => Err(BackendError::Unsupported {
            backend: "ffmpeg",
            media: "anything (built without the `ffmpeg` feature)".to_string(),
        }),
    }
}

/// Generated test pattern description, `synthetic:WxH[@fps][+late]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Report dimensions only from the second load on.
    pub late_metadata: bool,
}

/// What a worker plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MediaSource {
    File(PathBuf),
    Synthetic(SyntheticSpec),
}

const SYNTHETIC_SCHEME: &str = "synthetic:";

impl FromStr for MediaSource {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix(SYNTHETIC_SCHEME) else {
            return Ok(MediaSource::File(PathBuf::from(s)));
        };

        let invalid = || BackendError::Open(format!("invalid synthetic media reference {:?}", s));

        let (rest, late_metadata) = match rest.strip_suffix("+late") {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let (size, fps) = match rest.split_once('@') {
            Some((size, fps)) => (size, fps.parse::<u32>().map_err(|_| invalid())?),
            None => (rest, 30),
        };
        let (width, height) = size.split_once('x').ok_or_else(|| invalid())?;
        let width = width.parse::<u32>().map_err(|_| invalid())?;
        let height = height.parse::<u32>().map_err(|_| invalid())?;

        if width == 0 || height == 0 || fps == 0 {
            return Err(invalid());
        }

        Ok(MediaSource::Synthetic(SyntheticSpec {
            width,
            height,
            fps,
            late_metadata,
        }))
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::File(path) => write!(f, "{}", path.display()),
            MediaSource::Synthetic(spec) => {
                write!(f, "{}{}x{}@{}", SYNTHETIC_SCHEME, spec.width, spec.height, spec.fps)?;
                if spec.late_metadata {
                    f.write_str("+late")?;
                }
                Ok(())
            }
        }
    }
}

impl TryFrom<String> for MediaSource {
    type Error = BackendError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MediaSource> for String {
    fn from(media: MediaSource) -> Self {
        media.to_string()
    }
}
