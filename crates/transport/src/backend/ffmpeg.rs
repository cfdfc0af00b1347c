//! FFmpeg software decoder.
//!
//! Probes the file on `load` for the video stream's dimensions, then decodes
//! on its own thread once playing, scaling every frame to BGRA at the
//! registered size and writing it through the bridge entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::util::frame::video::Video as VideoFrame;
use tracing::{debug, info, trace, warn};

use super::{MediaBackend, MediaEvent, MediaReport, MediaSource, VideoFormat};
use crate::bridge::FrameDecoderBridge;
use crate::error::BackendError;

enum DecodeCommand {
    Play,
    Pause,
    Stop,
}

struct DecodeThread {
    control: Sender<DecodeCommand>,
    handle: JoinHandle<()>,
}

pub struct FfmpegBackend {
    events: Sender<MediaReport>,
    video: Option<(Arc<FrameDecoderBridge>, VideoFormat)>,
    path: Option<PathBuf>,
    load: u64,
    decoder: Option<DecodeThread>,
}

impl FfmpegBackend {
    pub fn new(events: Sender<MediaReport>) -> Result<Self, BackendError> {
        ffmpeg::init().map_err(|e| BackendError::Open(format!("failed to initialize FFmpeg: {}", e)))?;

        Ok(Self {
            events,
            video: None,
            path: None,
            load: 0,
            decoder: None,
        })
    }

    fn emit(&self, event: MediaEvent) {
        let report = MediaReport {
            load: self.load,
            event,
        };
        if self.events.send(report).is_err() {
            debug!("FFmpeg backend: event receiver gone");
        }
    }
}

/// Dimensions of the best video stream, if the container reports them.
fn probe_dimensions(path: &Path) -> Result<Option<(u32, u32)>, BackendError> {
    if !path.exists() {
        return Err(BackendError::Open(format!("file not found: {}", path.display())));
    }

    let input = ffmpeg::format::input(&path).map_err(|e| BackendError::Open(e.to_string()))?;
    let stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| BackendError::Open("no video stream found".to_string()))?;

    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| BackendError::Open(e.to_string()))?;
    let decoder = context
        .decoder()
        .video()
        .map_err(|e| BackendError::Open(e.to_string()))?;

    let (width, height) = (decoder.width(), decoder.height());
    Ok((width > 0 && height > 0).then_some((width, height)))
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn load(&mut self, media: &MediaSource, load: u64) -> Result<(), BackendError> {
        let MediaSource::File(path) = media else {
            return Err(BackendError::Unsupported {
                backend: "ffmpeg",
                media: media.to_string(),
            });
        };

        self.stop();
        self.load = load;

        let dimensions = probe_dimensions(path)?;
        debug!("FFmpeg backend: {} -> {:?}", path.display(), dimensions);

        self.path = Some(path.clone());
        self.emit(MediaEvent::MetadataParsed { dimensions });
        self.emit(MediaEvent::Loaded);
        Ok(())
    }

    fn attach_video(&mut self, bridge: Arc<FrameDecoderBridge>, format: VideoFormat) {
        self.video = Some((bridge, format));
    }

    fn play(&mut self) {
        if let Some(decoder) = &self.decoder {
            let _ = decoder.control.send(DecodeCommand::Play);
            return;
        }

        let (Some((bridge, format)), Some(path)) = (self.video.clone(), self.path.clone()) else {
            warn!("FFmpeg backend: play requested before video output was attached");
            return;
        };

        let (control, control_rx) = channel::unbounded();
        let events = self.events.clone();
        let load = self.load;
        let spawned = thread::Builder::new()
            .name("ffmpeg-decode".to_string())
            .spawn(move || {
                let event = match decode_loop(&path, &bridge, format, &control_rx) {
                    Ok(true) => Some(MediaEvent::EndReached),
                    Ok(false) => None,
                    Err(e) => Some(MediaEvent::Error(e.to_string())),
                };
                if let Some(event) = event {
                    let _ = events.send(MediaReport { load, event });
                }
            });

        match spawned {
            Ok(handle) => self.decoder = Some(DecodeThread { control, handle }),
            Err(e) => self.emit(MediaEvent::Error(format!(
                "failed to spawn decode thread: {}",
                e
            ))),
        }
    }

    fn set_pause(&mut self, paused: bool) {
        if let Some(decoder) = &self.decoder {
            let command = if paused {
                DecodeCommand::Pause
            } else {
                DecodeCommand::Play
            };
            let _ = decoder.control.send(command);
        }
    }

    fn stop(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            let _ = decoder.control.send(DecodeCommand::Stop);
            if decoder.handle.join().is_err() {
                warn!("FFmpeg decode thread panicked");
            }
        }
    }
}

impl Drop for FfmpegBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Wait out `delay` while honoring pause/stop. Blocks entirely while paused.
fn pace(control: &Receiver<DecodeCommand>, delay: Duration) -> Flow {
    let deadline = Instant::now() + delay;
    let mut paused = false;

    loop {
        let command = if paused {
            control.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            control.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        };

        match command {
            Ok(DecodeCommand::Pause) => paused = true,
            Ok(DecodeCommand::Play) => paused = false,
            Ok(DecodeCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return Flow::Stop,
            Err(RecvTimeoutError::Timeout) => return Flow::Continue,
        }
    }
}

/// Decode the whole file. Returns `Ok(true)` at end of stream and `Ok(false)`
/// when stopped.
fn decode_loop(
    path: &Path,
    bridge: &FrameDecoderBridge,
    format: VideoFormat,
    control: &Receiver<DecodeCommand>,
) -> Result<bool, BackendError> {
    let mut input = ffmpeg::format::input(&path).map_err(|e| BackendError::Open(e.to_string()))?;

    let stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| BackendError::Open("no video stream found".to_string()))?;
    let stream_index = stream.index();

    let rate = stream.avg_frame_rate();
    let fps = if rate.1 != 0 && rate.0 > 0 {
        rate.0 as f64 / rate.1 as f64
    } else {
        30.0
    };
    let interval = Duration::from_secs_f64(1.0 / fps);

    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| BackendError::Open(e.to_string()))?;
    let mut decoder = context
        .decoder()
        .video()
        .map_err(|e| BackendError::Open(e.to_string()))?;

    let mut scaler = ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::BGRA,
        format.width,
        format.height,
        ScalingFlags::BILINEAR,
    )
    .map_err(|e| BackendError::Decode(e.to_string()))?;

    info!(
        "FFmpeg decode: {} at {:.2} fps -> {}x{} {}",
        path.display(),
        fps,
        format.width,
        format.height,
        format.chroma
    );

    let mut frame = VideoFrame::empty();
    let mut scaled = VideoFrame::empty();
    let mut frames: u64 = 0;

    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }

        decoder
            .send_packet(&packet)
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        while decoder.receive_frame(&mut frame).is_ok() {
            if let Flow::Stop = pace(control, interval) {
                return Ok(false);
            }
            if !publish(bridge, &format, &mut scaler, &frame, &mut scaled)? {
                return Ok(false);
            }
            frames += 1;
        }

        match control.try_recv() {
            Ok(DecodeCommand::Stop) | Err(TryRecvError::Disconnected) => return Ok(false),
            _ => {}
        }
    }

    decoder
        .send_eof()
        .map_err(|e| BackendError::Decode(e.to_string()))?;
    while decoder.receive_frame(&mut frame).is_ok() {
        if let Flow::Stop = pace(control, interval) {
            return Ok(false);
        }
        if !publish(bridge, &format, &mut scaler, &frame, &mut scaled)? {
            return Ok(false);
        }
        frames += 1;
    }

    debug!("FFmpeg decode: end of stream after {} frames", frames);
    Ok(true)
}

/// Scale one frame and write it through the bridge. Returns `Ok(false)` once
/// the bridge no longer accepts frames.
fn publish(
    bridge: &FrameDecoderBridge,
    format: &VideoFormat,
    scaler: &mut ScalingContext,
    frame: &VideoFrame,
    scaled: &mut VideoFrame,
) -> Result<bool, BackendError> {
    scaler
        .run(frame, scaled)
        .map_err(|e| BackendError::Decode(e.to_string()))?;

    let ptr = match bridge.lock_entry() {
        Ok(ptr) => ptr,
        Err(e) => {
            debug!("FFmpeg decode: frame buffer gone ({})", e);
            return Ok(false);
        }
    };

    // SAFETY: the lock entry succeeded; the buffer is `buffer_size()` bytes
    // and ours until the matching unlock entry.
    let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), format.buffer_size()) };

    let row_size = format.row_size as usize;
    let stride = scaled.stride(0);
    let src = scaled.data(0);
    for y in 0..format.height as usize {
        let from = y * stride;
        buf[y * row_size..(y + 1) * row_size].copy_from_slice(&src[from..from + row_size]);
    }
    trace!("FFmpeg decode: published frame");

    bridge.unlock_entry();
    Ok(true)
}
