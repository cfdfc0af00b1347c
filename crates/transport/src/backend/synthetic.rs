//! Test-pattern decoder.
//!
//! Behaves like a callback-driven native player: it reports metadata and
//! readiness as events, and once playing it writes frames from its own thread
//! through the bridge's lock/unlock entries. While paused it keeps
//! redelivering the current frame, as native players do on refresh.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{MediaBackend, MediaEvent, MediaReport, MediaSource, SyntheticSpec, VideoFormat};
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

pub struct SyntheticBackend {
    events: Sender<MediaReport>,
    video: Option<(Arc<FrameDecoderBridge>, VideoFormat)>,
    spec: Option<SyntheticSpec>,
    loads: u32,
    /// Tag of the current load.
    load: u64,
    decoder: Option<DecodeThread>,
}

impl SyntheticBackend {
    pub fn new(events: Sender<MediaReport>) -> Self {
        Self {
            events,
            video: None,
            spec: None,
            loads: 0,
            load: 0,
            decoder: None,
        }
    }

    /// Number of `load` calls so far.
    pub fn load_count(&self) -> u32 {
        self.loads
    }

    fn emit(&self, event: MediaEvent) {
        let report = MediaReport {
            load: self.load,
            event,
        };
        if self.events.send(report).is_err() {
            debug!("Synthetic backend: event receiver gone");
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn load(&mut self, media: &MediaSource, load: u64) -> Result<(), BackendError> {
        let MediaSource::Synthetic(spec) = media else {
            return Err(BackendError::Unsupported {
                backend: "synthetic",
                media: media.to_string(),
            });
        };

        self.stop();
        self.loads += 1;
        self.load = load;
        self.spec = Some(*spec);

        let dimensions = if spec.late_metadata && self.loads == 1 {
            None
        } else {
            Some((spec.width, spec.height))
        };

        debug!(
            "Synthetic backend: load #{} of {} (dimensions {:?})",
            self.loads, media, dimensions
        );

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

        let (Some((bridge, format)), Some(spec)) = (self.video.clone(), self.spec) else {
            warn!("Synthetic backend: play requested before video output was attached");
            return;
        };

        let (control, control_rx) = channel::unbounded();
        let spawned = thread::Builder::new()
            .name("synthetic-decode".to_string())
            .spawn(move || decode_loop(bridge, format, spec.fps, control_rx));

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
                warn!("Synthetic decode thread panicked");
            }
        }
    }
}

impl Drop for SyntheticBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    bridge: Arc<FrameDecoderBridge>,
    format: VideoFormat,
    fps: u32,
    control: Receiver<DecodeCommand>,
) {
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let mut playing = true;
    let mut frame_num: u64 = 0;

    info!(
        "Synthetic decode: {}x{} @ {} fps",
        format.width, format.height, fps
    );

    loop {
        match control.recv_timeout(interval) {
            Ok(DecodeCommand::Play) => {
                playing = true;
                continue;
            }
            Ok(DecodeCommand::Pause) => {
                playing = false;
                continue;
            }
            Ok(DecodeCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Synthetic decode: stopped after {} frames", frame_num);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let ptr = match bridge.lock_entry() {
            Ok(ptr) => ptr,
            Err(e) => {
                debug!("Synthetic decode: frame buffer gone ({}), exiting", e);
                return;
            }
        };

        // SAFETY: the lock entry succeeded, so we hold the lock and the buffer
        // is `buffer_size()` bytes until the matching unlock entry.
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), format.buffer_size()) };
        fill_pattern(buf, &format, frame_num);
        bridge.unlock_entry();

        if playing {
            frame_num += 1;
        }
    }
}

/// Write frame `frame_num` of the test pattern into an RV32 buffer.
///
/// Every byte of the first row depends on the frame number, so consecutive
/// frames always differ within the fingerprint prefix.
pub fn fill_pattern(buf: &mut [u8], format: &VideoFormat, frame_num: u64) {
    let row_size = format.row_size as usize;

    for y in 0..format.height as usize {
        let row = &mut buf[y * row_size..(y + 1) * row_size];
        for x in 0..format.width as usize {
            let px = &mut row[x * 4..x * 4 + 4];
            px[0] = (x as u64).wrapping_add(frame_num) as u8;
            px[1] = (y as u64).wrapping_add(frame_num) as u8;
            px[2] = (x ^ y) as u8;
            px[3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SharedFrameChannel;
    use crate::config::scratch_config;
    use crate::id::WorkerId;
    use crate::pool::WorkerPool;
    use crate::signal::frame_signal;

    fn spec(late_metadata: bool) -> MediaSource {
        MediaSource::Synthetic(SyntheticSpec {
            width: 16,
            height: 8,
            fps: 200,
            late_metadata,
        })
    }

    #[test]
    fn load_reports_metadata_then_loaded() {
        let (tx, rx) = channel::unbounded();
        let mut backend = SyntheticBackend::new(tx);

        backend.load(&spec(false), 1).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaReport {
                load: 1,
                event: MediaEvent::MetadataParsed {
                    dimensions: Some((16, 8))
                }
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaReport {
                load: 1,
                event: MediaEvent::Loaded
            }
        );
    }

    #[test]
    fn late_metadata_only_on_first_load() {
        let (tx, rx) = channel::unbounded();
        let mut backend = SyntheticBackend::new(tx);

        backend.load(&spec(true), 1).unwrap();
        assert_eq!(
            rx.try_recv().unwrap().event,
            MediaEvent::MetadataParsed { dimensions: None }
        );
        assert_eq!(rx.try_recv().unwrap().event, MediaEvent::Loaded);

        backend.load(&spec(true), 2).unwrap();
        let report = rx.try_recv().unwrap();
        assert_eq!(report.load, 2);
        assert_eq!(
            report.event,
            MediaEvent::MetadataParsed {
                dimensions: Some((16, 8))
            }
        );
        assert_eq!(backend.load_count(), 2);
    }

    #[test]
    fn refuses_files() {
        let (tx, _rx) = channel::unbounded();
        let mut backend = SyntheticBackend::new(tx);
        let media = MediaSource::File("clip.mp4".into());

        assert!(matches!(
            backend.load(&media, 1),
            Err(BackendError::Unsupported { .. })
        ));
    }

    #[test]
    fn play_and_pause_drive_the_bridge() {
        let config = scratch_config(1);
        let pool = WorkerPool::new(&config).unwrap();
        let id = WorkerId::new();
        let slot = pool.claim(&id).unwrap();

        let (signal, frames) = frame_signal();
        let bridge = Arc::new(FrameDecoderBridge::new(
            SharedFrameChannel::new(id, slot.lock, &config),
            signal,
            1024,
        ));
        let format = bridge.set_frame(16, 8).unwrap();

        let (tx, _rx) = channel::unbounded();
        let mut backend = SyntheticBackend::new(tx);
        backend.load(&spec(false), 1).unwrap();
        backend.attach_video(bridge.clone(), format);

        bridge.set_paused(false);
        backend.play();
        for _ in 0..3 {
            assert!(frames.recv_timeout(Duration::from_secs(2)).is_ok());
        }

        {
            let guard = bridge.channel().acquire().unwrap();
            let n = guard.bytes()[0] as u64;
            let mut expected = vec![0u8; format.buffer_size()];
            fill_pattern(&mut expected, &format, n);
            assert_eq!(guard.bytes(), &expected[..]);
        }

        bridge.set_paused(true);
        backend.set_pause(true);
        thread::sleep(Duration::from_millis(50));
        while frames.try_recv().is_ok() {}
        assert!(frames.recv_timeout(Duration::from_millis(100)).is_err());

        bridge.stop();
        backend.stop();
    }

    #[test]
    fn pattern_first_row_tracks_frame_number() {
        let format = VideoFormat::rv32(300, 2).unwrap();
        let mut a = vec![0u8; format.buffer_size()];
        let mut b = vec![0u8; format.buffer_size()];
        fill_pattern(&mut a, &format, 1);
        fill_pattern(&mut b, &format, 2);

        assert_ne!(a[..1024], b[..1024]);
        assert!(a.chunks(4).all(|px| px[3] == 255));
    }
}
