//! Render side of a frame channel.
//!
//! The render bridge attaches to a worker's buffer once the worker reports
//! it, copies each ready frame out under the channel lock and hands the copy
//! to the display thread. Copying first keeps the lock hold short and lets the
//! image cross threads without touching shared memory.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use crate::backend::{VideoFormat, BYTES_PER_PIXEL};
use crate::channel::SharedFrameChannel;
use crate::config::TransportConfig;
use crate::error::ChannelError;
use crate::id::WorkerId;
use crate::pool::WorkerPool;
use crate::worker::WorkerCommand;

/// Placeholder shown between buffer allocation and the first frame.
const PLACEHOLDER: [u8; 4] = [0, 0, 0, 255];

/// An owned frame in BGRA byte order.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FrameImage {
    /// Image filled with one `[b, g, r, a]` pixel value.
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            data: bgra.repeat(pixels),
        }
    }

    pub fn row_size(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL as usize
    }

    /// `[b, g, r, a]` at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.row_size() + x as usize * 4;
        self.data.get(at..at + 4)?.try_into().ok()
    }
}

impl fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// What the display thread paints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayUpdate {
    BufferAllocated { width: u32, height: u32 },
    Frame(FrameImage),
}

/// Asks the decode worker behind a render bridge to shut down.
pub trait WorkerControl: Send {
    fn request_teardown(&self);
}

impl WorkerControl for Sender<WorkerCommand> {
    fn request_teardown(&self) {
        if self.send(WorkerCommand::Cleanup).is_err() {
            debug!("Worker already gone, teardown request dropped");
        }
    }
}

pub struct RenderBridge {
    id: WorkerId,
    pool: Arc<WorkerPool>,
    config: TransportConfig,
    display: Sender<DisplayUpdate>,
    control: Option<Box<dyn WorkerControl>>,
    channel: Option<SharedFrameChannel>,
    dimensions: Option<(u32, u32)>,
    frames_displayed: u64,
    closed: bool,
}

impl RenderBridge {
    pub fn new(
        id: WorkerId,
        pool: Arc<WorkerPool>,
        display: Sender<DisplayUpdate>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            id,
            pool,
            config: config.clone(),
            display,
            control: None,
            channel: None,
            dimensions: None,
            frames_displayed: 0,
            closed: false,
        }
    }

    /// Route teardown requests from [`cleanup`](Self::cleanup) to `control`.
    pub fn with_control(mut self, control: impl WorkerControl + 'static) -> Self {
        self.control = Some(Box::new(control));
        self
    }

    /// The worker allocated its buffer: attach to it and show a placeholder.
    pub fn on_buffer_allocated(
        &mut self,
        width: u32,
        height: u32,
        row_size: u32,
    ) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Released);
        }

        let format = VideoFormat::rv32(width, height)?;
        if format.row_size != row_size {
            return Err(ChannelError::SizeMismatch {
                expected: format.buffer_size(),
                actual: (row_size as usize).saturating_mul(height as usize),
            });
        }

        let Some(slot) = self.pool.lookup(&self.id) else {
            warn!(worker = %self.id, "Buffer allocated for a worker without a slot");
            return Err(ChannelError::Released);
        };

        let channel = SharedFrameChannel::new(self.id.clone(), slot.lock, &self.config);
        channel.attach(format.buffer_size())?;

        if let Some(previous) = self.channel.replace(channel) {
            previous.close();
        }
        self.dimensions = Some((width, height));

        info!(
            worker = %self.id,
            slot = slot.index,
            "Attached to {}x{} frame buffer",
            width,
            height
        );

        self.show(DisplayUpdate::BufferAllocated { width, height });
        self.show(DisplayUpdate::Frame(FrameImage::solid(width, height, PLACEHOLDER)));
        Ok(())
    }

    /// Copy the current frame out and send it to the display.
    ///
    /// Returns `false` when no frame was shown. A frame-ready arriving after
    /// the channel was closed is an expected race and only logged.
    pub fn process_frame(&mut self) -> bool {
        let (Some(channel), Some((width, height))) = (&self.channel, self.dimensions) else {
            if self.closed {
                warn!(worker = %self.id, "Frame ready after the buffer was released, skipping");
            } else {
                debug!(worker = %self.id, "Frame ready before the buffer was allocated");
            }
            return false;
        };

        let data = match channel.acquire_timeout(self.config.lock_timeout()) {
            Ok(guard) => guard.bytes().to_vec(),
            Err(e) if e.is_stale() => {
                warn!(worker = %self.id, "Frame ready for a released buffer, skipping: {}", e);
                return false;
            }
            Err(e) => {
                warn!(worker = %self.id, "Could not read frame: {}", e);
                return false;
            }
        };

        self.frames_displayed += 1;
        self.show(DisplayUpdate::Frame(FrameImage {
            width,
            height,
            data,
        }));
        true
    }

    /// Close the render side's mapping. The lock is only ever held inside
    /// [`process_frame`](Self::process_frame), so there is nothing to release.
    pub fn close_channel(&mut self) {
        self.closed = true;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    /// Close the channel and ask the worker to tear down. Idempotent.
    pub fn cleanup(&mut self) {
        self.close_channel();
        if let Some(control) = self.control.take() {
            debug!(worker = %self.id, "Requesting worker teardown");
            control.request_teardown();
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn frames_displayed(&self) -> u64 {
        self.frames_displayed
    }

    fn show(&self, update: DisplayUpdate) {
        if self.display.send(update).is_err() {
            debug!(worker = %self.id, "Display receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fill_pattern;
    use crate::bridge::FrameDecoderBridge;
    use crate::config::scratch_config;
    use crate::signal::frame_signal;
    use crossbeam::channel::{self, Receiver};
    use std::time::Duration;

    struct Fixture {
        config: TransportConfig,
        pool: Arc<WorkerPool>,
        id: WorkerId,
        decoder: FrameDecoderBridge,
        display: Receiver<DisplayUpdate>,
        renderer: RenderBridge,
    }

    fn fixture() -> Fixture {
        let config = scratch_config(2);
        let pool = Arc::new(WorkerPool::new(&config).unwrap());
        let id = WorkerId::new();
        let slot = pool.claim(&id).unwrap();

        let (signal, _frames) = frame_signal();
        let decoder = FrameDecoderBridge::new(
            SharedFrameChannel::new(id.clone(), slot.lock, &config),
            signal,
            config.fingerprint_len,
        );

        let (display_tx, display) = channel::unbounded();
        let renderer = RenderBridge::new(id.clone(), pool.clone(), display_tx, &config);

        Fixture {
            config,
            pool,
            id,
            decoder,
            display,
            renderer,
        }
    }

    #[test]
    fn renderer_reads_back_what_the_decoder_wrote() {
        let mut fx = fixture();
        let format = fx.decoder.set_frame(640, 480).unwrap();
        assert_eq!(format.buffer_size(), 640 * 4 * 480);

        fx.decoder.set_paused(false);
        let ptr = fx.decoder.lock_entry().unwrap();
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), format.buffer_size()) };
        fill_pattern(buf, &format, 7);
        fx.decoder.unlock_entry();

        fx.renderer.on_buffer_allocated(640, 480, format.row_size).unwrap();
        assert_eq!(
            fx.display.try_recv().unwrap(),
            DisplayUpdate::BufferAllocated {
                width: 640,
                height: 480
            }
        );
        match fx.display.try_recv().unwrap() {
            DisplayUpdate::Frame(image) => {
                assert_eq!(image.pixel(0, 0), Some([0, 0, 0, 255]));
                assert_eq!(image.pixel(639, 479), Some([0, 0, 0, 255]));
            }
            other => panic!("expected placeholder, got {other:?}"),
        }

        assert!(fx.renderer.process_frame());
        let mut expected = vec![0u8; format.buffer_size()];
        fill_pattern(&mut expected, &format, 7);
        match fx.display.try_recv().unwrap() {
            DisplayUpdate::Frame(image) => {
                assert_eq!((image.width, image.height), (640, 480));
                assert!(image.data == expected);
            }
            other => panic!("expected frame, got {other:?}"),
        }

        assert_eq!(fx.renderer.frames_displayed(), 1);
        assert!(!fx.decoder.channel().lock().is_locked());
    }

    #[test]
    fn frame_ready_after_teardown_is_skipped() {
        let mut fx = fixture();
        let format = fx.decoder.set_frame(32, 32).unwrap();
        fx.renderer.on_buffer_allocated(32, 32, format.row_size).unwrap();
        while fx.display.try_recv().is_ok() {}

        fx.decoder.stop();
        fx.renderer.close_channel();
        fx.pool.release(&fx.id);

        assert!(!fx.renderer.process_frame());
        assert!(fx.display.try_recv().is_err());
        assert_eq!(fx.renderer.frames_displayed(), 0);
    }

    #[test]
    fn buffer_for_released_slot_is_refused() {
        let mut fx = fixture();
        fx.decoder.set_frame(8, 8).unwrap();
        fx.pool.release(&fx.id);

        assert!(matches!(
            fx.renderer.on_buffer_allocated(8, 8, 32),
            Err(ChannelError::Released)
        ));
        assert!(!fx.renderer.process_frame());
    }

    #[test]
    fn row_size_must_match_rv32_layout() {
        let mut fx = fixture();
        fx.decoder.set_frame(8, 8).unwrap();

        assert!(matches!(
            fx.renderer.on_buffer_allocated(8, 8, 40),
            Err(ChannelError::SizeMismatch {
                expected: 256,
                actual: 320
            })
        ));
        assert!(matches!(
            fx.renderer.on_buffer_allocated(u32::MAX, 1, 0),
            Err(ChannelError::FrameTooLarge { .. })
        ));
        assert_eq!(fx.renderer.dimensions(), None);
        assert!(fx.display.try_recv().is_err());

        fx.renderer.on_buffer_allocated(8, 8, 32).unwrap();
        assert_eq!(fx.renderer.dimensions(), Some((8, 8)));
    }

    #[test]
    fn frame_before_allocation_shows_nothing() {
        let mut fx = fixture();
        assert!(!fx.renderer.process_frame());
        assert!(fx.display.try_recv().is_err());
    }

    #[test]
    fn slow_writer_times_out_instead_of_hanging() {
        let mut fx = fixture();
        let format = fx.decoder.set_frame(8, 8).unwrap();
        fx.renderer.on_buffer_allocated(8, 8, format.row_size).unwrap();
        while fx.display.try_recv().is_ok() {}

        let _ptr = fx.decoder.lock_entry().unwrap();
        assert!(!fx.renderer.process_frame());
        fx.decoder.unlock_entry();

        assert!(fx.renderer.process_frame());
        assert!(matches!(fx.display.try_recv(), Ok(DisplayUpdate::Frame(_))));
        assert_eq!(fx.config.lock_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn cleanup_requests_teardown_once() {
        let fx = fixture();
        let (control, commands) = channel::unbounded();
        let mut renderer = fx.renderer.with_control(control);

        renderer.cleanup();
        renderer.cleanup();

        assert_eq!(commands.try_recv().unwrap(), WorkerCommand::Cleanup);
        assert!(commands.try_recv().is_err());
        assert!(!renderer.process_frame());
    }

    #[test]
    fn frame_image_accessors() {
        let image = FrameImage::solid(3, 2, [1, 2, 3, 255]);
        assert_eq!(image.data.len(), 3 * 2 * 4);
        assert_eq!(image.row_size(), 12);
        assert_eq!(image.pixel(2, 1), Some([1, 2, 3, 255]));
        assert_eq!(image.pixel(3, 0), None);
        assert_eq!(format!("{:?}", image), "FrameImage { width: 3, height: 2, bytes: 24 }");
    }
}
