//! Decoder-side bridge between native lock/unlock callbacks and the shared
//! frame channel.
//!
//! The native decoder calls [`FrameDecoderBridge::lock_entry`] from its own
//! thread to get a write pointer, fills one frame, then calls
//! [`FrameDecoderBridge::unlock_entry`]. The unlock entry decides whether the
//! renderer needs to hear about the frame.
//!
//! While paused, decoders keep redelivering the same picture. To avoid a
//! redraw per callback, the bridge compares a fingerprint of the first
//! `fingerprint_len` bytes with the previous one and stays quiet when they
//! match. A change confined to bytes past the prefix goes unnoticed; that is
//! an accepted approximation.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::VideoFormat;
use crate::channel::SharedFrameChannel;
use crate::error::ChannelError;
use crate::shm::{Segment, SlotLock};
use crate::signal::FrameSignal;

/// Releases a slot lock when dropped.
struct LockRelease<'a>(&'a SlotLock);

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct FrameDecoderBridge {
    channel: SharedFrameChannel,
    signal: FrameSignal,
    paused: AtomicBool,
    stopped: AtomicBool,
    fingerprint_len: usize,
    fingerprint: Mutex<Option<Vec<u8>>>,
    /// Mapping handed out by the last lock entry; keeps it alive until unlock.
    in_flight: Mutex<Option<Arc<Segment>>>,
    format: Mutex<Option<VideoFormat>>,
}

impl FrameDecoderBridge {
    pub fn new(channel: SharedFrameChannel, signal: FrameSignal, fingerprint_len: usize) -> Self {
        Self {
            channel,
            signal,
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            fingerprint_len,
            fingerprint: Mutex::new(None),
            in_flight: Mutex::new(None),
            format: Mutex::new(None),
        }
    }

    /// Allocate the frame buffer for `width`x`height` RV32 pixels.
    pub fn set_frame(&self, width: u32, height: u32) -> Result<VideoFormat, ChannelError> {
        let format = VideoFormat::rv32(width, height)?;
        self.channel.allocate(format.buffer_size())?;
        *self.format.lock() = Some(format);

        debug!(
            channel = %self.channel.name(),
            "Frame buffer ready: {}x{} {} (row {} bytes)",
            width,
            height,
            format.chroma,
            format.row_size
        );
        Ok(format)
    }

    pub fn format(&self) -> Option<VideoFormat> {
        *self.format.lock()
    }

    /// Lock entry: take the channel lock and return the buffer to write.
    ///
    /// Blocks while the renderer holds the lock. On error the lock is not
    /// held and the decoder must skip the frame without calling
    /// [`unlock_entry`](Self::unlock_entry).
    pub fn lock_entry(&self) -> Result<NonNull<u8>, ChannelError> {
        if self.is_stopped() {
            return Err(ChannelError::Released);
        }

        let lock = self.channel.lock();
        lock.acquire();

        let segment = match self.channel.segment() {
            Ok(segment) if !self.is_stopped() => segment,
            Ok(_) => {
                lock.release();
                return Err(ChannelError::Released);
            }
            Err(e) => {
                lock.release();
                return Err(e);
            }
        };

        let Some(ptr) = NonNull::new(segment.as_ptr()) else {
            lock.release();
            return Err(ChannelError::Released);
        };

        *self.in_flight.lock() = Some(segment);
        Ok(ptr)
    }

    /// Unlock entry: the decoder finished writing one frame.
    pub fn unlock_entry(&self) {
        let Some(segment) = self.in_flight.lock().take() else {
            trace!("Unlock without a matching lock");
            return;
        };
        let _release = LockRelease(self.channel.lock());

        if self.is_stopped() {
            return;
        }

        if self.is_paused() && !self.frame_changed(&segment) {
            trace!("Paused frame unchanged, skipping redraw");
            return;
        }

        self.signal.notify();
    }

    fn frame_changed(&self, segment: &Segment) -> bool {
        let len = self.fingerprint_len.min(segment.len());
        // SAFETY: called between lock and unlock entries, so the lock is held
        // and the mapping is kept alive by the caller.
        let head = unsafe { std::slice::from_raw_parts(segment.as_ptr(), len) };

        let mut previous = self.fingerprint.lock();
        if previous.as_deref() == Some(head) {
            return false;
        }
        *previous = Some(head.to_vec());
        true
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop publishing and tear the channel down.
    ///
    /// Marks the bridge stopped first so late callbacks turn into no-ops, then
    /// frees the lock in case a callback holds it, then closes the channel.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.channel.lock().force_release() {
            debug!(
                channel = %self.channel.name(),
                "Force-released frame lock held by an in-flight callback"
            );
        }

        self.channel.close();
    }

    pub fn channel(&self) -> &SharedFrameChannel {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{scratch_config, TransportConfig};
    use crate::id::WorkerId;
    use crate::pool::WorkerPool;
    use crate::signal::frame_signal;
    use crossbeam::channel::Receiver;

    struct Fixture {
        _pool: WorkerPool,
        bridge: FrameDecoderBridge,
        frames: Receiver<()>,
    }

    fn fixture(fingerprint_len: usize) -> Fixture {
        let config: TransportConfig = scratch_config(1);
        let pool = WorkerPool::new(&config).unwrap();
        let id = WorkerId::new();
        let slot = pool.claim(&id).unwrap();

        let (signal, frames) = frame_signal();
        let channel = SharedFrameChannel::new(id, slot.lock, &config);
        let bridge = FrameDecoderBridge::new(channel, signal, fingerprint_len);

        Fixture {
            _pool: pool,
            bridge,
            frames,
        }
    }

    /// Write one frame through the entries, like a native decoder.
    fn decode(bridge: &FrameDecoderBridge, fill: impl FnOnce(&mut [u8])) {
        let size = bridge.format().unwrap().buffer_size();
        let ptr = bridge.lock_entry().unwrap();
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        fill(buf);
        bridge.unlock_entry();
    }

    #[test]
    fn set_frame_sizes_buffer() {
        let fx = fixture(1024);
        let format = fx.bridge.set_frame(640, 480).unwrap();

        assert_eq!(format.row_size, 640 * 4);
        assert_eq!(fx.bridge.channel().size(), Some(640 * 4 * 480));
        assert!(matches!(
            fx.bridge.set_frame(320, 240),
            Err(ChannelError::AlreadyAllocated { .. })
        ));
    }

    #[test]
    fn playing_always_notifies() {
        let fx = fixture(1024);
        fx.bridge.set_frame(32, 32).unwrap();
        fx.bridge.set_paused(false);

        for _ in 0..3 {
            decode(&fx.bridge, |buf| buf.fill(7));
            assert!(fx.frames.try_recv().is_ok());
        }
        assert!(!fx.bridge.channel().lock().is_locked());
    }

    #[test]
    fn paused_identical_frames_are_suppressed() {
        let fx = fixture(1024);
        fx.bridge.set_frame(32, 32).unwrap();
        assert!(fx.bridge.is_paused());

        decode(&fx.bridge, |buf| buf.fill(1));
        assert!(fx.frames.try_recv().is_ok());

        decode(&fx.bridge, |buf| buf.fill(1));
        assert!(fx.frames.try_recv().is_err());

        decode(&fx.bridge, |buf| buf[0] = 2);
        assert!(fx.frames.try_recv().is_ok());
        assert!(!fx.bridge.channel().lock().is_locked());
    }

    #[test]
    fn paused_change_past_prefix_goes_unnoticed() {
        // Known false negative of the prefix fingerprint.
        let fx = fixture(1024);
        fx.bridge.set_frame(64, 64).unwrap();

        decode(&fx.bridge, |buf| buf.fill(0));
        assert!(fx.frames.try_recv().is_ok());

        decode(&fx.bridge, |buf| buf[1024..].fill(0xFF));
        assert!(fx.frames.try_recv().is_err());

        fx.bridge.set_paused(false);
        decode(&fx.bridge, |buf| buf[1024..].fill(0x00));
        assert!(fx.frames.try_recv().is_ok());
    }

    #[test]
    fn unlock_after_stop_is_a_noop() {
        let fx = fixture(1024);
        fx.bridge.set_frame(16, 16).unwrap();
        fx.bridge.set_paused(false);

        let ptr = fx.bridge.lock_entry().unwrap();
        fx.bridge.stop();
        assert!(!fx.bridge.channel().lock().is_locked());
        assert!(fx.bridge.channel().is_closed());

        // The decoder thread may still be writing into its buffer.
        unsafe { ptr.as_ptr().write(42) };
        fx.bridge.unlock_entry();
        assert!(fx.frames.try_recv().is_err());

        assert!(matches!(fx.bridge.lock_entry(), Err(ChannelError::Released)));
        fx.bridge.stop();
    }

    #[test]
    fn lock_entry_without_buffer_fails_unlocked() {
        let fx = fixture(1024);
        assert!(matches!(fx.bridge.lock_entry(), Err(ChannelError::NotAllocated)));
        assert!(!fx.bridge.channel().lock().is_locked());

        // A stray unlock must not release a lock someone else holds.
        fx.bridge.channel().lock().acquire();
        fx.bridge.unlock_entry();
        assert!(fx.bridge.channel().lock().is_locked());
    }
}
