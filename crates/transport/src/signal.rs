//! Coalescing "frame ready" signal.
//!
//! A depth-1 crossbeam channel: while one notification is pending, further
//! ones fold into it. The buffer only ever holds the latest frame, so a single
//! pending redraw is all a reader needs.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

/// Sending half of a frame-ready signal.
#[derive(Debug, Clone)]
pub struct FrameSignal {
    tx: Sender<()>,
}

/// Create a signal and the receiver that wakes on it.
pub fn frame_signal() -> (FrameSignal, Receiver<()>) {
    let (tx, rx) = channel::bounded(1);
    (FrameSignal { tx }, rx)
}

impl FrameSignal {
    /// Post a notification. Returns `false` if it was folded into a pending
    /// one or nobody is listening anymore.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_coalesce() {
        let (signal, rx) = frame_signal();

        assert!(signal.notify());
        assert!(!signal.notify());
        assert!(!signal.notify());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        assert!(signal.notify());
    }

    #[test]
    fn notify_without_listener_is_harmless() {
        let (signal, rx) = frame_signal();
        drop(rx);
        assert!(!signal.notify());
    }
}
