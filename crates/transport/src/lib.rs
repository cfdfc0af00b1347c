//! Multiprocess software-decode frame transport.
//!
//! A decode worker (usually its own OS process) writes decoded pixels into a
//! named shared memory segment; a renderer in another process copies them out
//! under a lock that lives in the pool's slot table.
//!
//! ```text
//! Host process                          Worker process
//! ┌──────────────────────┐             ┌────────────────────────┐
//! │ WorkerPool           │  slot table │ DecodeWorker           │
//! │  - slot locks  ◄─────┼─── (mmap) ──┼─► FrameDecoderBridge   │
//! │ RenderBridge         │             │    lock/unlock entries │
//! │  - copy + display ◄──┼── segment ──┼─── native decoder      │
//! │ WorkerProcess        │   (mmap)    │                        │
//! │  - reader/render ◄───┼── stdout ───┼─── events (JSON lines) │
//! └──────────────────────┘             └────────────────────────┘
//! ```
//!
//! The same primitives work inside a single process, which is how most of the
//! tests drive them.

pub mod backend;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod id;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod render;
pub mod shm;
pub mod signal;
pub mod worker;

pub use bridge::FrameDecoderBridge;
pub use channel::{ChannelGuard, SharedFrameChannel};
pub use config::TransportConfig;
pub use error::{
    BackendError, ChannelError, ConfigError, PoolError, ProcessError, ProtocolError, WorkerError,
};
pub use id::WorkerId;
pub use pool::{SlotHandle, SlotRelease, SlotTable, WorkerPool};
pub use process::{LifecycleEvent, WorkerProcess};
pub use protocol::{HostCommand, WorkerEvent};
pub use render::{DisplayUpdate, FrameImage, RenderBridge, WorkerControl};
pub use shm::SlotLock;
pub use signal::{frame_signal, FrameSignal};
pub use worker::{DecodeWorker, WorkerCommand, WorkerState};
