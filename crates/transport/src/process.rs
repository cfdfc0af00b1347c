//! Host-side supervision of one decode worker process.
//!
//! The host claims the slot, spawns the worker binary with the slot table
//! path and talks to it over stdin/stdout. Two threads run per worker:
//!
//! - reader: parses worker events, attaches the render bridge on buffer
//!   allocation, coalesces frame-ready notifications and reports lifecycle
//!   events
//! - render: drains the coalesced signal and copies frames to the display
//!
//! The slot goes back to the pool when the worker reports release or its
//! stdout closes, whichever comes first.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendKind, MediaSource};
use crate::config::TransportConfig;
use crate::error::{ProcessError, ProtocolError};
use crate::id::WorkerId;
use crate::pool::WorkerPool;
use crate::protocol::{self, HostCommand, WorkerEvent};
use crate::render::{DisplayUpdate, RenderBridge, WorkerControl};
use crate::signal::{frame_signal, FrameSignal};

/// Reported to whoever supervises worker processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Crashed { id: WorkerId, reason: String },
    Released { id: WorkerId },
    /// The worker's stdout closed.
    Exited { id: WorkerId },
}

/// Sends cleanup over the worker's stdin.
struct StdinControl(Arc<Mutex<ChildStdin>>);

impl WorkerControl for StdinControl {
    fn request_teardown(&self) {
        if let Err(e) = protocol::write_line(&mut *self.0.lock(), &HostCommand::Cleanup) {
            debug!("Could not send cleanup to worker: {}", e);
        }
    }
}

pub struct WorkerProcess {
    id: WorkerId,
    pool: Arc<WorkerPool>,
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    renderer: Arc<Mutex<RenderBridge>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Claim a slot and start `program` as its decode worker.
    ///
    /// Capacity errors surface before anything is spawned.
    pub fn spawn(
        program: impl AsRef<Path>,
        pool: Arc<WorkerPool>,
        config: &TransportConfig,
        backend: BackendKind,
        display: Sender<DisplayUpdate>,
        lifecycle: Sender<LifecycleEvent>,
    ) -> Result<Self, ProcessError> {
        let id = WorkerId::new();
        let slot = pool.claim(&id)?;

        let spawned = Command::new(program.as_ref())
            .arg("--id")
            .arg(id.as_str())
            .arg("--slot-table")
            .arg(pool.table_path())
            .arg("--shm-dir")
            .arg(&config.shm_dir)
            .arg("--segment-prefix")
            .arg(&config.segment_prefix)
            .arg("--backend")
            .arg(backend.as_str())
            .arg("--log-level")
            .arg(&config.worker_log_level)
            .arg("--fingerprint-len")
            .arg(config.fingerprint_len.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                pool.release(&id);
                return Err(ProcessError::Spawn(e));
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            (stdin, _) => {
                let _ = child.kill();
                let _ = child.wait();
                pool.release(&id);
                return Err(ProcessError::MissingPipe(if stdin.is_none() {
                    "stdin"
                } else {
                    "stdout"
                }));
            }
        };

        info!(
            worker = %id,
            slot = slot.index,
            pid = child.id(),
            "Spawned {} decode worker",
            backend
        );

        let stdin = Arc::new(Mutex::new(stdin));
        let renderer = Arc::new(Mutex::new(
            RenderBridge::new(id.clone(), pool.clone(), display, config)
                .with_control(StdinControl(stdin.clone())),
        ));

        let (signal, frames) = frame_signal();
        let mut threads = Vec::with_capacity(2);

        let reader = EventReader {
            id: id.clone(),
            pool: pool.clone(),
            renderer: renderer.clone(),
            signal,
            lifecycle,
        };
        let render = renderer.clone();

        let started = thread::Builder::new()
            .name(format!("worker-events-{}", &id.as_str()[..8]))
            .spawn(move || reader.run(BufReader::new(stdout)))
            .and_then(|handle| {
                threads.push(handle);
                thread::Builder::new()
                    .name(format!("worker-render-{}", &id.as_str()[..8]))
                    .spawn(move || render_loop(render, frames))
            });

        let mut process = Self {
            id,
            pool,
            child,
            stdin,
            renderer,
            threads,
        };

        match started {
            Ok(handle) => {
                process.threads.push(handle);
                Ok(process)
            }
            // Drop kills the child and frees the slot.
            Err(e) => Err(ProcessError::Spawn(e)),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn send(&self, cmd: &HostCommand) -> Result<(), ProcessError> {
        protocol::write_line(&mut *self.stdin.lock(), cmd)?;
        Ok(())
    }

    pub fn load(&self, media: MediaSource) -> Result<(), ProcessError> {
        self.send(&HostCommand::Load { media })
    }

    pub fn play(&self) -> Result<(), ProcessError> {
        self.send(&HostCommand::Play)
    }

    pub fn pause(&self, paused: bool) -> Result<(), ProcessError> {
        self.send(&HostCommand::Pause { paused })
    }

    /// Frames copied to the display so far.
    pub fn frames_displayed(&self) -> u64 {
        self.renderer.lock().frames_displayed()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Tear the worker down: close the render side, ask the worker to clean
    /// up, and wait up to `timeout` before killing it.
    pub fn cleanup(mut self, timeout: Duration) -> Result<ExitStatus, ProcessError> {
        self.renderer.lock().cleanup();

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(worker = %self.id, "Worker did not exit in {:?}, killing it", timeout);
                let _ = self.child.kill();
                break self.child.wait().map_err(ProcessError::Wait)?;
            }
            thread::sleep(Duration::from_millis(10));
        };

        self.join_threads();
        self.pool.release(&self.id);

        info!(worker = %self.id, "Worker exited with {}", status);
        Ok(status)
    }

    fn join_threads(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(worker = %self.id, "Worker supervision thread panicked");
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(worker = %self.id, "Killing worker process still running at drop");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }

        self.renderer.lock().close_channel();
        self.join_threads();
        self.pool.release(&self.id);
    }
}

struct EventReader {
    id: WorkerId,
    pool: Arc<WorkerPool>,
    renderer: Arc<Mutex<RenderBridge>>,
    signal: FrameSignal,
    lifecycle: Sender<LifecycleEvent>,
}

impl EventReader {
    fn run<R: BufRead>(self, mut stdout: R) {
        loop {
            match protocol::read_line::<_, WorkerEvent>(&mut stdout) {
                Ok(event) => self.dispatch(event),
                Err(ProtocolError::Json(e)) => {
                    warn!(worker = %self.id, "Malformed worker event: {}", e);
                }
                Err(ProtocolError::Closed) => break,
                Err(e) => {
                    warn!(worker = %self.id, "Worker event stream failed: {}", e);
                    break;
                }
            }
        }

        self.renderer.lock().close_channel();
        if self.pool.release(&self.id) {
            debug!(worker = %self.id, "Freed slot of exited worker");
        }
        self.report(LifecycleEvent::Exited {
            id: self.id.clone(),
        });
    }

    fn dispatch(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::BufferAllocated {
                width,
                height,
                row_size,
            } => {
                if let Err(e) = self.renderer.lock().on_buffer_allocated(width, height, row_size) {
                    warn!(worker = %self.id, "Could not attach to frame buffer: {}", e);
                }
            }
            WorkerEvent::FrameReady => {
                self.signal.notify();
            }
            WorkerEvent::State { state } => {
                debug!(worker = %self.id, "Worker state: {}", state.label());
            }
            WorkerEvent::Crashed { id, reason } => {
                error!(worker = %id, "Worker crashed: {}", reason);
                self.report(LifecycleEvent::Crashed { id, reason });
            }
            WorkerEvent::Released { id } => {
                if id != self.id {
                    warn!(worker = %self.id, "Worker reported release as {}", id);
                }
                self.renderer.lock().close_channel();
                self.pool.release(&self.id);
                self.report(LifecycleEvent::Released {
                    id: self.id.clone(),
                });
            }
        }
    }

    fn report(&self, event: LifecycleEvent) {
        if self.lifecycle.send(event).is_err() {
            debug!(worker = %self.id, "Lifecycle receiver gone");
        }
    }
}

fn render_loop(renderer: Arc<Mutex<RenderBridge>>, frames: Receiver<()>) {
    // Ends when the reader drops its signal.
    for () in frames.iter() {
        renderer.lock().process_frame();
    }
}
