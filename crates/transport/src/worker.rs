//! Decode worker state machine.
//!
//! ```text
//! Idle → MediaLoading → MetadataReady → DecoderAttached → Playing ⇄ Paused
//!                                                             ↓
//!                                          Stopping → Terminated
//! ```
//!
//! The native decoder wants its pixel format and lock/unlock entries before
//! playback starts, but only knows the video dimensions after parsing. When it
//! reports ready before dimensions were known, the worker stops and reloads
//! the same media once; the second pass always has them. A second ready
//! without dimensions is fatal.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{MediaBackend, MediaEvent, MediaReport, MediaSource};
use crate::bridge::FrameDecoderBridge;
use crate::error::{BackendError, ChannelError, WorkerError};
use crate::id::WorkerId;
use crate::pool::SlotRelease;
use crate::protocol::WorkerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Nothing loaded.
    Idle,
    /// Load issued, waiting for track info.
    MediaLoading,
    /// Track info parsed; dimensions may still be unknown.
    MetadataReady,
    /// Frame buffer allocated and the decoder's video output registered.
    DecoderAttached,
    Playing,
    Paused,
    /// Tearing down.
    Stopping,
    /// Absorbing; every later command is refused.
    Terminated,
}

impl WorkerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::MediaLoading => "Loading...",
            Self::MetadataReady => "Metadata ready",
            Self::DecoderAttached => "Ready",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopping => "Stopping...",
            Self::Terminated => "Terminated",
        }
    }
}

/// Commands a worker accepts from its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Load(MediaSource),
    Play,
    SetPause(bool),
    Cleanup,
}

pub struct DecodeWorker {
    id: WorkerId,
    bridge: Arc<FrameDecoderBridge>,
    backend: Box<dyn MediaBackend>,
    releaser: Option<Arc<dyn SlotRelease>>,
    events: Sender<WorkerEvent>,
    state: WorkerState,
    media: Option<MediaSource>,
    dimensions: Option<(u32, u32)>,
    attached: bool,
    loaded: bool,
    play_requested: bool,
    /// Set once the current load went through its stop-and-reload.
    restarted: bool,
    restarts: u32,
    /// Tag handed to the backend with the latest load.
    load_seq: u64,
}

impl DecodeWorker {
    /// `releaser` hands the slot back on cleanup. Out-of-process workers pass
    /// `None`; their host releases the slot when it sees the release event.
    pub fn new(
        id: WorkerId,
        bridge: Arc<FrameDecoderBridge>,
        backend: Box<dyn MediaBackend>,
        releaser: Option<Arc<dyn SlotRelease>>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            bridge,
            backend,
            releaser,
            events,
            state: WorkerState::Idle,
            media: None,
            dimensions: None,
            attached: false,
            loaded: false,
            play_requested: false,
            restarted: false,
            restarts: 0,
            load_seq: 0,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn is_decoder_attached(&self) -> bool {
        self.attached
    }

    /// Stop-and-reload cycles performed so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts
    }

    /// Apply one host command.
    ///
    /// A fatal error has already crashed and torn the worker down when it is
    /// returned. Commands after termination fail with
    /// [`WorkerError::Terminated`], except `Cleanup`, which is a no-op.
    pub fn handle(&mut self, cmd: WorkerCommand) -> Result<(), WorkerError> {
        if self.is_finished() {
            if cmd == WorkerCommand::Cleanup {
                return Ok(());
            }
            debug!(worker = %self.id, "Ignoring {:?} after termination", cmd);
            return Err(WorkerError::Terminated);
        }

        let result = match cmd {
            WorkerCommand::Load(media) => self.load(media),
            WorkerCommand::Play => self.play(),
            WorkerCommand::SetPause(paused) => self.set_pause(paused),
            WorkerCommand::Cleanup => {
                self.cleanup();
                Ok(())
            }
        };
        self.fail_on(result)
    }

    /// Apply one tagged backend report. Reports from a load that a later
    /// `Load` or restart superseded are dropped.
    pub fn on_media_report(&mut self, report: MediaReport) -> Result<(), WorkerError> {
        if report.load != self.load_seq {
            debug!(
                worker = %self.id,
                "Dropping {:?} from superseded load {}",
                report.event,
                report.load
            );
            return Ok(());
        }
        self.on_media_event(report.event)
    }

    /// Apply one event of the current load.
    pub fn on_media_event(&mut self, event: MediaEvent) -> Result<(), WorkerError> {
        if self.is_finished() {
            return Ok(());
        }

        let result = match event {
            MediaEvent::MetadataParsed { dimensions } => self.on_metadata(dimensions),
            MediaEvent::Loaded => self.on_loaded(),
            MediaEvent::EndReached => {
                self.on_end_reached();
                Ok(())
            }
            MediaEvent::Error(message) => Err(WorkerError::Backend(BackendError::Decode(message))),
        };
        self.fail_on(result)
    }

    /// Serve commands and backend events until terminated.
    ///
    /// A closed command channel means the host is gone and triggers cleanup.
    /// Returns the error that crashed the worker, if any.
    pub fn run(
        mut self,
        commands: Receiver<WorkerCommand>,
        media: Receiver<MediaReport>,
    ) -> Result<(), WorkerError> {
        let mut media = media;
        let mut failure = None;

        info!(worker = %self.id, backend = self.backend.name(), "Decode worker running");

        while self.state != WorkerState::Terminated {
            let mut media_closed = false;

            let result = select! {
                recv(commands) -> cmd => match cmd {
                    Ok(cmd) => self.handle(cmd),
                    Err(_) => {
                        debug!(worker = %self.id, "Command channel closed, cleaning up");
                        self.handle(WorkerCommand::Cleanup)
                    }
                },
                recv(media) -> event => match event {
                    Ok(report) => self.on_media_report(report),
                    Err(_) => {
                        media_closed = true;
                        Ok(())
                    }
                },
            };

            if media_closed {
                media = channel::never();
            }
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn load(&mut self, media: MediaSource) -> Result<(), WorkerError> {
        info!(worker = %self.id, "Loading {}", media);

        self.backend.stop();
        self.restarted = false;
        self.loaded = false;
        self.media = Some(media.clone());
        self.set_state(WorkerState::MediaLoading);
        self.load_seq += 1;
        self.backend.load(&media, self.load_seq)?;
        Ok(())
    }

    /// Stop and reload the current media. Only called once per load.
    fn restart(&mut self) -> Result<(), WorkerError> {
        let Some(media) = self.media.clone() else {
            return Err(WorkerError::MissingDimensions);
        };

        debug!(worker = %self.id, "Restarting playback...");
        self.restarted = true;
        self.restarts += 1;
        self.loaded = false;

        self.backend.stop();
        self.set_state(WorkerState::Idle);
        self.set_state(WorkerState::MediaLoading);
        self.load_seq += 1;
        self.backend.load(&media, self.load_seq)?;
        Ok(())
    }

    fn on_metadata(&mut self, dimensions: Option<(u32, u32)>) -> Result<(), WorkerError> {
        if self.state == WorkerState::MediaLoading {
            self.set_state(WorkerState::MetadataReady);
        }

        let Some((width, height)) = dimensions else {
            debug!(worker = %self.id, "Metadata parsed without video dimensions");
            return Ok(());
        };

        if self.attached {
            if self.dimensions != Some((width, height)) {
                // The decoder's video output is fixed once registered.
                return Err(WorkerError::Allocation(ChannelError::AlreadyAllocated {
                    size: self.bridge.channel().size().unwrap_or(0),
                }));
            }
        } else {
            let format = self
                .bridge
                .set_frame(width, height)
                .map_err(WorkerError::Allocation)?;
            self.backend.attach_video(self.bridge.clone(), format);
            self.attached = true;
            self.dimensions = Some((width, height));

            self.emit(WorkerEvent::BufferAllocated {
                width,
                height,
                row_size: format.row_size,
            });
        }

        if self.state == WorkerState::MetadataReady {
            self.set_state(WorkerState::DecoderAttached);
        }
        Ok(())
    }

    fn on_loaded(&mut self) -> Result<(), WorkerError> {
        if !self.attached {
            if self.restarted {
                return Err(WorkerError::MissingDimensions);
            }
            return self.restart();
        }

        self.loaded = true;
        if self.state == WorkerState::MetadataReady {
            self.set_state(WorkerState::DecoderAttached);
        }
        if self.play_requested {
            self.start_playback();
        }
        Ok(())
    }

    fn on_end_reached(&mut self) {
        info!(worker = %self.id, "End of media reached");
        self.backend.stop();
        self.bridge.set_paused(true);
        if self.state == WorkerState::Playing {
            self.set_state(WorkerState::Paused);
        }
    }

    fn play(&mut self) -> Result<(), WorkerError> {
        self.play_requested = true;
        self.bridge.set_paused(false);

        if self.loaded && self.attached {
            self.start_playback();
        }
        Ok(())
    }

    fn set_pause(&mut self, paused: bool) -> Result<(), WorkerError> {
        match (self.state, paused) {
            (WorkerState::Playing, true) => {
                self.bridge.set_paused(true);
                self.backend.set_pause(true);
                self.set_state(WorkerState::Paused);
            }
            (WorkerState::Paused, false) => {
                self.bridge.set_paused(false);
                self.backend.play();
                self.set_state(WorkerState::Playing);
            }
            (_, false) => return self.play(),
            (_, true) => {
                self.play_requested = false;
                self.bridge.set_paused(true);
            }
        }
        Ok(())
    }

    fn start_playback(&mut self) {
        if self.state == WorkerState::Playing {
            return;
        }
        self.bridge.set_paused(false);
        self.backend.play();
        self.set_state(WorkerState::Playing);
    }

    /// Stop the bridge before the backend: a decode thread blocked in the lock
    /// entry is only freed by the bridge's force release.
    fn cleanup(&mut self) {
        if self.is_finished() {
            return;
        }

        self.set_state(WorkerState::Stopping);
        self.bridge.stop();
        self.backend.stop();

        if let Some(releaser) = &self.releaser {
            releaser.release_slot(&self.id);
        }
        self.emit(WorkerEvent::Released {
            id: self.id.clone(),
        });

        info!(worker = %self.id, "Decode worker released");
        self.set_state(WorkerState::Terminated);
    }

    fn crash(&mut self, e: &WorkerError) {
        error!(worker = %self.id, "Decode worker crashed: {}", e);
        self.emit(WorkerEvent::Crashed {
            id: self.id.clone(),
            reason: e.to_string(),
        });
        self.cleanup();
    }

    fn fail_on(&mut self, result: Result<(), WorkerError>) -> Result<(), WorkerError> {
        if let Err(e) = &result {
            self.crash(e);
        }
        result
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, WorkerState::Stopping | WorkerState::Terminated)
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state == state {
            return;
        }
        debug!(worker = %self.id, "{:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(WorkerEvent::State { state });
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            warn!(worker = %self.id, "Worker event receiver gone");
        }
    }
}
