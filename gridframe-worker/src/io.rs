//! Protocol plumbing between the worker and its host.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use gf_transport::protocol::{self, HostCommand, WorkerEvent};
use gf_transport::{ProtocolError, WorkerCommand};

/// Read host commands from stdin. End of input drops `commands`, which the
/// worker treats as a cleanup request.
pub fn spawn_command_reader(commands: Sender<WorkerCommand>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("host-commands".to_string())
        .spawn(move || {
            let mut input = io::stdin().lock();
            loop {
                match protocol::read_line::<_, HostCommand>(&mut input) {
                    Ok(cmd) => {
                        debug!("Host command: {:?}", cmd);
                        if commands.send(cmd.into()).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::Json(e)) => warn!("Ignoring malformed host command: {}", e),
                    Err(ProtocolError::Closed) => {
                        debug!("Host closed stdin");
                        break;
                    }
                    Err(e) => {
                        warn!("Host command stream failed: {}", e);
                        break;
                    }
                }
            }
        })
}

/// Write worker events and coalesced frame-ready notifications to stdout
/// until the worker drops its event sender.
pub fn spawn_event_writer(
    events: Receiver<WorkerEvent>,
    frames: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("worker-events".to_string())
        .spawn(move || {
            let mut frames = frames;
            loop {
                let event = select! {
                    recv(events) -> event => match event {
                        Ok(event) => Some(event),
                        Err(_) => break,
                    },
                    recv(frames) -> frame => frame.ok().map(|()| WorkerEvent::FrameReady),
                };

                let Some(event) = event else {
                    // The bridge is gone; only events remain.
                    frames = channel::never();
                    continue;
                };

                if let Err(e) = protocol::write_line(&mut io::stdout().lock(), &event) {
                    debug!("Host stopped reading events: {}", e);
                    break;
                }
            }
        })
}
