//! Host/worker line protocol.
//!
//! One JSON object per line. The host writes [`HostCommand`]s to the worker's
//! stdin; the worker writes [`WorkerEvent`]s to stdout. Logs go to stderr.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::backend::MediaSource;
use crate::error::ProtocolError;
use crate::id::WorkerId;
use crate::worker::{WorkerCommand, WorkerState};

/// Commands from the host process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HostCommand {
    /// Load a media reference
    Load { media: MediaSource },

    Play,

    /// Set or clear pause
    Pause { paused: bool },

    /// Stop, free the buffer and exit
    Cleanup,
}

impl From<HostCommand> for WorkerCommand {
    fn from(cmd: HostCommand) -> Self {
        match cmd {
            HostCommand::Load { media } => WorkerCommand::Load(media),
            HostCommand::Play => WorkerCommand::Play,
            HostCommand::Pause { paused } => WorkerCommand::SetPause(paused),
            HostCommand::Cleanup => WorkerCommand::Cleanup,
        }
    }
}

/// Events from a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The frame buffer exists; the host may attach to it
    BufferAllocated {
        width: u32,
        height: u32,
        row_size: u32,
    },

    /// A new frame is in the buffer (coalesced)
    FrameReady,

    /// State machine transition
    State { state: WorkerState },

    /// Fatal worker failure
    Crashed { id: WorkerId, reason: String },

    /// Buffer closed and slot handed back
    Released { id: WorkerId },
}

/// Serialize `msg` as one line and flush.
pub fn write_line<W: Write, T: Serialize>(out: &mut W, msg: &T) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *out, msg)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Read the next message. Blank lines are skipped; end of stream is
/// [`ProtocolError::Closed`].
pub fn read_line<R: BufRead, T: for<'de> Deserialize<'de>>(input: &mut R) -> Result<T, ProtocolError> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(ProtocolError::Closed);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn command_wire_format() {
        let cmd = HostCommand::Load {
            media: "synthetic:64x48@60".parse().unwrap(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"cmd":"load","media":"synthetic:64x48@60"}"#);

        let cmd: HostCommand = serde_json::from_str(r#"{"cmd":"pause","paused":true}"#).unwrap();
        assert_eq!(cmd, HostCommand::Pause { paused: true });

        let cmd: HostCommand = serde_json::from_str(r#"{"cmd":"cleanup"}"#).unwrap();
        assert_eq!(WorkerCommand::from(cmd), WorkerCommand::Cleanup);
    }

    #[test]
    fn event_wire_format() {
        let event = WorkerEvent::BufferAllocated {
            width: 640,
            height: 480,
            row_size: 2560,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"buffer_allocated""#));
        assert!(json.contains(r#""row_size":2560"#));

        let event = WorkerEvent::State {
            state: WorkerState::DecoderAttached,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"state","state":"decoder_attached"}"#
        );
    }

    #[test]
    fn rejects_bad_worker_id() {
        let parsed: Result<WorkerEvent, _> =
            serde_json::from_str(r#"{"event":"released","id":"not-an-id"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn lines_round_trip_through_a_stream() {
        let id = WorkerId::new();
        let mut out = Vec::new();
        write_line(&mut out, &WorkerEvent::FrameReady).unwrap();
        write_line(&mut out, &WorkerEvent::Released { id: id.clone() }).unwrap();
        out.extend_from_slice(b"\n");

        let mut input = Cursor::new(out);
        let first: WorkerEvent = read_line(&mut input).unwrap();
        let second: WorkerEvent = read_line(&mut input).unwrap();
        assert_eq!(first, WorkerEvent::FrameReady);
        assert_eq!(second, WorkerEvent::Released { id });
        assert!(matches!(
            read_line::<_, WorkerEvent>(&mut input),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn malformed_line_is_a_json_error() {
        let mut input = Cursor::new(b"{\"cmd\":\"rewind\"}\n".to_vec());
        assert!(matches!(
            read_line::<_, HostCommand>(&mut input),
            Err(ProtocolError::Json(_))
        ));
    }
}
