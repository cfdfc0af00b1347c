//! gridframe decode worker
//!
//! One process per software-decoded video. The host's worker pool spawns it
//! with the path of its slot table; the worker finds its slot by id, decodes
//! into a shared frame buffer and reports events as JSON lines on stdout.
//! Logs go to stderr.

mod io;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use crossbeam::channel;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gf_transport::backend::{self, BackendKind};
use gf_transport::config::{default_shm_dir, DEFAULT_FINGERPRINT_LEN};
use gf_transport::protocol::{self, WorkerEvent};
use gf_transport::{
    frame_signal, DecodeWorker, FrameDecoderBridge, SharedFrameChannel, SlotTable,
    TransportConfig, WorkerId,
};

/// gridframe worker - decodes one video into a shared frame buffer
#[derive(Parser, Debug)]
#[command(name = "gridframe-worker")]
#[command(about = "Software decode worker for the gridframe frame transport")]
#[command(version)]
struct Args {
    /// Worker id (32 lowercase hex characters); names the frame segment
    #[arg(long)]
    id: String,

    /// Slot table created by the host's worker pool
    #[arg(long)]
    slot_table: PathBuf,

    /// Directory for frame segments (default: /dev/shm or the runtime dir)
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// File name prefix for frame segments
    #[arg(long, default_value = "gridframe")]
    segment_prefix: String,

    /// Decoder backend (synthetic, ffmpeg)
    #[arg(long, default_value = "synthetic")]
    backend: BackendKind,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Bytes compared to detect a changed frame while paused
    #[arg(long, default_value_t = DEFAULT_FINGERPRINT_LEN)]
    fingerprint_len: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let id = WorkerId::parse(&args.id).context("invalid --id")?;
    install_panic_hook(id.clone());

    let table = SlotTable::open(&args.slot_table)
        .with_context(|| format!("cannot open slot table {}", args.slot_table.display()))?;
    let slot = table
        .handle(&id)
        .context("worker has no slot in the pool")?;

    let config = TransportConfig {
        shm_dir: args.shm_dir.unwrap_or_else(default_shm_dir),
        segment_prefix: args.segment_prefix,
        fingerprint_len: args.fingerprint_len,
        ..TransportConfig::default()
    };

    info!(
        worker = %id,
        slot = slot.index,
        pid = std::process::id(),
        "Decode worker starting ({} backend)",
        args.backend
    );

    let (signal, frames) = frame_signal();
    let channel = SharedFrameChannel::new(id.clone(), slot.lock, &config);
    let bridge = Arc::new(FrameDecoderBridge::new(channel, signal, config.fingerprint_len));

    let (media_tx, media_rx) = channel::unbounded();
    let backend = backend::create(args.backend, media_tx).context("cannot create decoder backend")?;

    let (events_tx, events_rx) = channel::unbounded();
    let (commands_tx, commands_rx) = channel::unbounded();

    // Not joined: it stays blocked on stdin until the process exits.
    io::spawn_command_reader(commands_tx).context("cannot start command reader")?;
    let writer = io::spawn_event_writer(events_rx, frames).context("cannot start event writer")?;

    // The host owns slot membership, so no releaser here.
    let worker = DecodeWorker::new(id, bridge, backend, None, events_tx);
    let result = worker.run(commands_rx, media_rx);

    if writer.join().is_err() {
        error!("Event writer panicked");
    }

    result.context("decode worker crashed")?;
    info!("Decode worker exiting");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Report panics to the host as a crash before exiting.
fn install_panic_hook(id: WorkerId) {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        error!("Unhandled failure: {}", info);

        let event = WorkerEvent::Crashed {
            id: id.clone(),
            reason: format!("panic: {}", info),
        };
        let _ = protocol::write_line(&mut std::io::stdout().lock(), &event);

        default_hook(info);
        std::process::exit(1);
    }));
}
