//! ecore-buffer demo - provider and consumer sharing a buffer queue
//!
//! Renders a moving test pattern on the provider side, hands each frame
//! over the queue and scans it out on a virtual KMS display.

mod app;
mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ecore_buffer::Config;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ecore-buffer-demo")]
#[command(about = "Buffer queue demo on a virtual KMS display", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to present before exiting
    #[arg(short, long, default_value_t = 120)]
    frames: u64,

    /// Number of virtual displays connected at startup
    #[arg(short, long, default_value_t = 1)]
    outputs: usize,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    // Set up panic hook to log panics before crashing
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        if let Ok(home) = std::env::var("HOME") {
            let crash_log = format!("{}/.local/state/ecore-buffer/crash.log", home);
            if let Ok(mut f) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&crash_log)
            {
                use std::io::Write;
                let _ = writeln!(f, "[{}] PANIC: {}", chrono::Local::now(), panic_info);
            }
        }
    }));

    // Log directory: $XDG_STATE_HOME/ecore-buffer, ~/.local/state/ecore-buffer or /tmp/ecore-buffer
    let log_dir = std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("ecore-buffer");

    std::fs::create_dir_all(&log_dir).ok();

    let args = Args::parse();

    let file_appender = rolling::daily(&log_dir, "demo.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if args.debug {
        "debug,ecore_buffer=debug"
    } else {
        "warn,ecore_buffer=info,ecore_buffer_demo=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!(log_path = %log_dir.display(), "ecore-buffer demo starting");

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    app::run(config, args.frames, args.outputs.max(1))
}
