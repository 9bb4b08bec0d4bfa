//! `isi-rig` binary: assemble the core and drive it over stdin/stdout.
//!
//! One JSON command per input line, one JSON event per output line (direct
//! replies and broadcasts interleaved). The desktop shell talks to this
//! process; the framing here is deliberately minimal since the schema in
//! [`isi_rig::messages`] is the actual interface.

use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;

use isi_rig::config::Settings;
use isi_rig::core::App;
use isi_rig::messages::Command;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "isi-rig", version, about = "ISI acquisition and retinotopy core")]
struct Cli {
    /// Path to a settings TOML (defaults to ./isi-rig.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data root directory.
    #[arg(long)]
    data_root: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(data_root) = cli.data_root {
        settings.library_dir = data_root.join("stimulus_library");
        settings.data_root = data_root;
    }
    tracing::info!(data_root = %settings.data_root.display(), "starting");

    let app = App::new(settings)?;

    // Broadcast events go to stdout alongside direct replies.
    let broadcast_rx = app.events().subscribe();
    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || {
            for event in broadcast_rx {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::error!(error = %err, "unserializable event"),
                }
            }
        })?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => app.handle_command(command),
            Err(err) => isi_rig::messages::Event::Error {
                code: "bad_command".into(),
                message: err.to_string(),
            },
        };
        println!("{}", serde_json::to_string(&reply)?);
    }

    tracing::info!("stdin closed, shutting down");
    drop(app);
    drop(printer);
    Ok(())
}
