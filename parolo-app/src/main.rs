//! `parolo` — realtime Esperanto meeting transcription service.
//!
//! Thin host around `parolo-core`: CLI flags, logging bootstrap, config
//! loading, signal handling. Exit codes: 0 success, 2 configuration error,
//! 3 fatal recognizer error, 130 interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parolo_core::audio::device;
use parolo_core::config::Config;
use parolo_core::error::ParoloError;
use parolo_core::pipeline::Pipeline;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 2;
const EXIT_BACKEND_FATAL: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "parolo",
    version,
    about = "Realtime Esperanto meeting transcription with caption fan-out"
)]
struct Cli {
    /// Enumerate audio input devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Print the effective configuration (secrets masked) and exit.
    #[arg(long)]
    show_config: bool,

    /// Run the audio device diagnosis and exit.
    #[arg(long)]
    diagnose_audio: bool,

    /// Override TRANSCRIPTION_BACKEND (cloud | local_offline | local_large).
    #[arg(long, value_name = "NAME")]
    backend: Option<String>,

    /// Override LOG_LEVEL (error | warn | info | debug | trace).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override LOG_FILE; log to this path instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn init_logging(level: &str, file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));

    match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn exit_code_for(error: &ParoloError) -> u8 {
    match error {
        ParoloError::Config { .. } | ParoloError::PortInUse { .. } => EXIT_CONFIG,
        _ => EXIT_BACKEND_FATAL,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // CLI overrides land in the environment before the config is read, so
    // precedence is flags > env > config file.
    if let Some(backend) = &cli.backend {
        std::env::set_var("TRANSCRIPTION_BACKEND", backend);
    }
    if let Some(level) = &cli.log_level {
        std::env::set_var("LOG_LEVEL", level);
    }
    if let Some(path) = &cli.log_file {
        std::env::set_var("LOG_FILE", path.display().to_string());
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("parolo: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = init_logging(&config.log.level, config.log.file.as_ref()) {
        eprintln!("parolo: cannot initialise logging: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    if cli.list_devices {
        let devices = device::list_input_devices();
        if devices.is_empty() {
            println!("No audio input devices found.");
        }
        for d in devices {
            println!(
                "[{}] {}{}{}{}",
                d.index,
                d.name,
                if d.is_default { " (default)" } else { "" },
                if d.is_loopback_like { " (loopback-like)" } else { "" },
                if d.is_recommended { " (recommended)" } else { "" },
            );
        }
        return ExitCode::from(EXIT_OK);
    }

    if cli.show_config {
        match serde_json::to_string_pretty(&config.masked_json()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("parolo: cannot render config: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
        return ExitCode::from(EXIT_OK);
    }

    if cli.diagnose_audio {
        print!("{}", device::diagnose_report(&config.audio));
        return ExitCode::from(EXIT_OK);
    }

    // ── Run the pipeline until SIGINT or a fatal backend error ───────────
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                info!("interrupt received — shutting down");
                cancel.cancel();
            }
            // A second interrupt skips the graceful path.
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("parolo: forced exit");
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
        });
    }

    let pipeline = Pipeline::new(config);
    match pipeline.run(cancel).await {
        Ok(()) => {
            if interrupted.load(Ordering::SeqCst) {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            error!("pipeline terminated: {e}");
            eprintln!("parolo: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
