//! Command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use multicam_daq::config::RecordingConfig;
use multicam_daq::error::{AcqError, AppResult};
use multicam_daq::microcontroller;
use multicam_daq::paths;
use multicam_daq::session::AcquisitionSession;

#[derive(Parser)]
#[command(
    name = "multicam_daq",
    about = "Hardware-synchronized multi-camera video acquisition"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record from every camera in the config for a fixed duration.
    Record {
        /// Directory the recording is saved into.
        save_location: PathBuf,
        /// Recording duration in seconds.
        #[arg(long)]
        duration_s: f64,
        /// Path to the recording config YAML.
        #[arg(long)]
        config: PathBuf,
        /// Override the global frame rate from the config.
        #[arg(long)]
        fps: Option<u32>,
        /// Override the output filename prefix from the config.
        #[arg(long)]
        prefix: Option<String>,
        /// Save directly into the save location instead of a
        /// datetime-named subdirectory.
        #[arg(long)]
        no_datetime_subdir: bool,
        /// Allow reuse of an existing save location.
        #[arg(long)]
        overwrite: bool,
    },
    /// Drive the trigger schedule with no cameras attached (rig bring-up).
    McuStandalone {
        /// Path to the recording config YAML.
        #[arg(long)]
        config: PathBuf,
        /// Duration in seconds.
        #[arg(long)]
        duration_s: f64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    match cli.command {
        Command::Record {
            save_location,
            duration_s,
            config,
            fps,
            prefix,
            no_datetime_subdir,
            overwrite,
        } => {
            let mut config = RecordingConfig::load(&config)?;
            if let Some(fps) = fps {
                config.globals.fps = fps;
            }
            if let Some(prefix) = prefix {
                config.globals.prefix = prefix;
            }

            let rec_dir = paths::prepare_rec_dir(&save_location, !no_datetime_subdir, overwrite)?;
            multicam_daq::logging::init(Some(
                &rec_dir.join(format!("{}.log", config.globals.prefix)),
            ))?;

            let duration = Duration::from_secs_f64(duration_s);
            let summary = AcquisitionSession::new(config, rec_dir, duration)
                .run()
                .await?;
            info!("Recording finished: {:?}", summary.outcome);
            Ok(())
        }
        Command::McuStandalone { config, duration_s } => {
            multicam_daq::logging::init(None)?;
            let config = RecordingConfig::load(&config)?;
            config.validate()?;

            let stop = Arc::new(AtomicBool::new(false));
            let ctrl_c_stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_stop.store(true, Ordering::SeqCst);
                }
            });

            let duration = Duration::from_secs_f64(duration_s);
            tokio::task::spawn_blocking(move || {
                microcontroller::run_standalone(&config, duration, stop)
            })
            .await
            .map_err(|e| AcqError::WorkerFailed(format!("standalone task: {e}")))?
        }
    }
}
