use std::path::PathBuf;
use std::process::ExitCode;
use clap::Parser;
use log::{error, info, LevelFilter};
use loadcell_monitor::{init_logging, run};
use loadcell_monitor::config::types::DisplayUnit;
use loadcell_monitor::console::application::ApplicationFlags;
use loadcell_monitor::error::{AppRunError, ConfigError};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Streams force readings from a bluetooth load cell.\n\nExample: loadcell-monitor --device progressor --unit kg", long_about = None)]
struct Args {
    /// Connect to the first device whose name contains this text (case-insensitive)
    #[arg(long)]
    device: Option<String>,

    /// Unit to display readings in: lb or kg
    #[arg(long)]
    unit: Option<DisplayUnit>,

    /// How often (milliseconds) to read devices that do not support notifications
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Stop scanning after this many seconds
    #[arg(long)]
    scan_timeout_secs: Option<u64>,

    /// Use this config file instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the config file
    #[arg(long)]
    save_config: bool,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("Load cell monitor ", env!("CARGO_PKG_VERSION")));

    let flags = ApplicationFlags {
        config_path: args.config,
        device_name: args.device,
        unit: args.unit,
        poll_interval_ms: args.poll_interval_ms,
        scan_timeout_secs: args.scan_timeout_secs,
        save_config: args.save_config,
    };

    match run(flags) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
