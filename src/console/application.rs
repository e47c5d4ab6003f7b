use std::path::PathBuf;
use log::{error, info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::{Config, DisplayUnit};
use crate::console::input::{parse_command, ConsoleCommand, HELP};
use crate::device::connection::BtleTransport;
use crate::device::constants::OPERATION_DEADLINE;
use crate::device::policy::CharacteristicPolicy;
use crate::device::registry::match_name;
use crate::device::runtime::{session_channel, spawn_session, SessionHandle};
use crate::device::session::DeviceSession;
use crate::device::types::{PeripheralIdentity, SessionSnapshot, SessionState, UserCommand};
use crate::error::AppRunError;

/// Settings given on the command line, these take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ApplicationFlags {
    pub config_path: Option<PathBuf>,
    pub device_name: Option<String>,
    pub unit: Option<DisplayUnit>,
    pub poll_interval_ms: Option<u64>,
    pub scan_timeout_secs: Option<u64>,
    pub save_config: bool,
}

impl ApplicationFlags {
    pub fn apply(&self, config: &mut Config) {
        if let Some(device_name) = &self.device_name {
            config.device_name = Some(device_name.clone());
        }
        if let Some(unit) = self.unit {
            config.display_unit = unit;
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.poll_interval_ms = poll_interval_ms;
        }
        if let Some(scan_timeout_secs) = self.scan_timeout_secs {
            config.scan_timeout_secs = scan_timeout_secs;
        }
    }
}

/// Turns session snapshots into lines of text.
pub struct Console {
    unit: DisplayUnit,
    device_name: Option<String>,
    previous: SessionSnapshot,
}

impl Console {
    pub fn new(config: &Config) -> Self {
        Console {
            unit: config.display_unit,
            device_name: config.device_name.clone(),
            previous: SessionSnapshot::default(),
        }
    }

    pub fn toggle_unit(&mut self) -> DisplayUnit {
        self.unit = self.unit.toggled();
        self.unit
    }

    pub fn format_reading(&self, snapshot: &SessionSnapshot) -> String {
        format!(
            "{:>10.2} {}    max {:>10.2} {}",
            self.unit.convert(snapshot.current_reading),
            self.unit,
            self.unit.convert(snapshot.max_reading),
            self.unit,
        )
    }

    pub fn format_devices(devices: &[PeripheralIdentity]) -> String {
        if devices.is_empty() {
            return "No devices found".to_string();
        }

        devices
            .iter()
            .enumerate()
            .map(|(index, device)| format!("{:>3}. {}", index + 1, device))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Lines to print for the difference between the previous snapshot and this one.
    pub fn render(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = vec![];

        if snapshot.state != self.previous.state {
            lines.push(format!("== {}", snapshot.state));
        }

        if let Some(error) = &snapshot.last_error {
            if self.previous.last_error.as_ref() != Some(error) {
                lines.push(format!("!! {}", error));
            }
        }

        if let Some(advisory) = &snapshot.last_advisory {
            if self.previous.last_advisory.as_ref() != Some(advisory) {
                lines.push(format!("-- {}", advisory));
            }
        }

        let reading_changed = snapshot.current_reading != self.previous.current_reading
            || snapshot.max_reading != self.previous.max_reading;
        if snapshot.state.is_connected() && reading_changed {
            lines.push(self.format_reading(snapshot));
        }

        self.previous = snapshot.clone();
        lines
    }

    /// The device to connect to without asking, if a name to look for was configured.
    pub fn auto_connect_target(&self, snapshot: &SessionSnapshot) -> Option<PeripheralIdentity> {
        if snapshot.state != SessionState::Scanning {
            return None;
        }

        let name = self.device_name.as_ref()?;
        match_name(snapshot.known_devices.iter(), name).cloned()
    }
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", &err);
            }
            Config::default()
        },
    }
}

async fn on_scan_timeout(console: &Console, handle: &mut SessionHandle) -> Result<(), AppRunError> {
    let snapshot = handle.snapshot();
    if snapshot.state != SessionState::Scanning {
        return Ok(());
    }

    if let Some(name) = &console.device_name {
        warn!("No device named {:?} found", name);
        handle.command(UserCommand::StopScan).await?;
        println!("{}", Console::format_devices(&snapshot.known_devices));
        return Ok(());
    }

    match snapshot.known_devices.first() {
        Some(device) => {
            println!("{}", Console::format_devices(&snapshot.known_devices));
            handle.command(UserCommand::Connect(device.clone())).await?;
        },
        None => {
            handle.command(UserCommand::StopScan).await?;
            println!("No devices found, type 's' to scan again");
        },
    }

    Ok(())
}

async fn on_console_command(
    command: ConsoleCommand,
    console: &mut Console,
    handle: &mut SessionHandle,
) -> Result<(), AppRunError> {
    match command {
        ConsoleCommand::Session(command) => handle.command(command).await?,
        ConsoleCommand::ConnectIndex(index) => {
            let snapshot = handle.snapshot();
            match snapshot.known_devices.get(index - 1) {
                Some(device) => handle.command(UserCommand::Connect(device.clone())).await?,
                None => println!("There is no device {}", index),
            }
        },
        ConsoleCommand::ListDevices => {
            println!("{}", Console::format_devices(&handle.snapshot().known_devices));
        },
        ConsoleCommand::ToggleUnit => {
            let unit = console.toggle_unit();
            println!("Displaying readings in {}", unit);
            println!("{}", console.format_reading(&handle.snapshot()));
        },
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {},
    }

    Ok(())
}

// the runtime is dropped after this, which would abort a disconnect that is still in progress
async fn disconnect_before_exit(handle: &mut SessionHandle) -> Result<(), AppRunError> {
    if handle.snapshot().state.target().is_none() {
        return Ok(());
    }

    handle.command(UserCommand::Disconnect).await?;

    let mut snapshots = handle.subscribe();
    let wait_for_idle = async {
        while snapshots.borrow_and_update().state != SessionState::Idle {
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = sleep(Duration::from_millis(OPERATION_DEADLINE)) => {
            warn!("Disconnecting took too long");
        }
        _ = wait_for_idle => {}
    }

    Ok(())
}

async fn run_console(config: Config) -> Result<(), AppRunError> {
    let app_cancel = CancellationToken::new();
    let (sender, receiver) = session_channel();
    let transport = BtleTransport::new(app_cancel.clone(), sender.clone()).await?;
    let session = DeviceSession::new(CharacteristicPolicy::new(config.poll_interval_ms));
    let (mut handle, session_task) = spawn_session(app_cancel.child_token(), session, transport, sender, receiver);

    let mut console = Console::new(&config);
    let mut snapshots = handle.subscribe();
    let mut lines = BufReader::new(stdin()).lines();
    let scan_timeout = sleep(Duration::from_secs(config.scan_timeout_secs));
    tokio::pin!(scan_timeout);
    let mut scan_timeout_done = false;

    println!("{}", HELP);
    handle.command(UserCommand::StartScan).await?;

    'mainloop: loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break 'mainloop;
                }

                let snapshot = snapshots.borrow_and_update().clone();
                for line in console.render(&snapshot) {
                    println!("{}", line);
                }

                if let Some(device) = console.auto_connect_target(&snapshot) {
                    handle.command(UserCommand::Connect(device)).await?;
                }
            },
            line = lines.next_line() => match line? {
                None => break 'mainloop,
                Some(line) if line.trim().is_empty() => {},
                Some(line) => match parse_command(&line) {
                    Ok(ConsoleCommand::Quit) => break 'mainloop,
                    Ok(command) => on_console_command(command, &mut console, &mut handle).await?,
                    Err(message) => println!("{}; type 'h' for help", message),
                },
            },
            _ = &mut scan_timeout, if !scan_timeout_done => {
                scan_timeout_done = true;
                on_scan_timeout(&console, &mut handle).await?;
            },
        }
    }

    info!("Quitting");
    disconnect_before_exit(&mut handle).await?;
    app_cancel.cancel();
    if let Err(err) = session_task.await {
        error!("Session task failed: {:?}", err);
    }

    Ok(())
}

pub fn run_application(flags: ApplicationFlags) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(flags.config_path.as_deref())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut config = load_config(&config_io).await;
        flags.apply(&mut config);

        if flags.save_config {
            config_io.save(&config).await?;
        }

        run_console(config).await
    })
}
