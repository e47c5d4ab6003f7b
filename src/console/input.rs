use crate::device::types::UserCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Session(UserCommand),
    /// Connect to the n-th known device, counting from 1.
    ConnectIndex(usize),
    ListDevices,
    ToggleUnit,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  s        start a new scan
  x        stop scanning
  l        list discovered devices
  c <n>    connect to device n of the list
  d        disconnect
  t        tare (make the current reading zero)
  r        reset the maximum (also re-zeroes the current reading)
  u        toggle between lb and kg
  a        acknowledge the last error
  q        quit";

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some(command) => command,
        None => return Err("empty command".to_string()),
    };

    let result = match command {
        "s" | "scan" => ConsoleCommand::Session(UserCommand::StartScan),
        "x" | "stop" => ConsoleCommand::Session(UserCommand::StopScan),
        "d" | "disconnect" => ConsoleCommand::Session(UserCommand::Disconnect),
        "t" | "tare" => ConsoleCommand::Session(UserCommand::Tare),
        "r" | "reset" => ConsoleCommand::Session(UserCommand::ResetMax),
        "a" | "ack" => ConsoleCommand::Session(UserCommand::AcknowledgeError),
        "l" | "list" => ConsoleCommand::ListDevices,
        "u" | "unit" => ConsoleCommand::ToggleUnit,
        "h" | "help" | "?" => ConsoleCommand::Help,
        "q" | "quit" => ConsoleCommand::Quit,
        "c" | "connect" => {
            let index = words.next()
                .ok_or_else(|| "connect needs a device number".to_string())?
                .parse::<usize>()
                .map_err(|err| format!("invalid device number: {}", err))?;

            if index == 0 {
                return Err("device numbers start at 1".to_string());
            }
            ConsoleCommand::ConnectIndex(index)
        },
        other => return Err(format!("unknown command {:?}", other)),
    };

    Ok(result)
}
