use std::fmt;
use uuid::Uuid;

pub type ServiceId = Uuid;
pub type CharacteristicId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralIdentity {
    pub id: String,
    pub name: Option<String>,
}

impl PeripheralIdentity {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        PeripheralIdentity { id: id.into(), name }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Capabilities a characteristic declares during discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub notify: bool,
    pub indicate: bool,
    pub read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Notify,
    PeriodicPoll { interval_ms: u64 },
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Notify => write!(f, "notify"),
            DeliveryMode::PeriodicPoll { interval_ms } => write!(f, "poll every {}ms", interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting(PeripheralIdentity),
    Negotiating(PeripheralIdentity),
    Streaming(PeripheralIdentity, DeliveryMode),
    Disconnecting(PeripheralIdentity),
}

impl SessionState {
    pub fn target(&self) -> Option<&PeripheralIdentity> {
        match self {
            SessionState::Idle | SessionState::Scanning => None,
            SessionState::Connecting(target)
            | SessionState::Negotiating(target)
            | SessionState::Streaming(target, _)
            | SessionState::Disconnecting(target) => Some(target),
        }
    }

    /// `true` while a link to the peripheral is established (negotiating or streaming).
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Negotiating(_) | SessionState::Streaming(..))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Scanning => write!(f, "Scanning…"),
            SessionState::Connecting(target) => write!(f, "Connecting to {}…", target.display_name()),
            SessionState::Negotiating(target) => write!(f, "Negotiating with {}…", target.display_name()),
            SessionState::Streaming(target, mode) => write!(f, "Connected to {} ({})", target.display_name(), mode),
            SessionState::Disconnecting(target) => write!(f, "Disconnecting from {}…", target.display_name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

impl PowerState {
    /// The radio can not be used until this is resolved outside of the application.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PowerState::Off | PowerState::Unauthorized | PowerState::Unsupported)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            PowerState::On => "powered on",
            PowerState::Off => "powered off",
            PowerState::Unauthorized => "not allowed to access Bluetooth",
            PowerState::Unsupported => "Bluetooth LE is not supported",
            PowerState::Resetting => "resetting",
            PowerState::Unknown => "unknown",
        };

        write!(f, "{}", result)
    }
}

/// Everything the transport (and the poll scheduler) reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PoweredStateChanged(PowerState),
    ScanFailed(String),
    DeviceDiscovered(PeripheralIdentity),
    ConnectSucceeded(PeripheralIdentity),
    ConnectFailed(PeripheralIdentity, String),
    ServicesDiscovered(PeripheralIdentity, Vec<ServiceId>),
    CharacteristicsDiscovered(ServiceId, Vec<(CharacteristicId, Capabilities)>),
    SubscriptionConfirmed(CharacteristicId),
    SubscriptionFailed(CharacteristicId, String),
    ValueUpdated(CharacteristicId, Vec<u8>),
    ReadFailed(CharacteristicId, String),
    Disconnected(PeripheralIdentity, Option<String>),
    PollTick(CharacteristicId),
}

/// Requests the session issues to the transport (and the poll scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    ScanStart,
    ScanStop,
    Connect(PeripheralIdentity),
    Disconnect(PeripheralIdentity),
    DiscoverServices(PeripheralIdentity),
    DiscoverCharacteristics(ServiceId),
    Subscribe(CharacteristicId),
    ReadValue(CharacteristicId),
    SchedulePoll { characteristic: CharacteristicId, interval_ms: u64 },
    CancelPoll(CharacteristicId),
}

/// Commands available to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    StartScan,
    StopScan,
    Connect(PeripheralIdentity),
    Disconnect,
    Tare,
    ResetMax,
    AcknowledgeError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Transport(TransportEvent),
    User(UserCommand),
}

/// Immutable view of the session, published after every processed input.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub connected_device: Option<PeripheralIdentity>,
    pub current_reading: f64,
    pub max_reading: f64,
    pub last_error: Option<String>,
    pub last_advisory: Option<String>,
    pub known_devices: Vec<PeripheralIdentity>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot {
            state: SessionState::Idle,
            connected_device: None,
            current_reading: 0.0,
            max_reading: 0.0,
            last_error: None,
            last_advisory: None,
            known_devices: Vec::new(),
        }
    }
}
