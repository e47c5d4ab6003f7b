use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::device::calibration::{CalibrationState, Reading};
use crate::device::decoder::decode;
use crate::device::policy::{CharacteristicPolicy, FallbackDecision, PolicyDecision};
use crate::device::registry::ScanRegistry;
use crate::device::types::{
    Capabilities, CharacteristicId, DeliveryMode, PeripheralIdentity, PowerState, ServiceId, SessionInput,
    SessionSnapshot, SessionState, TransportCommand, TransportEvent, UserCommand,
};
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Subscribing,
    Streaming(DeliveryMode),
}

#[derive(Debug, Clone, Copy)]
struct CharacteristicStream {
    capabilities: Capabilities,
    state: StreamState,
}

/// The connection state machine.
///
/// Every transport event and user command goes through [`DeviceSession::handle`], one at a time,
/// which updates the session and returns the transport commands to issue. The session itself
/// never performs I/O.
#[derive(Debug)]
pub struct DeviceSession {
    state: SessionState,
    registry: ScanRegistry,
    calibration: CalibrationState,
    policy: CharacteristicPolicy,
    streams: IndexMap<CharacteristicId, CharacteristicStream>,
    // the characteristic whose delivery mode is reported in SessionState::Streaming
    primary: Option<CharacteristicId>,
    power: PowerState,
    last_reading: Option<Reading>,
    last_error: Option<SessionError>,
    last_advisory: Option<SessionError>,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new(CharacteristicPolicy::default())
    }
}

impl DeviceSession {
    pub fn new(policy: CharacteristicPolicy) -> Self {
        DeviceSession {
            state: SessionState::Idle,
            registry: ScanRegistry::new(),
            calibration: CalibrationState::new(),
            policy,
            streams: IndexMap::new(),
            primary: None,
            power: PowerState::Unknown,
            last_reading: None,
            last_error: None,
            last_advisory: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn registry(&self) -> &ScanRegistry {
        &self.registry
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn last_reading(&self) -> Option<Reading> {
        self.last_reading
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn last_advisory(&self) -> Option<&SessionError> {
        self.last_advisory.as_ref()
    }

    /// The delivery mode of a characteristic, `None` while it is still subscribing or if it is not
    /// used.
    pub fn delivery_mode(&self, characteristic: &CharacteristicId) -> Option<DeliveryMode> {
        match self.streams.get(characteristic)?.state {
            StreamState::Streaming(mode) => Some(mode),
            StreamState::Subscribing => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let connected_device = if self.state.is_connected() {
            self.state.target().cloned()
        } else {
            None
        };

        SessionSnapshot {
            state: self.state.clone(),
            connected_device,
            current_reading: self.calibration.current_adjusted(),
            max_reading: self.calibration.max_adjusted(),
            last_error: self.last_error.as_ref().map(|err| err.to_string()),
            last_advisory: self.last_advisory.as_ref().map(|err| err.to_string()),
            known_devices: self.registry.to_vec(),
        }
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<TransportCommand> {
        match input {
            SessionInput::Transport(event) => self.handle_event(event),
            SessionInput::User(command) => self.handle_command(command),
        }
    }

    pub fn handle_command(&mut self, command: UserCommand) -> Vec<TransportCommand> {
        match command {
            UserCommand::StartScan => self.start_scan(),
            UserCommand::StopScan => {
                if self.state == SessionState::Scanning {
                    info!("Scan stopped");
                    self.state = SessionState::Idle;
                    return vec![TransportCommand::ScanStop];
                }
                vec![]
            },
            UserCommand::Connect(target) => self.connect(target),
            UserCommand::Disconnect => self.disconnect(),
            UserCommand::Tare => {
                if self.state.is_connected() {
                    self.calibration.tare();
                    info!("Tare; offset is now {}", self.calibration.tare_offset());
                } else {
                    debug!("Ignoring tare while not connected");
                }
                vec![]
            },
            UserCommand::ResetMax => {
                if self.state.is_connected() {
                    self.calibration.reset_max();
                    info!("Maximum reset; offset is now {}", self.calibration.tare_offset());
                } else {
                    debug!("Ignoring reset of maximum while not connected");
                }
                vec![]
            },
            UserCommand::AcknowledgeError => {
                self.last_error = None;
                self.last_advisory = None;
                vec![]
            },
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<TransportCommand> {
        match event {
            TransportEvent::PoweredStateChanged(power) => {
                self.on_power(power);
                vec![]
            },
            TransportEvent::ScanFailed(reason) => {
                if self.state == SessionState::Scanning {
                    warn!("Scanning failed: {}", reason);
                    self.set_error(SessionError::ScanUnavailable(reason));
                    self.state = SessionState::Idle;
                }
                vec![]
            },
            TransportEvent::DeviceDiscovered(identity) => {
                if self.state == SessionState::Scanning {
                    let description = identity.to_string();
                    if self.registry.insert(identity) {
                        info!("Discovered {}", description);
                    }
                }
                vec![]
            },
            TransportEvent::ConnectSucceeded(identity) => self.on_connected(identity),
            TransportEvent::ConnectFailed(identity, reason) => {
                let device = match &self.state {
                    SessionState::Connecting(target) if target.id == identity.id => target.to_string(),
                    _ => return vec![],
                };

                warn!("Connecting to {} failed: {}", device, reason);
                self.set_error(SessionError::ConnectFailed { device, reason });
                self.state = SessionState::Idle;
                vec![]
            },
            TransportEvent::ServicesDiscovered(identity, services) => self.on_services(identity, services),
            TransportEvent::CharacteristicsDiscovered(service, characteristics) => {
                self.on_characteristics(service, characteristics)
            },
            TransportEvent::SubscriptionConfirmed(characteristic) => self.on_subscribed(characteristic),
            TransportEvent::SubscriptionFailed(characteristic, reason) => {
                self.on_subscription_failed(characteristic, reason)
            },
            TransportEvent::ValueUpdated(characteristic, bytes) => {
                self.on_value(characteristic, &bytes);
                vec![]
            },
            TransportEvent::ReadFailed(characteristic, reason) => {
                if self.state.is_connected() && self.streams.contains_key(&characteristic) {
                    warn!("Reading {} failed: {}", characteristic, reason);
                    self.set_error(SessionError::ReadFailed { characteristic, reason });
                }
                vec![]
            },
            TransportEvent::Disconnected(identity, reason) => self.on_disconnected(identity, reason),
            TransportEvent::PollTick(characteristic) => {
                // ticks that were already queued when the poll was cancelled end up here
                match self.delivery_mode(&characteristic) {
                    Some(DeliveryMode::PeriodicPoll { .. }) if self.state.is_connected() => {
                        vec![TransportCommand::ReadValue(characteristic)]
                    },
                    _ => vec![],
                }
            },
        }
    }

    fn set_error(&mut self, error: SessionError) {
        if error.is_advisory() {
            self.last_advisory = Some(error);
        } else {
            self.last_error = Some(error);
        }
    }

    fn on_power(&mut self, power: PowerState) {
        info!("Bluetooth is {}", power);
        self.power = power;

        if power.is_unavailable() {
            self.set_error(SessionError::TransportUnavailable(power));
            if self.state == SessionState::Scanning {
                self.state = SessionState::Idle;
            }
        } else if power == PowerState::On {
            if let Some(SessionError::TransportUnavailable(_)) = self.last_error {
                self.last_error = None;
            }
        }
    }

    fn start_scan(&mut self) -> Vec<TransportCommand> {
        if self.power.is_unavailable() {
            warn!("Not scanning, bluetooth is {}", self.power);
            self.set_error(SessionError::TransportUnavailable(self.power));
            return vec![];
        }

        match self.state {
            SessionState::Idle | SessionState::Scanning => {
                info!("Scanning...");
                self.registry.clear();
                self.last_error = None;
                self.state = SessionState::Scanning;
                vec![TransportCommand::ScanStart]
            },
            _ => {
                warn!("Not scanning while {}", self.state);
                vec![]
            },
        }
    }

    fn connect(&mut self, target: PeripheralIdentity) -> Vec<TransportCommand> {
        if self.power.is_unavailable() {
            warn!("Not connecting to {}, bluetooth is {}", target, self.power);
            self.set_error(SessionError::TransportUnavailable(self.power));
            return vec![];
        }

        let mut commands = vec![];

        match self.state {
            SessionState::Scanning => commands.push(TransportCommand::ScanStop),
            SessionState::Idle => {},
            _ => {
                warn!("Not connecting to {} while {}", target, self.state);
                return commands;
            },
        }

        let target = self.registry.get(&target.id).cloned().unwrap_or(target);
        info!("Connecting to {}...", target);
        self.state = SessionState::Connecting(target.clone());
        commands.push(TransportCommand::Connect(target));
        commands
    }

    fn cancel_polls(&mut self) -> Vec<TransportCommand> {
        let commands = self.streams
            .iter()
            .filter(|(_, stream)| matches!(stream.state, StreamState::Streaming(DeliveryMode::PeriodicPoll { .. })))
            .map(|(characteristic, _)| TransportCommand::CancelPoll(*characteristic))
            .collect();

        self.streams.clear();
        self.primary = None;
        commands
    }

    fn disconnect(&mut self) -> Vec<TransportCommand> {
        let target = match &self.state {
            SessionState::Connecting(target)
            | SessionState::Negotiating(target)
            | SessionState::Streaming(target, _) => target.clone(),
            _ => {
                debug!("Nothing to disconnect while {}", self.state);
                return vec![];
            },
        };

        info!("Disconnecting from {}...", target);
        let mut commands = self.cancel_polls();
        self.state = SessionState::Disconnecting(target.clone());
        commands.push(TransportCommand::Disconnect(target));
        commands
    }

    fn is_target(&self, identity: &PeripheralIdentity) -> bool {
        self.state.target().map(|target| target.id == identity.id).unwrap_or(false)
    }

    fn on_connected(&mut self, identity: PeripheralIdentity) -> Vec<TransportCommand> {
        let target = match &self.state {
            SessionState::Connecting(target) if target.id == identity.id => target.clone(),
            _ => {
                debug!("Ignoring unexpected connection to {}", identity);
                return vec![];
            },
        };

        info!("Connected to {}; Discovering services...", target);
        self.calibration.on_connect();
        self.last_reading = None;
        self.streams.clear();
        self.primary = None;
        self.last_error = None;
        self.last_advisory = None;
        self.state = SessionState::Negotiating(target.clone());
        vec![TransportCommand::DiscoverServices(target)]
    }

    fn on_services(&mut self, identity: PeripheralIdentity, services: Vec<ServiceId>) -> Vec<TransportCommand> {
        if !self.state.is_connected() || !self.is_target(&identity) {
            return vec![];
        }

        debug!("Discovered {} services", services.len());
        // firmware differs in which service carries the force value, so every service is a candidate
        services
            .into_iter()
            .map(TransportCommand::DiscoverCharacteristics)
            .collect()
    }

    fn on_characteristics(
        &mut self,
        service: ServiceId,
        characteristics: Vec<(CharacteristicId, Capabilities)>,
    ) -> Vec<TransportCommand> {
        if !self.state.is_connected() {
            return vec![];
        }

        let mut commands = vec![];

        for (characteristic, capabilities) in characteristics {
            if self.streams.contains_key(&characteristic) {
                continue;
            }

            match self.policy.choose(capabilities) {
                PolicyDecision::Deliver(DeliveryMode::Notify) => {
                    info!("Subscribing to characteristic {:?} {:?}", service, characteristic);
                    self.streams.insert(characteristic, CharacteristicStream {
                        capabilities,
                        state: StreamState::Subscribing,
                    });
                    commands.push(TransportCommand::Subscribe(characteristic));
                },
                PolicyDecision::Deliver(mode) => {
                    info!("Polling characteristic {:?} {:?}", service, characteristic);
                    self.streams.insert(characteristic, CharacteristicStream {
                        capabilities,
                        state: StreamState::Subscribing,
                    });
                    commands.extend(self.start_polling(characteristic, mode));
                },
                PolicyDecision::NotSubscribable => {
                    debug!("Ignoring characteristic {:?} {:?} {:?}", service, characteristic, capabilities);
                },
            }
        }

        commands
    }

    fn start_polling(&mut self, characteristic: CharacteristicId, mode: DeliveryMode) -> Vec<TransportCommand> {
        let interval_ms = match mode {
            DeliveryMode::PeriodicPoll { interval_ms } => interval_ms,
            DeliveryMode::Notify => return vec![],
        };

        self.enter_streaming(characteristic, mode);

        vec![
            TransportCommand::CancelPoll(characteristic),
            TransportCommand::ReadValue(characteristic),
            TransportCommand::SchedulePoll { characteristic, interval_ms },
        ]
    }

    fn enter_streaming(&mut self, characteristic: CharacteristicId, mode: DeliveryMode) {
        if let Some(stream) = self.streams.get_mut(&characteristic) {
            stream.state = StreamState::Streaming(mode);
        }

        if self.primary.is_none() {
            self.primary = Some(characteristic);
        }

        if self.primary == Some(characteristic) {
            self.state = match &self.state {
                SessionState::Negotiating(target) | SessionState::Streaming(target, _) => {
                    info!("Streaming from {} ({})", target, mode);
                    SessionState::Streaming(target.clone(), mode)
                },
                other => other.clone(),
            };
        }
    }

    fn on_subscribed(&mut self, characteristic: CharacteristicId) -> Vec<TransportCommand> {
        if !self.state.is_connected() {
            return vec![];
        }

        let capabilities = match self.streams.get(&characteristic) {
            Some(stream) if stream.state == StreamState::Subscribing => stream.capabilities,
            _ => return vec![],
        };

        self.enter_streaming(characteristic, DeliveryMode::Notify);

        // a notification might not arrive until the next sample tick of the peripheral
        if capabilities.read {
            vec![TransportCommand::ReadValue(characteristic)]
        } else {
            vec![]
        }
    }

    fn on_subscription_failed(&mut self, characteristic: CharacteristicId, reason: String) -> Vec<TransportCommand> {
        if !self.state.is_connected() {
            return vec![];
        }

        let capabilities = match self.streams.get(&characteristic) {
            Some(stream) if stream.state != StreamState::Streaming(self.policy.poll_mode()) => stream.capabilities,
            _ => return vec![],
        };

        match self.policy.on_subscription_failed(capabilities) {
            FallbackDecision::Poll(mode) => {
                let advisory = SessionError::SubscriptionFallback { characteristic, reason };
                warn!("{}", advisory);
                self.set_error(advisory);
                self.start_polling(characteristic, mode)
            },
            FallbackDecision::Unusable => {
                let error = SessionError::NegotiationPartialFailure { characteristic, reason };
                warn!("{}", error);
                self.set_error(error);
                self.streams.shift_remove(&characteristic);

                if self.primary == Some(characteristic) {
                    self.primary = None;
                    self.promote_next_primary();
                }
                vec![]
            },
        }
    }

    fn promote_next_primary(&mut self) {
        let next = self.streams.iter().find_map(|(characteristic, stream)| match stream.state {
            StreamState::Streaming(mode) => Some((*characteristic, mode)),
            StreamState::Subscribing => None,
        });

        match next {
            Some((characteristic, mode)) => self.enter_streaming(characteristic, mode),
            None => {
                if let SessionState::Streaming(target, _) = &self.state {
                    self.state = SessionState::Negotiating(target.clone());
                }
            },
        }
    }

    fn on_value(&mut self, characteristic: CharacteristicId, bytes: &[u8]) {
        if !self.state.is_connected() || !self.streams.contains_key(&characteristic) {
            return;
        }

        match decode(bytes) {
            Ok(raw) => {
                let reading = self.calibration.apply(raw);
                debug!("Value {} (raw {}) from {}", reading.adjusted, reading.raw, characteristic);
                self.last_reading = Some(reading);
            },
            Err(source) => {
                debug!("{}", SessionError::DecodeUnrecognized { characteristic, source });
            },
        }
    }

    fn on_disconnected(&mut self, identity: PeripheralIdentity, reason: Option<String>) -> Vec<TransportCommand> {
        if !self.is_target(&identity) {
            debug!("Ignoring disconnection of {}", identity);
            return vec![];
        }

        let commands = self.cancel_polls();

        match reason {
            Some(reason) => {
                warn!("Disconnected from {}: {}", identity, reason);
                self.set_error(SessionError::DisconnectedWithError { device: identity.to_string(), reason });
            },
            None => info!("Disconnected from {}", identity),
        }

        self.calibration.on_disconnect();
        self.last_reading = None;
        self.state = SessionState::Idle;
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const EPSILON: f64 = 1e-9;

    fn device(id: &str) -> PeripheralIdentity {
        PeripheralIdentity::new(id, Some(format!("Load cell {}", id)))
    }

    fn characteristic(n: u128) -> CharacteristicId {
        Uuid::from_u128(0x1000 + n)
    }

    fn service() -> ServiceId {
        Uuid::from_u128(0xffe0)
    }

    fn caps(notify: bool, read: bool) -> Capabilities {
        Capabilities { notify, indicate: false, read }
    }

    fn event(session: &mut DeviceSession, event: TransportEvent) -> Vec<TransportCommand> {
        session.handle(SessionInput::Transport(event))
    }

    fn command(session: &mut DeviceSession, command: UserCommand) -> Vec<TransportCommand> {
        session.handle(SessionInput::User(command))
    }

    fn connected_session() -> DeviceSession {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        command(&mut session, UserCommand::Connect(device("a")));
        event(&mut session, TransportEvent::ConnectSucceeded(device("a")));
        session
    }

    fn value(session: &mut DeviceSession, characteristic: CharacteristicId, bytes: &[u8]) {
        event(session, TransportEvent::ValueUpdated(characteristic, bytes.to_vec()));
    }

    #[test]
    fn new_scan_clears_the_registry() {
        let mut session = DeviceSession::default();
        assert_eq!(command(&mut session, UserCommand::StartScan), vec![TransportCommand::ScanStart]);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        event(&mut session, TransportEvent::DeviceDiscovered(device("b")));
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        assert_eq!(session.registry().len(), 2);

        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("c")));
        assert_eq!(session.snapshot().known_devices, vec![device("c")]);
    }

    #[test]
    fn discoveries_outside_of_a_scan_are_ignored() {
        let mut session = DeviceSession::default();
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        assert!(session.registry().is_empty());
    }

    #[test]
    fn connect_stops_scanning_and_negotiates() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));

        let commands = command(&mut session, UserCommand::Connect(PeripheralIdentity::new("a", None)));
        assert_eq!(commands, vec![TransportCommand::ScanStop, TransportCommand::Connect(device("a"))]);
        assert_eq!(session.state(), &SessionState::Connecting(device("a")));

        let commands = event(&mut session, TransportEvent::ConnectSucceeded(device("a")));
        assert_eq!(commands, vec![TransportCommand::DiscoverServices(device("a"))]);
        assert_eq!(session.state(), &SessionState::Negotiating(device("a")));
        assert_eq!(session.snapshot().connected_device, Some(device("a")));

        let other = Uuid::from_u128(0x180f);
        let commands = event(&mut session, TransportEvent::ServicesDiscovered(device("a"), vec![service(), other]));
        assert_eq!(commands, vec![
            TransportCommand::DiscoverCharacteristics(service()),
            TransportCommand::DiscoverCharacteristics(other),
        ]);
    }

    #[test]
    fn connect_failure_returns_to_idle() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::Connect(device("a")));
        event(&mut session, TransportEvent::ConnectFailed(device("a"), "timeout".to_string()));

        assert_eq!(session.state(), &SessionState::Idle);
        assert!(matches!(session.last_error(), Some(SessionError::ConnectFailed { .. })));
        assert!(session.snapshot().last_error.unwrap().contains("timeout"));
    }

    #[test]
    fn connect_is_rejected_while_connected() {
        let mut session = connected_session();
        assert!(command(&mut session, UserCommand::Connect(device("b"))).is_empty());
        assert_eq!(session.state(), &SessionState::Negotiating(device("a")));
    }

    #[test]
    fn read_only_characteristic_is_polled() {
        let mut session = connected_session();
        let c = characteristic(1);

        let commands = event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        assert_eq!(commands, vec![
            TransportCommand::CancelPoll(c),
            TransportCommand::ReadValue(c),
            TransportCommand::SchedulePoll { characteristic: c, interval_ms: 100 },
        ]);
        let mode = DeliveryMode::PeriodicPoll { interval_ms: 100 };
        assert_eq!(session.state(), &SessionState::Streaming(device("a"), mode));

        let mut readings = vec![];
        for payload in ["5.0", "7.5", "6.0"] {
            assert_eq!(event(&mut session, TransportEvent::PollTick(c)), vec![TransportCommand::ReadValue(c)]);
            value(&mut session, c, payload.as_bytes());
            readings.push(session.snapshot().current_reading);
        }

        assert_eq!(readings, vec![5.0, 7.5, 6.0]);
        assert_eq!(session.snapshot().max_reading, 7.5);
    }

    #[test]
    fn notify_characteristic_subscribes_and_seeds_with_a_read() {
        let mut session = connected_session();
        let c = characteristic(1);

        let commands = event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(true, true))]));
        assert_eq!(commands, vec![TransportCommand::Subscribe(c)]);
        assert_eq!(session.state(), &SessionState::Negotiating(device("a")));

        let commands = event(&mut session, TransportEvent::SubscriptionConfirmed(c));
        assert_eq!(commands, vec![TransportCommand::ReadValue(c)]);
        assert_eq!(session.state(), &SessionState::Streaming(device("a"), DeliveryMode::Notify));

        value(&mut session, c, b"12.5");
        assert_eq!(session.snapshot().current_reading, 12.5);
    }

    #[test]
    fn notify_only_characteristic_is_not_read_after_subscribing() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(true, false))]));
        assert!(event(&mut session, TransportEvent::SubscriptionConfirmed(c)).is_empty());
    }

    #[test]
    fn rejected_subscription_falls_back_to_polling() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(true, true))]));

        let commands = event(&mut session, TransportEvent::SubscriptionFailed(c, "not permitted".to_string()));
        assert_eq!(commands, vec![
            TransportCommand::CancelPoll(c),
            TransportCommand::ReadValue(c),
            TransportCommand::SchedulePoll { characteristic: c, interval_ms: 100 },
        ]);

        let mode = DeliveryMode::PeriodicPoll { interval_ms: 100 };
        assert_eq!(session.delivery_mode(&c), Some(mode));
        assert_eq!(session.state(), &SessionState::Streaming(device("a"), mode));
        assert!(matches!(session.last_advisory(), Some(SessionError::SubscriptionFallback { .. })));
        assert!(session.last_error().is_none());

        value(&mut session, c, b"3");
        assert_eq!(session.snapshot().current_reading, 3.0);

        // the fallback happens only once
        assert!(event(&mut session, TransportEvent::SubscriptionFailed(c, "again".to_string())).is_empty());
    }

    #[test]
    fn unusable_characteristic_does_not_affect_others() {
        let mut session = connected_session();
        let polled = characteristic(1);
        let broken = characteristic(2);

        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![
            (polled, caps(false, true)),
            (broken, caps(true, false)),
            (characteristic(3), caps(false, false)),
        ]));
        assert!(session.delivery_mode(&characteristic(3)).is_none());

        assert!(event(&mut session, TransportEvent::SubscriptionFailed(broken, "rejected".to_string())).is_empty());
        assert!(matches!(session.last_error(), Some(SessionError::NegotiationPartialFailure { .. })));
        assert!(matches!(session.state(), SessionState::Streaming(..)));

        value(&mut session, broken, b"99");
        assert_eq!(session.snapshot().current_reading, 0.0);
        value(&mut session, polled, b"4.5");
        assert_eq!(session.snapshot().current_reading, 4.5);
    }

    #[test]
    fn failing_only_characteristic_leaves_session_negotiating() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(true, false))]));
        event(&mut session, TransportEvent::SubscriptionFailed(c, "rejected".to_string()));
        assert_eq!(session.state(), &SessionState::Negotiating(device("a")));
    }

    #[test]
    fn read_failure_is_surfaced_without_stopping_the_stream() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        event(&mut session, TransportEvent::ReadFailed(c, "busy".to_string()));

        assert!(matches!(session.last_error(), Some(SessionError::ReadFailed { .. })));
        assert_eq!(event(&mut session, TransportEvent::PollTick(c)), vec![TransportCommand::ReadValue(c)]);
    }

    #[test]
    fn disconnect_cancels_polls_before_disconnecting() {
        let mut session = connected_session();
        let c1 = characteristic(1);
        let c2 = characteristic(2);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c1, caps(false, true)), (c2, caps(false, true))]));
        value(&mut session, c1, b"10");

        let commands = command(&mut session, UserCommand::Disconnect);
        assert_eq!(commands, vec![
            TransportCommand::CancelPoll(c1),
            TransportCommand::CancelPoll(c2),
            TransportCommand::Disconnect(device("a")),
        ]);
        assert_eq!(session.state(), &SessionState::Disconnecting(device("a")));

        // a tick that was already scheduled does not cause a read anymore
        assert!(event(&mut session, TransportEvent::PollTick(c1)).is_empty());
        assert!(event(&mut session, TransportEvent::PollTick(c2)).is_empty());

        event(&mut session, TransportEvent::Disconnected(device("a"), None));
        assert_eq!(session.state(), &SessionState::Idle);
        assert_eq!(*session.calibration(), CalibrationState::default());
        assert!(session.last_error().is_none());
        assert!(session.snapshot().connected_device.is_none());

        // idempotent
        assert!(event(&mut session, TransportEvent::Disconnected(device("a"), None)).is_empty());
        assert!(event(&mut session, TransportEvent::PollTick(c1)).is_empty());
    }

    #[test]
    fn unexpected_disconnection_cancels_polls_and_reports() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));

        let commands = event(&mut session, TransportEvent::Disconnected(device("a"), Some("link lost".to_string())));
        assert_eq!(commands, vec![TransportCommand::CancelPoll(c)]);
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(matches!(session.last_error(), Some(SessionError::DisconnectedWithError { .. })));

        command(&mut session, UserCommand::AcknowledgeError);
        assert!(session.snapshot().last_error.is_none());
    }

    #[test]
    fn tare_is_only_accepted_while_connected() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::Tare);
        command(&mut session, UserCommand::ResetMax);
        assert_eq!(*session.calibration(), CalibrationState::default());

        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        value(&mut session, c, b"8.25");
        command(&mut session, UserCommand::Tare);
        assert!(session.snapshot().current_reading.abs() < EPSILON);
        assert_eq!(session.snapshot().max_reading, 8.25);

        value(&mut session, c, b"8.25");
        assert!(session.snapshot().current_reading.abs() < EPSILON);
    }

    #[test]
    fn reset_max_rezeroes_the_reading() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        value(&mut session, c, b"9");
        value(&mut session, c, b"4");
        command(&mut session, UserCommand::ResetMax);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.max_reading, 0.0);
        assert!(snapshot.current_reading.abs() < EPSILON);

        value(&mut session, c, b"5");
        assert!((session.snapshot().current_reading - 1.0).abs() < EPSILON);
        assert!((session.snapshot().max_reading - 1.0).abs() < EPSILON);
    }

    #[test]
    fn binary_zero_with_tare_offset() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        value(&mut session, c, b"2.0");
        command(&mut session, UserCommand::Tare);
        assert_eq!(session.calibration().tare_offset(), 2.0);
        let max_before = session.snapshot().max_reading;

        value(&mut session, c, &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(session.last_reading(), Some(Reading { raw: 0.0, adjusted: -2.0 }));
        assert_eq!(session.snapshot().max_reading, max_before);
    }

    #[test]
    fn unrecognized_payload_is_dropped() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        value(&mut session, c, b"3");
        let before = session.snapshot();

        value(&mut session, c, &[0xff]);
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn new_connection_resets_calibration() {
        let mut session = connected_session();
        let c = characteristic(1);
        event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        value(&mut session, c, b"3");
        command(&mut session, UserCommand::Tare);
        command(&mut session, UserCommand::Disconnect);
        event(&mut session, TransportEvent::Disconnected(device("a"), None));

        command(&mut session, UserCommand::Connect(device("a")));
        event(&mut session, TransportEvent::ConnectSucceeded(device("a")));
        assert_eq!(session.calibration().tare_offset(), 0.0);
        assert_eq!(session.calibration().max_adjusted(), 0.0);
    }

    #[test]
    fn radio_off_blocks_scanning() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::PoweredStateChanged(PowerState::Off));
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(matches!(session.last_error(), Some(SessionError::TransportUnavailable(PowerState::Off))));

        assert!(command(&mut session, UserCommand::StartScan).is_empty());

        event(&mut session, TransportEvent::PoweredStateChanged(PowerState::On));
        assert!(session.last_error().is_none());
        assert_eq!(command(&mut session, UserCommand::StartScan), vec![TransportCommand::ScanStart]);
    }

    #[test]
    fn radio_off_blocks_connecting() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        event(&mut session, TransportEvent::PoweredStateChanged(PowerState::Unauthorized));

        assert!(command(&mut session, UserCommand::Connect(device("a"))).is_empty());
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(matches!(
            session.last_error(),
            Some(SessionError::TransportUnavailable(PowerState::Unauthorized))
        ));
    }

    #[test]
    fn disconnect_while_connecting_ignores_a_late_connection() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        command(&mut session, UserCommand::Connect(device("a")));

        assert_eq!(
            command(&mut session, UserCommand::Disconnect),
            vec![TransportCommand::Disconnect(device("a"))]
        );
        assert_eq!(session.state(), &SessionState::Disconnecting(device("a")));

        assert!(event(&mut session, TransportEvent::ConnectSucceeded(device("a"))).is_empty());
        assert_eq!(session.state(), &SessionState::Disconnecting(device("a")));

        event(&mut session, TransportEvent::Disconnected(device("a"), None));
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn rescan_reports_previously_seen_devices_again() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(PeripheralIdentity::new("a", None)));
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        assert_eq!(session.snapshot().known_devices, vec![device("a")]);

        command(&mut session, UserCommand::StartScan);
        assert!(session.registry().is_empty());
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        assert_eq!(session.snapshot().known_devices, vec![device("a")]);
    }

    #[test]
    fn failed_scan_returns_to_idle() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::ScanFailed("adapter busy".to_string()));
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(matches!(session.last_error(), Some(SessionError::ScanUnavailable(_))));
    }

    #[test]
    fn stop_scan_returns_to_idle_and_keeps_devices() {
        let mut session = DeviceSession::default();
        command(&mut session, UserCommand::StartScan);
        event(&mut session, TransportEvent::DeviceDiscovered(device("a")));
        assert_eq!(command(&mut session, UserCommand::StopScan), vec![TransportCommand::ScanStop]);
        assert_eq!(session.state(), &SessionState::Idle);
        assert_eq!(session.registry().len(), 1);
        assert!(command(&mut session, UserCommand::StopScan).is_empty());
    }

    #[test]
    fn configured_poll_interval_is_scheduled() {
        let mut session = DeviceSession::new(CharacteristicPolicy::new(250));
        command(&mut session, UserCommand::Connect(device("a")));
        event(&mut session, TransportEvent::ConnectSucceeded(device("a")));
        let c = characteristic(1);
        let commands = event(&mut session, TransportEvent::CharacteristicsDiscovered(service(), vec![(c, caps(false, true))]));
        assert!(commands.contains(&TransportCommand::SchedulePoll { characteristic: c, interval_ms: 250 }));
    }
}
