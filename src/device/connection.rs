use std::future::Future;
use std::sync::{Arc, Mutex};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::Sender;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::OPERATION_DEADLINE;
use crate::device::runtime::Transport;
use crate::device::types::{
    Capabilities, CharacteristicId, PeripheralIdentity, PowerState, ServiceId, SessionInput, TransportCommand,
    TransportEvent,
};
use crate::error::DeviceError;

/// The peripheral the session is connected to. Taken out when a disconnect is requested, so that a
/// disconnection that is still in the slot was not asked for.
type ConnectedSlot = Arc<Mutex<Option<(PeripheralIdentity, Peripheral)>>>;

/// [`Transport`] backed by btleplug, using the first bluetooth adapter of the system.
pub struct BtleTransport {
    adapter: Adapter,
    sender: Sender<SessionInput>,
    cancel: CancellationToken,
    connection_cancel: CancellationToken,
    connected: ConnectedSlot,
}

async fn with_deadline<T, F>(fut: F) -> Result<T, DeviceError>
    where F: Future<Output = Result<T, btleplug::Error>>
{
    tokio::select! {
        _ = sleep(Duration::from_millis(OPERATION_DEADLINE)) => Err(DeviceError::Timeout),
        result = fut => Ok(result?),
    }
}

async fn send_event(sender: &mut Sender<SessionInput>, event: TransportEvent) {
    if sender.send(SessionInput::Transport(event)).await.is_err() {
        debug!("Session stopped, dropping transport event");
    }
}

fn capabilities(properties: CharPropFlags) -> Capabilities {
    Capabilities {
        notify: properties.contains(CharPropFlags::NOTIFY),
        indicate: properties.contains(CharPropFlags::INDICATE),
        read: properties.contains(CharPropFlags::READ),
    }
}

fn power_state(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::On,
        CentralState::PoweredOff => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

async fn identify(adapter: &Adapter, id: &PeripheralId) -> Result<PeripheralIdentity, DeviceError> {
    let peripheral = adapter.peripheral(id).await?;
    let name = peripheral.properties().await?.and_then(|properties| properties.local_name);
    Ok(PeripheralIdentity::new(id.to_string(), name))
}

async fn find_peripheral(adapter: &Adapter, identity: &PeripheralIdentity) -> Result<Peripheral, DeviceError> {
    adapter.peripherals().await?
        .into_iter()
        .find(|peripheral| peripheral.id().to_string() == identity.id)
        .ok_or_else(|| DeviceError::UnknownPeripheral(identity.id.clone()))
}

fn find_characteristic(peripheral: &Peripheral, uuid: CharacteristicId) -> Result<Characteristic, DeviceError> {
    peripheral.characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::UnknownCharacteristic(uuid))
}

fn connected_peripheral(connected: &ConnectedSlot) -> Result<Peripheral, DeviceError> {
    let slot = connected.lock().expect("Failed to lock connected peripheral");
    slot.as_ref()
        .map(|(_, peripheral)| peripheral.clone())
        .ok_or(DeviceError::NotConnected)
}

/// Peripherals the adapter already knows about do not always produce a discovery event again.
async fn report_known_peripherals(adapter: &Adapter, sender: &mut Sender<SessionInput>) {
    let peripherals = match adapter.peripherals().await {
        Ok(peripherals) => peripherals,
        Err(err) => {
            warn!("Could not list known peripherals: {:?}", err);
            return;
        },
    };

    for peripheral in peripherals {
        match identify(adapter, &peripheral.id()).await {
            Ok(identity) => send_event(sender, TransportEvent::DeviceDiscovered(identity)).await,
            Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
        }
    }
}

fn adapter_events_task(cancel: CancellationToken, adapter: Adapter, connected: ConnectedSlot, mut sender: Sender<SessionInput>) {
    spawn(async move {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(err) => {
                warn!("Failed to listen for adapter events: {:?}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    None => break 'mainloop,
                    // later advertisements and scan responses only arrive as updates
                    Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                        match identify(&adapter, &id).await {
                            Ok(identity) => send_event(&mut sender, TransportEvent::DeviceDiscovered(identity)).await,
                            Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
                        }
                    },
                    Some(CentralEvent::DeviceDisconnected(id)) => {
                        let lost = {
                            let mut slot = connected.lock().expect("Failed to lock connected peripheral");
                            let ours = slot.as_ref()
                                .map(|(identity, _)| identity.id == id.to_string())
                                .unwrap_or(false);
                            if ours { slot.take() } else { None }
                        };

                        if let Some((identity, _)) = lost {
                            warn!("Connection lost");
                            let reason = Some("Connection lost".to_string());
                            send_event(&mut sender, TransportEvent::Disconnected(identity, reason)).await;
                        }
                    },
                    Some(CentralEvent::StateUpdate(state)) => {
                        send_event(&mut sender, TransportEvent::PoweredStateChanged(power_state(state))).await;
                    },
                    Some(_) => {},
                },
            }
        }
    });
}

fn notifications_task(cancel: CancellationToken, peripheral: Peripheral, mut sender: Sender<SessionInput>) {
    spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to listen for notifications: {:?}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notification = notifications.next() => match notification {
                    None => break 'mainloop,
                    Some(data) => {
                        send_event(&mut sender, TransportEvent::ValueUpdated(data.uuid, data.value)).await;
                    },
                },
            }
        }

        debug!("Notifications task stopped");
    });
}

impl BtleTransport {
    pub async fn new(cancel: CancellationToken, sender: Sender<SessionInput>) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let connected: ConnectedSlot = Arc::new(Mutex::new(None));
        adapter_events_task(cancel.clone(), adapter.clone(), connected.clone(), sender.clone());

        Ok(BtleTransport {
            adapter,
            sender,
            connection_cancel: cancel.child_token(),
            cancel,
            connected,
        })
    }

    fn scan(&self, start: bool) {
        let adapter = self.adapter.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let result = if start {
                // firmware differs in what it advertises, so nothing is filtered
                adapter.start_scan(ScanFilter::default()).await
            } else {
                adapter.stop_scan().await
            };

            match result {
                Ok(()) if start => report_known_peripherals(&adapter, &mut sender).await,
                Ok(()) => {},
                Err(btleplug::Error::PermissionDenied) => {
                    warn!("Scanning failed: permission denied");
                    send_event(&mut sender, TransportEvent::PoweredStateChanged(PowerState::Unauthorized)).await;
                },
                Err(err) if start => {
                    warn!("Scanning failed {:?}", err);
                    send_event(&mut sender, TransportEvent::ScanFailed(err.to_string())).await;
                },
                Err(err) => warn!("Stopping scan failed {:?}", err),
            }
        });
    }

    fn connect(&mut self, identity: PeripheralIdentity) {
        self.connection_cancel.cancel();
        self.connection_cancel = self.cancel.child_token();

        let adapter = self.adapter.clone();
        let connected = self.connected.clone();
        let connection_cancel = self.connection_cancel.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let result = async {
                let peripheral = find_peripheral(&adapter, &identity).await?;
                info!("Connecting to peripheral...");
                with_deadline(peripheral.connect()).await?;
                Ok::<Peripheral, DeviceError>(peripheral)
            }.await;

            match result {
                Ok(peripheral) => {
                    // checked under the lock, a disconnect cancels before it empties the slot
                    let abandoned = {
                        let mut slot = connected.lock().expect("Failed to lock connected peripheral");
                        let abandoned = connection_cancel.is_cancelled();
                        if !abandoned {
                            *slot = Some((identity.clone(), peripheral.clone()));
                        }
                        abandoned
                    };

                    if abandoned {
                        info!("Disconnect was requested while connecting, dropping the connection");
                        if let Err(err) = with_deadline(peripheral.disconnect()).await {
                            warn!("Disconnecting failed: {:?}", err);
                        }
                        return;
                    }

                    notifications_task(connection_cancel, peripheral, sender.clone());
                    send_event(&mut sender, TransportEvent::ConnectSucceeded(identity)).await;
                },
                Err(err) => {
                    warn!("Connecting to peripheral failed: {:?}", err);
                    send_event(&mut sender, TransportEvent::ConnectFailed(identity, err.to_string())).await;
                },
            }
        });
    }

    fn disconnect(&mut self, identity: PeripheralIdentity) {
        self.connection_cancel.cancel();

        let taken = self.connected.lock().expect("Failed to lock connected peripheral").take();
        let adapter = self.adapter.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let peripheral = match taken {
                Some((_, peripheral)) => Ok(peripheral),
                // still connecting
                None => find_peripheral(&adapter, &identity).await,
            };

            let result = match peripheral {
                Ok(peripheral) => with_deadline(peripheral.disconnect()).await,
                Err(err) => Err(err),
            };

            let reason = match result {
                Ok(()) => None,
                Err(err) => {
                    warn!("Disconnecting failed: {:?}", err);
                    Some(err.to_string())
                },
            };
            send_event(&mut sender, TransportEvent::Disconnected(identity, reason)).await;
        });
    }

    fn discover_services(&self, identity: PeripheralIdentity) {
        let connected = self.connected.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let result = async {
                let peripheral = connected_peripheral(&connected)?;
                with_deadline(peripheral.discover_services()).await?;
                let services: Vec<ServiceId> = peripheral.services().iter().map(|service| service.uuid).collect();
                Ok::<Vec<ServiceId>, DeviceError>(services)
            }.await;

            match result {
                Ok(services) => {
                    send_event(&mut sender, TransportEvent::ServicesDiscovered(identity, services)).await;
                },
                Err(err) => {
                    // without services there is nothing to stream, give up on this connection
                    warn!("Discovering services failed: {:?}", err);
                    if let Ok(peripheral) = connected_peripheral(&connected) {
                        connected.lock().expect("Failed to lock connected peripheral").take();
                        if let Err(err) = with_deadline(peripheral.disconnect()).await {
                            warn!("Disconnecting failed: {:?}", err);
                        }
                    }
                    send_event(&mut sender, TransportEvent::Disconnected(identity, Some(err.to_string()))).await;
                },
            }
        });
    }

    fn discover_characteristics(&self, service: ServiceId) {
        let characteristics = connected_peripheral(&self.connected).map(|peripheral| {
            peripheral.services()
                .into_iter()
                .filter(|candidate| candidate.uuid == service)
                .flat_map(|candidate| candidate.characteristics.into_iter())
                .map(|characteristic| (characteristic.uuid, capabilities(characteristic.properties)))
                .collect::<Vec<(Uuid, Capabilities)>>()
        });

        let mut sender = self.sender.clone();
        spawn(async move {
            match characteristics {
                Ok(characteristics) => {
                    send_event(&mut sender, TransportEvent::CharacteristicsDiscovered(service, characteristics)).await;
                },
                Err(err) => debug!("Not discovering characteristics of {}: {:?}", service, err),
            }
        });
    }

    fn subscribe(&self, uuid: CharacteristicId) {
        let connected = self.connected.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let result: Result<(), DeviceError> = async {
                let peripheral = connected_peripheral(&connected)?;
                let characteristic = find_characteristic(&peripheral, uuid)?;
                with_deadline(peripheral.subscribe(&characteristic)).await
            }.await;

            let event = match result {
                Ok(()) => TransportEvent::SubscriptionConfirmed(uuid),
                Err(err) => TransportEvent::SubscriptionFailed(uuid, err.to_string()),
            };
            send_event(&mut sender, event).await;
        });
    }

    fn read(&self, uuid: CharacteristicId) {
        let connected = self.connected.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let result: Result<Vec<u8>, DeviceError> = async {
                let peripheral = connected_peripheral(&connected)?;
                let characteristic = find_characteristic(&peripheral, uuid)?;
                with_deadline(peripheral.read(&characteristic)).await
            }.await;

            let event = match result {
                Ok(value) => TransportEvent::ValueUpdated(uuid, value),
                Err(err) => TransportEvent::ReadFailed(uuid, err.to_string()),
            };
            send_event(&mut sender, event).await;
        });
    }
}

impl Transport for BtleTransport {
    fn execute(&mut self, command: TransportCommand) {
        debug!("Transport command {:?}", command);

        match command {
            TransportCommand::ScanStart => self.scan(true),
            TransportCommand::ScanStop => self.scan(false),
            TransportCommand::Connect(identity) => self.connect(identity),
            TransportCommand::Disconnect(identity) => self.disconnect(identity),
            TransportCommand::DiscoverServices(identity) => self.discover_services(identity),
            TransportCommand::DiscoverCharacteristics(service) => self.discover_characteristics(service),
            TransportCommand::Subscribe(characteristic) => self.subscribe(characteristic),
            TransportCommand::ReadValue(characteristic) => self.read(characteristic),
            // handled by the session loop
            TransportCommand::SchedulePoll { .. } | TransportCommand::CancelPoll(_) => {},
        }
    }
}
