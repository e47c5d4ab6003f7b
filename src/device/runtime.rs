use std::collections::HashMap;
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Receiver, SendError, Sender};
use log::{debug, info};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device::constants::INPUT_CHANNEL_SIZE;
use crate::device::session::DeviceSession;
use crate::device::types::{
    CharacteristicId, SessionInput, SessionSnapshot, TransportCommand, TransportEvent, UserCommand,
};

/// Executes transport commands. Implementations must not block: the outcome of a command is
/// reported later by sending a [`TransportEvent`] into the session's input channel.
pub trait Transport: Send {
    fn execute(&mut self, command: TransportCommand);
}

/// Poll timers, at most one per characteristic.
pub struct PollScheduler {
    sender: Sender<SessionInput>,
    cancel: CancellationToken,
    timers: HashMap<CharacteristicId, CancellationToken>,
}

impl PollScheduler {
    pub fn new(cancel: CancellationToken, sender: Sender<SessionInput>) -> Self {
        PollScheduler { sender, cancel, timers: HashMap::new() }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.timers.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Sends a `PollTick` every `interval_ms`, the first one after a full interval.
    pub fn schedule(&mut self, characteristic: CharacteristicId, interval_ms: u64) {
        self.cancel(&characteristic);

        let token = self.cancel.child_token();
        let task_token = token.clone();
        let mut sender = self.sender.clone();

        spawn(async move {
            let mut ticks = interval(Duration::from_millis(interval_ms));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticks.tick().await;

            'mainloop: loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        break 'mainloop;
                    },
                    _ = ticks.tick() => {
                        let tick = SessionInput::Transport(TransportEvent::PollTick(characteristic));
                        if sender.send(tick).await.is_err() {
                            break 'mainloop;
                        }
                    },
                }
            }
        });

        debug!("Polling {} every {}ms", characteristic, interval_ms);
        self.timers.insert(characteristic, token);
    }

    pub fn cancel(&mut self, characteristic: &CharacteristicId) {
        if let Some(token) = self.timers.remove(characteristic) {
            debug!("Stopped polling {}", characteristic);
            token.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
    }
}

/// Used by the presentation layer to send commands and observe the session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: Sender<SessionInput>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn command(&mut self, command: UserCommand) -> Result<(), SendError> {
        self.sender.send(SessionInput::User(command)).await
    }

    /// Injects a transport event, for transports that are not driven through [`Transport`].
    pub async fn event(&mut self, event: TransportEvent) -> Result<(), SendError> {
        self.sender.send(SessionInput::Transport(event)).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }
}

pub fn session_channel() -> (Sender<SessionInput>, Receiver<SessionInput>) {
    channel::<SessionInput>(INPUT_CHANNEL_SIZE)
}

fn execute_all<T: Transport>(
    commands: Vec<TransportCommand>,
    transport: &mut T,
    scheduler: &mut PollScheduler,
) {
    for command in commands {
        match command {
            TransportCommand::SchedulePoll { characteristic, interval_ms } => {
                scheduler.schedule(characteristic, interval_ms);
            },
            TransportCommand::CancelPoll(characteristic) => {
                scheduler.cancel(&characteristic);
            },
            command => transport.execute(command),
        }
    }
}

/// Runs the session loop on a new task. All inputs, from the transport, the poll timers and the
/// presentation layer, are processed one at a time in the order they arrive.
///
/// When `cancel` is cancelled, a connected peripheral is disconnected and the loop stops.
pub fn spawn_session<T: Transport + 'static>(
    cancel: CancellationToken,
    mut session: DeviceSession,
    mut transport: T,
    sender: Sender<SessionInput>,
    mut receiver: Receiver<SessionInput>,
) -> (SessionHandle, JoinHandle<()>) {
    let (snapshot_sender, snapshot_receiver) = watch::channel(session.snapshot());
    let mut scheduler = PollScheduler::new(cancel.child_token(), sender.clone());

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                input = receiver.next() => {
                    let input = match input {
                        Some(input) => input,
                        None => break 'mainloop,
                    };

                    let commands = session.handle(input);
                    execute_all(commands, &mut transport, &mut scheduler);

                    let snapshot = session.snapshot();
                    snapshot_sender.send_if_modified(|current| {
                        if *current == snapshot {
                            return false;
                        }
                        *current = snapshot;
                        true
                    });
                },
            }
        }

        info!("Stopping session");
        let commands = session.handle(SessionInput::User(UserCommand::Disconnect));
        execute_all(commands, &mut transport, &mut scheduler);
        scheduler.cancel_all();
        snapshot_sender.send_replace(session.snapshot());
    });

    let session_handle = SessionHandle { sender, snapshots: snapshot_receiver };
    (session_handle, handle)
}
