//! Single owner of the device registry.
//!
//! Inbound events and queries travel over one bounded channel and are handled
//! strictly in arrival order by a single task. Notifications fan out to every
//! subscriber through a broadcast channel.

use galpair_core::{
    DevicePairingRegistry, DeviceRecord, InboundEvent, Notification, PairingError, SerialNumber,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub event_queue_capacity: usize,
    pub notification_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
        }
    }
}

enum Command {
    Event {
        event: InboundEvent,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    ListConnected {
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
    Get {
        serial_number: SerialNumber,
        reply: oneshot::Sender<Option<DeviceRecord>>,
    },
}

#[derive(Debug, Clone)]
pub struct PairingHandle {
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl PairingHandle {
    /// Queues `event` and waits until the dispatcher has applied or rejected it.
    pub async fn submit(&self, event: InboundEvent) -> HostResult<()> {
        let (reply, verdict) = oneshot::channel();
        self.send(Command::Event { event, reply }).await?;
        verdict.await.map_err(|_| HostError::DispatcherClosed)??;
        Ok(())
    }

    pub async fn list_connected(&self) -> HostResult<Vec<DeviceRecord>> {
        let (reply, devices) = oneshot::channel();
        self.send(Command::ListConnected { reply }).await?;
        devices.await.map_err(|_| HostError::DispatcherClosed)
    }

    pub async fn get(&self, serial_number: &str) -> HostResult<Option<DeviceRecord>> {
        let (reply, record) = oneshot::channel();
        self.send(Command::Get {
            serial_number: serial_number.to_owned(),
            reply,
        })
        .await?;
        record.await.map_err(|_| HostError::DispatcherClosed)
    }

    /// Notifications published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn send(&self, command: Command) -> HostResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HostError::DispatcherClosed)
    }
}

/// Spawns the dispatcher task on the current tokio runtime.
///
/// The task stops once every [`PairingHandle`] clone has been dropped.
pub fn spawn_dispatcher(config: DispatcherConfig) -> PairingHandle {
    let (commands, command_rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let (notifications, _) = broadcast::channel(config.notification_buffer.max(1));

    tokio::spawn(run_dispatcher(
        DevicePairingRegistry::new(),
        command_rx,
        notifications.clone(),
    ));

    PairingHandle {
        commands,
        notifications,
    }
}

async fn run_dispatcher(
    mut registry: DevicePairingRegistry,
    mut commands: mpsc::Receiver<Command>,
    notifications: broadcast::Sender<Notification>,
) {
    info!("pairing dispatcher started");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Event { event, reply } => {
                let name = event.name();
                let serial_number = event.serial_number().to_owned();
                debug!("handling {} for {:?}", name, serial_number);

                let result = registry.apply(event, &mut |notification: Notification| {
                    publish(&notifications, notification)
                });
                if let Err(err) = &result {
                    warn!("rejected {} for {:?}: {}", name, serial_number, err);
                }
                let _ = reply.send(result);
            }
            Command::ListConnected { reply } => {
                let _ = reply.send(registry.list_connected());
            }
            Command::Get {
                serial_number,
                reply,
            } => {
                let _ = reply.send(registry.get(&serial_number).cloned());
            }
        }
    }

    info!(
        "pairing dispatcher stopped with {} device(s) attached",
        registry.len()
    );
}

fn publish(notifications: &broadcast::Sender<Notification>, notification: Notification) {
    debug!("publishing {}", notification.name());
    // Err only means nobody is listening right now.
    let _ = notifications.send(notification);
}

#[cfg(test)]
mod tests {
    use galpair_core::{DeviceDescriptor, DeviceDisconnected, SetupComplete};
    use serde_json::json;

    use super::*;

    fn connect(serial: &str) -> InboundEvent {
        InboundEvent::DeviceConnected(DeviceDescriptor::new(
            serial,
            json!({"vendor": "X"}).as_object().cloned().unwrap_or_default(),
        ))
    }

    fn disconnect(serial: &str) -> InboundEvent {
        InboundEvent::DeviceDisconnected(DeviceDisconnected {
            serial_number: serial.to_owned(),
        })
    }

    fn setup(serial: &str) -> InboundEvent {
        InboundEvent::SetupComplete(SetupComplete {
            serial_number: serial.to_owned(),
            config: json!({"baud": 9600}),
        })
    }

    #[tokio::test]
    async fn events_are_applied_in_order_and_published() {
        let handle = spawn_dispatcher(DispatcherConfig::default());
        let mut notifications = handle.subscribe();

        handle.submit(connect("SN1")).await.unwrap();
        handle.submit(setup("SN1")).await.unwrap();

        let first = notifications.recv().await.unwrap();
        assert_eq!(first.name(), galpair_core::NOTIFY_SHOW_SETUP_MODAL);
        let second = notifications.recv().await.unwrap();
        match second {
            Notification::DeviceReady(record) => {
                assert!(record.configured);
                assert_eq!(record.config, Some(json!({"baud": 9600})));
            }
            other => panic!("unexpected notification {other:?}"),
        }

        let devices = handle.list_connected().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].configured);
    }

    #[tokio::test]
    async fn invalid_device_is_returned_to_submitter_only() {
        let handle = spawn_dispatcher(DispatcherConfig::default());
        let mut notifications = handle.subscribe();

        let err = handle.submit(connect("")).await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Pairing(PairingError::InvalidDevice)
        ));

        handle.submit(disconnect("SN1")).await.unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::DeviceRemoved("SN1".to_owned())
        );
        assert!(handle.list_connected().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn setup_for_unknown_device_publishes_nothing() {
        let handle = spawn_dispatcher(DispatcherConfig::default());
        let mut notifications = handle.subscribe();

        handle.submit(setup("SN2")).await.unwrap();

        assert!(matches!(
            notifications.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(handle.get("SN2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_returns_owned_copy_of_record() {
        let handle = spawn_dispatcher(DispatcherConfig {
            event_queue_capacity: 1,
            notification_buffer: 1,
        });

        handle.submit(connect("SN1")).await.unwrap();
        let record = handle.get("SN1").await.unwrap().expect("record present");
        assert_eq!(record.serial_number(), "SN1");
        assert!(!record.configured);
    }

    #[tokio::test]
    async fn zero_capacities_are_clamped() {
        let handle = spawn_dispatcher(DispatcherConfig {
            event_queue_capacity: 0,
            notification_buffer: 0,
        });

        handle.submit(connect("SN1")).await.unwrap();
        assert!(handle.get("SN1").await.unwrap().is_some());
    }
}
