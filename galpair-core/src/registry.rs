//! In-memory tracker for attached devices and their setup state.
//!
//! Each serial number moves through `Unknown -> Connected(unconfigured) ->
//! Connected(configured)` and drops back to `Unknown` on disconnect. Setup
//! completion for a serial that is not connected never creates a record.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::{
    ConfigPayload, DeviceDescriptor, DeviceDisconnected, DeviceRecord, InboundEvent,
    Notification, PairingError, RawDeviceInfo, SerialNumber, SetupComplete,
};

/// Receives notifications produced by [`DevicePairingRegistry::apply`].
pub trait NotificationSink<I = RawDeviceInfo, C = ConfigPayload> {
    fn notify(&mut self, notification: Notification<I, C>);
}

impl<I, C, F> NotificationSink<I, C> for F
where
    F: FnMut(Notification<I, C>),
{
    fn notify(&mut self, notification: Notification<I, C>) {
        self(notification)
    }
}

/// Devices currently attached, keyed by serial number.
///
/// The registry is plain owned state. Whoever owns it serializes access; the
/// host crate keeps it inside a single dispatcher task.
#[derive(Debug, Clone)]
pub struct DevicePairingRegistry<I = RawDeviceInfo, C = ConfigPayload> {
    devices: BTreeMap<SerialNumber, DeviceRecord<I, C>>,
}

impl<I, C> Default for DevicePairingRegistry<I, C> {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }
}

impl<I: Clone, C: Clone> DevicePairingRegistry<I, C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `device`, resetting it to unconfigured.
    pub fn on_connected(
        &mut self,
        device: DeviceDescriptor<I>,
    ) -> Result<Notification<I, C>, PairingError> {
        if device.serial_number.trim().is_empty() {
            warn!("rejecting connect event without a serial number");
            return Err(PairingError::InvalidDevice);
        }

        let serial_number = device.serial_number.clone();
        let previous = self
            .devices
            .insert(serial_number.clone(), DeviceRecord::unconfigured(device.clone()));
        if previous.is_some() {
            info!("device {} reconnected, previous record replaced", serial_number);
        } else {
            info!("device {} connected", serial_number);
        }

        Ok(Notification::ShowSetupModal(device))
    }

    /// Removes the record if present. The removal notice goes out either way.
    pub fn on_disconnected(&mut self, serial_number: &str) -> Notification<I, C> {
        match self.devices.remove(serial_number) {
            Some(_) => info!("device {} disconnected", serial_number),
            None => debug!("disconnect for unknown device {}", serial_number),
        }
        Notification::DeviceRemoved(serial_number.to_owned())
    }

    pub fn on_setup_complete(
        &mut self,
        serial_number: &str,
        config: C,
    ) -> Option<Notification<I, C>> {
        let Some(record) = self.devices.get_mut(serial_number) else {
            debug!("ignoring setup completion for unknown device {}", serial_number);
            return None;
        };

        record.configured = true;
        record.config = Some(config);
        info!("device {} setup complete", serial_number);
        Some(Notification::DeviceReady(record.clone()))
    }

    /// Snapshot of every attached device, ordered by serial number.
    pub fn list_connected(&self) -> Vec<DeviceRecord<I, C>> {
        self.devices.values().cloned().collect()
    }

    pub fn get(&self, serial_number: &str) -> Option<&DeviceRecord<I, C>> {
        self.devices.get(serial_number)
    }

    pub fn is_connected(&self, serial_number: &str) -> bool {
        self.devices.contains_key(serial_number)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Routes one inbound event and hands any resulting notification to `sink`.
    ///
    /// Nothing reaches the sink when the event is rejected.
    pub fn apply<S>(&mut self, event: InboundEvent<I, C>, sink: &mut S) -> Result<(), PairingError>
    where
        S: NotificationSink<I, C> + ?Sized,
    {
        let notification = match event {
            InboundEvent::DeviceConnected(device) => Some(self.on_connected(device)?),
            InboundEvent::DeviceDisconnected(DeviceDisconnected { serial_number }) => {
                Some(self.on_disconnected(&serial_number))
            }
            InboundEvent::SetupComplete(SetupComplete {
                serial_number,
                config,
            }) => self.on_setup_complete(&serial_number, config),
        };

        if let Some(notification) = notification {
            sink.notify(notification);
        }
        Ok(())
    }
}
