use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod registry;

pub use registry::{DevicePairingRegistry, NotificationSink};

pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub const EVENT_DEVICE_CONNECTED: &str = "device-connected";
pub const EVENT_DEVICE_DISCONNECTED: &str = "device-disconnected";
pub const EVENT_SETUP_COMPLETE: &str = "setup-complete";

pub const NOTIFY_SHOW_SETUP_MODAL: &str = "show-setup-modal";
pub const NOTIFY_DEVICE_REMOVED: &str = "device-removed";
pub const NOTIFY_DEVICE_READY: &str = "device-ready";

pub type SerialNumber = String;
/// Vendor/product metadata as reported by the host's device detection.
pub type RawDeviceInfo = Map<String, Value>;
/// Whatever the setup UI hands back once the user has configured a device.
pub type ConfigPayload = Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor<I = RawDeviceInfo> {
    /// Absent or null on the wire decodes as empty, which the registry rejects.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub serial_number: SerialNumber,
    #[serde(flatten)]
    pub info: I,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<SerialNumber, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<SerialNumber>::deserialize(deserializer)?.unwrap_or_default())
}

impl<I> DeviceDescriptor<I> {
    pub fn new(serial_number: impl Into<SerialNumber>, info: I) -> Self {
        Self {
            serial_number: serial_number.into(),
            info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord<I = RawDeviceInfo, C = ConfigPayload> {
    #[serde(flatten)]
    pub device: DeviceDescriptor<I>,
    #[serde(default)]
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<C>,
}

impl<I, C> DeviceRecord<I, C> {
    pub fn unconfigured(device: DeviceDescriptor<I>) -> Self {
        Self {
            device,
            configured: false,
            config: None,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.device.serial_number
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDisconnected {
    pub serial_number: SerialNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(bound(deserialize = "C: Deserialize<'de> + Default"))]
pub struct SetupComplete<C = ConfigPayload> {
    pub serial_number: SerialNumber,
    /// Left out entirely by callers that configured nothing.
    #[serde(default)]
    pub config: C,
}

/// Lifecycle events reported by the host runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
#[serde(bound(deserialize = "I: Deserialize<'de>, C: Deserialize<'de> + Default"))]
pub enum InboundEvent<I = RawDeviceInfo, C = ConfigPayload> {
    DeviceConnected(DeviceDescriptor<I>),
    DeviceDisconnected(DeviceDisconnected),
    SetupComplete(SetupComplete<C>),
}

impl<I, C> InboundEvent<I, C> {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DeviceConnected(_) => EVENT_DEVICE_CONNECTED,
            InboundEvent::DeviceDisconnected(_) => EVENT_DEVICE_DISCONNECTED,
            InboundEvent::SetupComplete(_) => EVENT_SETUP_COMPLETE,
        }
    }

    pub fn serial_number(&self) -> &str {
        match self {
            InboundEvent::DeviceConnected(device) => &device.serial_number,
            InboundEvent::DeviceDisconnected(event) => &event.serial_number,
            InboundEvent::SetupComplete(event) => &event.serial_number,
        }
    }
}

/// One-way messages for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "notification", content = "payload", rename_all = "kebab-case")]
pub enum Notification<I = RawDeviceInfo, C = ConfigPayload> {
    ShowSetupModal(DeviceDescriptor<I>),
    DeviceRemoved(SerialNumber),
    DeviceReady(DeviceRecord<I, C>),
}

impl<I, C> Notification<I, C> {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ShowSetupModal(_) => NOTIFY_SHOW_SETUP_MODAL,
            Notification::DeviceRemoved(_) => NOTIFY_DEVICE_REMOVED,
            Notification::DeviceReady(_) => NOTIFY_DEVICE_READY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Event(InboundEvent),
    ListConnected,
    Notification(Notification),
    DeviceList(Vec<DeviceRecord>),
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Event = 0,
    ListConnected = 1,
    Notification = 2,
    DeviceList = 3,
    Error = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("device descriptor is missing a usable serial number")]
    InvalidDevice,
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, PairingError> {
    let (message_type, payload) = match message {
        WireMessage::Event(event) => (MessageType::Event, to_json(event)?),
        WireMessage::ListConnected => (MessageType::ListConnected, Vec::new()),
        WireMessage::Notification(notification) => {
            (MessageType::Notification, to_json(notification)?)
        }
        WireMessage::DeviceList(devices) => (MessageType::DeviceList, to_json(devices)?),
        WireMessage::Error { message } => (
            MessageType::Error,
            to_json(&ErrorBody {
                message: message.clone(),
            })?,
        ),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(PairingError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(PairingError::InvalidFrameLength);
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| PairingError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type as u8);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, PairingError> {
    if frame.len() < 5 || frame.len() > MAX_FRAME_BYTES {
        return Err(PairingError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(PairingError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Event as u8 => Ok(WireMessage::Event(from_json(payload)?)),
        x if x == MessageType::ListConnected as u8 => Ok(WireMessage::ListConnected),
        x if x == MessageType::Notification as u8 => {
            Ok(WireMessage::Notification(from_json(payload)?))
        }
        x if x == MessageType::DeviceList as u8 => Ok(WireMessage::DeviceList(from_json(payload)?)),
        x if x == MessageType::Error as u8 => {
            let body: ErrorBody = from_json(payload)?;
            Ok(WireMessage::Error {
                message: body.message,
            })
        }
        other => Err(PairingError::UnsupportedMessageType(other)),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PairingError> {
    serde_json::to_vec(value).map_err(|err| PairingError::Serialization(err.to_string()))
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, PairingError> {
    serde_json::from_slice(payload).map_err(|err| PairingError::Serialization(err.to_string()))
}
