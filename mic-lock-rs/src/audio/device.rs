//! Audio endpoint data models.
//!
//! Defines the core data structures for representing audio endpoints,
//! their state, the lock target, and related events.

use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Data-flow direction of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Input device (microphone, line-in)
    Capture,

    /// Output device (speakers, headphones)
    Render,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Render => write!(f, "render"),
        }
    }
}

/// Platform device state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device is active and available for use
    Active,

    /// Device is disabled in the sound settings
    Disabled,

    /// Device is not present (driver removed)
    NotPresent,

    /// Device is unplugged (for pluggable devices)
    Unplugged,
}

impl DeviceState {
    /// True for the states in which a held volume handle is dead.
    pub fn is_gone(&self) -> bool {
        matches!(self, DeviceState::NotPresent | DeviceState::Unplugged)
    }
}

/// A snapshot of an audio endpoint.
///
/// Identity is the `id`; `name` may change while the device stays the same,
/// so equality and hashing ignore everything but the id.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Opaque, stable platform device ID
    pub id: String,

    /// Human-readable device name
    pub name: String,

    /// Capture or render
    pub direction: Direction,

    /// State at the time of the snapshot
    pub state: DeviceState,

    /// Whether this is the system default device for its direction
    pub is_default: bool,
}

impl Endpoint {
    /// Create an active, non-default endpoint snapshot.
    pub fn new(id: impl Into<String>, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction,
            state: DeviceState::Active,
            is_default: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == DeviceState::Active
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Volume level the lock holds, as a scalar in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetVolume(f32);

impl TargetVolume {
    /// Create from a scalar, clamping into range. NaN maps to silence.
    pub fn from_scalar(level: f32) -> Self {
        if level.is_nan() {
            Self(0.0)
        } else {
            Self(level.clamp(0.0, 1.0))
        }
    }

    /// Create from a percentage; values above 100 are clamped.
    pub fn from_percent(percent: u8) -> Self {
        Self(f32::from(percent.min(100)) / 100.0)
    }

    pub fn scalar(&self) -> f32 {
        self.0
    }

    /// Volume as percentage (0-100).
    pub fn percent(&self) -> u8 {
        (self.0 * 100.0).round() as u8
    }

    /// Distance between a reported hardware level and this target.
    pub fn deviation(&self, reported: f32) -> f32 {
        (reported - self.0).abs()
    }
}

/// Events from the platform audio system.
///
/// Consumers should treat every variant as "a rescan is warranted"; the
/// payload is a hint, not a complete description of the new topology.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A new audio device was connected
    DeviceAdded { device_id: String },

    /// An audio device was disconnected
    DeviceRemoved { device_id: String },

    /// Device state changed (active, disabled, not present, unplugged)
    DeviceStateChanged {
        device_id: String,
        new_state: DeviceState,
    },

    /// Default device changed for a direction
    DefaultDeviceChanged {
        direction: Direction,
        device_id: Option<String>, // None if no default device
    },
}

impl DeviceEvent {
    /// The device the event names, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::DeviceAdded { device_id }
            | DeviceEvent::DeviceRemoved { device_id }
            | DeviceEvent::DeviceStateChanged { device_id, .. } => Some(device_id),
            DeviceEvent::DefaultDeviceChanged { device_id, .. } => device_id.as_deref(),
        }
    }
}

/// A failure reported by the platform audio subsystem.
#[derive(Debug, Clone, Error)]
#[error("{message} (0x{code:08X})")]
pub struct PlatformError {
    /// Raw platform status code (HRESULT on Windows)
    pub code: u32,
    pub message: String,
}

impl PlatformError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Audio service error types.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(#[source] PlatformError),

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Already locking device: {device_id}")]
    AlreadyLocking { device_id: String },

    #[error("Volume write failed on {device_id}: {source}")]
    WriteFailed {
        device_id: String,
        #[source]
        source: PlatformError,
    },

    #[error("Device has been invalidated: {device_id}")]
    DeviceInvalidated { device_id: String },

    #[error("Failed to register notification: {0}")]
    SubscriptionFailed(#[source] PlatformError),

    #[error("Volume control not available for device")]
    VolumeNotAvailable,

    #[error("COM initialization failed: {0}")]
    ComInitFailed(#[source] PlatformError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No audio backend for this platform")]
    Unsupported,

    #[error("Failed to start session thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("String conversion error: {0}")]
    StringConversion(String),
}

impl AudioError {
    /// True if the error means the endpoint behind a handle is gone for good.
    pub fn indicates_device_loss(&self) -> bool {
        matches!(
            self,
            AudioError::DeviceInvalidated { .. } | AudioError::DeviceNotFound { .. }
        )
    }
}
