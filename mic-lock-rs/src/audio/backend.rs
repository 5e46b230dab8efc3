//! Platform seam for endpoint enumeration and hardware volume.
//!
//! The lock engine only talks to the audio subsystem through these traits.
//! Notification handlers registered here are invoked on platform-owned
//! threads, so every implementation must be `Send + Sync`.

use super::device::{AudioError, DeviceEvent, Direction, Endpoint};
use std::sync::Arc;

/// Callback for device topology changes.
pub type DeviceCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Callback for hardware volume notifications; receives the new master level.
pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Registration token for a platform notification.
///
/// Dropping the token unregisters the callback. After the drop returns the
/// platform will not start new invocations of it.
pub trait Subscription: Send {
    /// Identifier used in logs.
    fn id(&self) -> u64;
}

/// Hardware volume control for one endpoint.
pub trait EndpointVolume: Send + Sync {
    /// Current master volume level (0.0 to 1.0).
    fn get_volume(&self) -> Result<f32, AudioError>;

    /// Set the master volume level (0.0 to 1.0).
    fn set_volume(&self, level: f32) -> Result<(), AudioError>;

    /// Register a handler for volume change notifications.
    fn subscribe(&self, handler: VolumeCallback) -> Result<Box<dyn Subscription>, AudioError>;
}

/// Access to the platform audio subsystem.
pub trait AudioBackend: Send + Sync {
    /// Active endpoints in platform enumeration order.
    fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError>;

    /// Look up a single endpoint. Fails with `DeviceNotFound` unless it is active.
    fn endpoint(&self, device_id: &str) -> Result<Endpoint, AudioError>;

    /// Open the volume control of an endpoint.
    fn open_volume(&self, device_id: &str) -> Result<Arc<dyn EndpointVolume>, AudioError>;

    /// Register a callback for device topology changes.
    fn watch_devices(&self, callback: DeviceCallback) -> Result<Box<dyn Subscription>, AudioError>;
}

/// Per-thread platform setup for worker threads that call into a backend.
///
/// On Windows this joins the COM multithreaded apartment for the lifetime
/// of the value; elsewhere it does nothing.
pub struct ThreadScope {
    #[cfg(windows)]
    _com: Option<super::wasapi::ComGuard>,
}

impl ThreadScope {
    pub fn enter() -> Self {
        #[cfg(windows)]
        {
            match super::wasapi::ComGuard::new() {
                Ok(guard) => Self { _com: Some(guard) },
                Err(e) => {
                    tracing::warn!("worker thread COM setup failed: {}", e);
                    Self { _com: None }
                }
            }
        }
        #[cfg(not(windows))]
        {
            Self {}
        }
    }
}

/// The backend for the platform this binary was built for.
///
/// On Windows COM must be initialized on the calling thread first
/// (see `ComGuard` or [`ThreadScope`]).
#[cfg(windows)]
pub fn platform_backend() -> Result<Arc<dyn AudioBackend>, AudioError> {
    Ok(Arc::new(super::wasapi::WasapiBackend::new()?))
}

/// The backend for the platform this binary was built for.
#[cfg(not(windows))]
pub fn platform_backend() -> Result<Arc<dyn AudioBackend>, AudioError> {
    Err(AudioError::Unsupported)
}
