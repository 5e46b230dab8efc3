//! Audio module: endpoints, the platform seam, and the volume lock.
//!
//! This module provides endpoint enumeration, device-change watching,
//! and the controller that holds an endpoint's master volume.

pub mod backend;
pub mod device;
pub mod registry;
#[cfg(any(test, feature = "simulated"))]
pub mod simulated;
pub mod volume;

#[cfg(windows)]
mod wasapi;

pub use backend::{
    platform_backend, AudioBackend, DeviceCallback, EndpointVolume, Subscription, ThreadScope,
    VolumeCallback,
};
pub use device::{
    AudioError, DeviceEvent, DeviceState, Direction, Endpoint, PlatformError, TargetVolume,
};
pub use registry::DeviceRegistry;
pub use volume::{EventSink, LockEvent, LockPhase, LockStatus, VolumeController};

#[cfg(windows)]
pub use wasapi::{ComGuard, WasapiBackend};
