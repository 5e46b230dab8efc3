//! Windows Core Audio backend.
//!
//! Endpoints come from the MMDevice API, volume control and change
//! notifications from `IAudioEndpointVolume`. Callers must hold a
//! [`ComGuard`] on every thread that touches the backend.

mod enumerator;
mod notifications;
mod volume;

pub use enumerator::{ComGuard, WasapiBackend};

use super::device::PlatformError;

impl From<windows::core::Error> for PlatformError {
    fn from(e: windows::core::Error) -> Self {
        PlatformError::new(e.code().0 as u32, e.message().to_string())
    }
}
