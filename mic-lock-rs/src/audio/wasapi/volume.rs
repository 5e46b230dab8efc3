//! Volume control using IAudioEndpointVolume.

use super::notifications::VolumeWatch;
use crate::audio::backend::{EndpointVolume, Subscription, VolumeCallback};
use crate::audio::device::AudioError;
use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::{IMMDevice, AUDCLNT_E_DEVICE_INVALIDATED};
use windows::Win32::System::Com::CLSCTX_ALL;

/// Master volume of one endpoint.
pub(super) struct WasapiVolume {
    device_id: String,
    endpoint_volume: IAudioEndpointVolume,
}

// SAFETY: IAudioEndpointVolume is free-threaded in the MTA.
unsafe impl Send for WasapiVolume {}
unsafe impl Sync for WasapiVolume {}

impl WasapiVolume {
    pub(super) fn new(device: &IMMDevice, device_id: &str) -> Result<Self, AudioError> {
        let endpoint_volume: IAudioEndpointVolume = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(|_| AudioError::VolumeNotAvailable)?;
        Ok(Self {
            device_id: device_id.to_string(),
            endpoint_volume,
        })
    }

    fn is_invalidated(e: &windows::core::Error) -> bool {
        e.code() == AUDCLNT_E_DEVICE_INVALIDATED
    }
}

impl EndpointVolume for WasapiVolume {
    fn get_volume(&self) -> Result<f32, AudioError> {
        unsafe { self.endpoint_volume.GetMasterVolumeLevelScalar() }.map_err(|e| {
            if Self::is_invalidated(&e) {
                AudioError::DeviceInvalidated {
                    device_id: self.device_id.clone(),
                }
            } else {
                AudioError::VolumeNotAvailable
            }
        })
    }

    fn set_volume(&self, level: f32) -> Result<(), AudioError> {
        let level = level.clamp(0.0, 1.0);
        unsafe {
            self.endpoint_volume
                .SetMasterVolumeLevelScalar(level, std::ptr::null())
        }
        .map_err(|e| {
            if Self::is_invalidated(&e) {
                AudioError::DeviceInvalidated {
                    device_id: self.device_id.clone(),
                }
            } else {
                AudioError::WriteFailed {
                    device_id: self.device_id.clone(),
                    source: e.into(),
                }
            }
        })
    }

    fn subscribe(&self, handler: VolumeCallback) -> Result<Box<dyn Subscription>, AudioError> {
        Ok(Box::new(VolumeWatch::register(&self.endpoint_volume, handler)?))
    }
}
