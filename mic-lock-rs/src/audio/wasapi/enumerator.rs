//! Device enumeration using Windows MMDevice API.
//!
//! Provides COM initialization and the [`AudioBackend`] implementation.

use super::notifications::{convert_state, DeviceWatch};
use super::volume::WasapiVolume;
use crate::audio::backend::{AudioBackend, DeviceCallback, EndpointVolume, Subscription};
use crate::audio::device::{AudioError, DeviceState, Direction, Endpoint};
use std::sync::Arc;
use tracing::debug;
use windows::core::{Interface, PCWSTR};
use windows::Win32::Devices::Properties::DEVPKEY_Device_FriendlyName;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, EDataFlow, IMMDevice, IMMDeviceEnumerator, IMMEndpoint,
    MMDeviceEnumerator, DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

/// COM initialization guard that uninitializes COM on drop.
///
/// Joins the multithreaded apartment, since volume and device callbacks
/// arrive on arbitrary threads. A thread already in a single-threaded
/// apartment is left as it is.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Initialize COM for the current thread.
    pub fn new() -> Result<Self, AudioError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            debug!("COM already initialized as single-threaded on this thread");
            return Ok(Self { initialized: false });
        }
        hr.ok().map_err(|e| AudioError::ComInitFailed(e.into()))?;
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

fn enumeration_failed(e: windows::core::Error) -> AudioError {
    AudioError::EnumerationFailed(e.into())
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Capture => eCapture,
        Direction::Render => eRender,
    }
}

/// Endpoint access through `IMMDeviceEnumerator`.
pub struct WasapiBackend {
    enumerator: IMMDeviceEnumerator,
}

// SAFETY: MMDevice API objects are free-threaded; the backend is only
// created and used on threads that joined the multithreaded apartment.
unsafe impl Send for WasapiBackend {}
unsafe impl Sync for WasapiBackend {}

impl WasapiBackend {
    /// Note: COM must be initialized before calling this function.
    pub fn new() -> Result<Self, AudioError> {
        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(enumeration_failed)?;
        Ok(Self { enumerator })
    }

    fn device(&self, device_id: &str) -> Result<IMMDevice, AudioError> {
        let device_id_wide: Vec<u16> = device_id.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe {
            self.enumerator
                .GetDevice(PCWSTR::from_raw(device_id_wide.as_ptr()))
                .map_err(|_| AudioError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })
        }
    }

    /// Look up a device and require it to be active.
    fn active_device(&self, device_id: &str) -> Result<IMMDevice, AudioError> {
        let device = self.device(device_id)?;
        let state = unsafe { device.GetState() }.map_err(enumeration_failed)?;
        if convert_state(state) != DeviceState::Active {
            return Err(AudioError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        Ok(device)
    }

    fn default_device_id(&self, direction: Direction) -> Option<String> {
        let device = unsafe {
            self.enumerator
                .GetDefaultAudioEndpoint(data_flow(direction), eConsole)
        }
        .ok()?;
        device_id(&device).ok()
    }

    fn describe(
        &self,
        device: &IMMDevice,
        direction: Direction,
        default_id: Option<&str>,
    ) -> Result<Endpoint, AudioError> {
        let id = device_id(device)?;
        let state = unsafe { device.GetState() }.map_err(enumeration_failed)?;
        let name = friendly_name(device).unwrap_or_else(|| "Unknown".to_string());
        Ok(Endpoint {
            is_default: default_id == Some(id.as_str()),
            id,
            name,
            direction,
            state: convert_state(state),
        })
    }
}

impl AudioBackend for WasapiBackend {
    fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(data_flow(direction), DEVICE_STATE_ACTIVE)
                .map_err(enumeration_failed)?;
            let count = collection.GetCount().map_err(enumeration_failed)?;
            let default_id = self.default_device_id(direction);

            let mut endpoints = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = collection.Item(i).map_err(enumeration_failed)?;
                match self.describe(&device, direction, default_id.as_deref()) {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(e) => debug!("skipping {} endpoint {}: {}", direction, i, e),
                }
            }
            Ok(endpoints)
        }
    }

    fn endpoint(&self, device_id: &str) -> Result<Endpoint, AudioError> {
        let device = self.active_device(device_id)?;
        let flow = unsafe {
            device
                .cast::<IMMEndpoint>()
                .and_then(|endpoint| endpoint.GetDataFlow())
        }
        .map_err(enumeration_failed)?;
        let direction = if flow == eCapture {
            Direction::Capture
        } else {
            Direction::Render
        };
        let default_id = self.default_device_id(direction);
        self.describe(&device, direction, default_id.as_deref())
    }

    fn open_volume(&self, device_id: &str) -> Result<Arc<dyn EndpointVolume>, AudioError> {
        let device = self.active_device(device_id)?;
        Ok(Arc::new(WasapiVolume::new(&device, device_id)?))
    }

    fn watch_devices(&self, callback: DeviceCallback) -> Result<Box<dyn Subscription>, AudioError> {
        Ok(Box::new(DeviceWatch::register(&self.enumerator, callback)?))
    }
}

/// Read a device's ID, releasing the COM-allocated string.
fn device_id(device: &IMMDevice) -> Result<String, AudioError> {
    unsafe {
        let raw = device.GetId().map_err(enumeration_failed)?;
        let id = raw
            .to_string()
            .map_err(|e| AudioError::StringConversion(e.to_string()));
        CoTaskMemFree(Some(raw.0 as *const _));
        id
    }
}

/// Get the friendly name of a device from its property store.
fn friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let props: IPropertyStore = device.OpenPropertyStore(STGM(0)).ok()?;

        // Convert DEVPROPKEY to PROPERTYKEY
        let key = PROPERTYKEY {
            fmtid: DEVPKEY_Device_FriendlyName.fmtid,
            pid: DEVPKEY_Device_FriendlyName.pid,
        };
        let prop = props.GetValue(&key).ok()?;

        let name = prop.to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}
