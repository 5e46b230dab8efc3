//! Device and volume change notifications.
//!
//! COM invokes these callbacks on its own threads. Each registration is
//! owned by a watch object that unregisters on drop.

use crate::audio::backend::{DeviceCallback, Subscription, VolumeCallback};
use crate::audio::device::{AudioError, DeviceEvent, DeviceState, Direction};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};
use windows::core::{implement, PCWSTR};
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient,
    IMMNotificationClient_Impl, AUDIO_VOLUME_NOTIFICATION_DATA, DEVICE_STATE,
};
use windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY;
// The implement macro expands to paths under windows_core.
#[allow(unused_imports)]
use windows_core;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

fn next_watch_id() -> u64 {
    NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed)
}

pub(super) fn convert_state(state: DEVICE_STATE) -> DeviceState {
    match state.0 {
        1 => DeviceState::Active,
        2 => DeviceState::Disabled,
        4 => DeviceState::NotPresent,
        8 => DeviceState::Unplugged,
        _ => DeviceState::NotPresent,
    }
}

/// Run a handler without letting a panic unwind into COM.
fn guarded(what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{} handler panicked", what);
    }
}

#[implement(IMMNotificationClient)]
struct DeviceNotificationClient {
    callback: DeviceCallback,
}

impl DeviceNotificationClient {
    fn notify(&self, event: DeviceEvent) {
        guarded("device change", || (self.callback)(event));
    }
}

impl IMMNotificationClient_Impl for DeviceNotificationClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        if let Ok(id) = unsafe { pwstrdeviceid.to_string() } {
            self.notify(DeviceEvent::DeviceStateChanged {
                device_id: id,
                new_state: convert_state(dwnewstate),
            });
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Ok(id) = unsafe { pwstrdeviceid.to_string() } {
            self.notify(DeviceEvent::DeviceAdded { device_id: id });
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Ok(id) = unsafe { pwstrdeviceid.to_string() } {
            self.notify(DeviceEvent::DeviceRemoved { device_id: id });
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        // Fired once per role; the console role is enough.
        if role != eConsole {
            return Ok(());
        }
        let direction = if flow == eCapture {
            Direction::Capture
        } else if flow == eRender {
            Direction::Render
        } else {
            return Ok(());
        };

        let device_id = if pwstrdefaultdeviceid.is_null() {
            None
        } else {
            unsafe { pwstrdefaultdeviceid.to_string() }.ok()
        };
        self.notify(DeviceEvent::DefaultDeviceChanged {
            direction,
            device_id,
        });
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// Registered `IMMNotificationClient`.
pub(super) struct DeviceWatch {
    id: u64,
    enumerator: IMMDeviceEnumerator,
    client: IMMNotificationClient,
}

// SAFETY: the enumerator and client are MTA objects.
unsafe impl Send for DeviceWatch {}

impl DeviceWatch {
    pub(super) fn register(
        enumerator: &IMMDeviceEnumerator,
        callback: DeviceCallback,
    ) -> Result<Self, AudioError> {
        let client: IMMNotificationClient = DeviceNotificationClient { callback }.into();
        unsafe { enumerator.RegisterEndpointNotificationCallback(&client) }
            .map_err(|e| AudioError::SubscriptionFailed(e.into()))?;
        Ok(Self {
            id: next_watch_id(),
            enumerator: enumerator.clone(),
            client,
        })
    }
}

impl Subscription for DeviceWatch {
    fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        if let Err(e) = unsafe {
            self.enumerator
                .UnregisterEndpointNotificationCallback(&self.client)
        } {
            warn!("failed to unregister device watch {}: {}", self.id, e);
        }
    }
}

#[implement(IAudioEndpointVolumeCallback)]
struct VolumeNotificationClient {
    handler: VolumeCallback,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeNotificationClient_Impl {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        // SAFETY: COM keeps the notification data alive for the call.
        let Some(data) = (unsafe { pnotify.as_ref() }) else {
            return Ok(());
        };
        let level = data.fMasterVolume;
        guarded("volume change", || (self.handler)(level));
        Ok(())
    }
}

/// Registered `IAudioEndpointVolumeCallback`.
pub(super) struct VolumeWatch {
    id: u64,
    endpoint_volume: IAudioEndpointVolume,
    client: IAudioEndpointVolumeCallback,
}

// SAFETY: the endpoint volume and client are MTA objects.
unsafe impl Send for VolumeWatch {}

impl VolumeWatch {
    pub(super) fn register(
        endpoint_volume: &IAudioEndpointVolume,
        handler: VolumeCallback,
    ) -> Result<Self, AudioError> {
        let client: IAudioEndpointVolumeCallback = VolumeNotificationClient { handler }.into();
        unsafe { endpoint_volume.RegisterControlChangeNotify(&client) }
            .map_err(|e| AudioError::SubscriptionFailed(e.into()))?;
        Ok(Self {
            id: next_watch_id(),
            endpoint_volume: endpoint_volume.clone(),
            client,
        })
    }
}

impl Subscription for VolumeWatch {
    fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for VolumeWatch {
    fn drop(&mut self) {
        // Blocks until in-flight OnNotify calls have returned.
        if let Err(e) = unsafe { self.endpoint_volume.UnregisterControlChangeNotify(&self.client) } {
            warn!("failed to unregister volume watch {}: {}", self.id, e);
        }
    }
}
