//! In-memory audio backend.
//!
//! Behaves like a small platform audio subsystem: endpoints can be plugged,
//! unplugged and re-leveled by an "external actor", and every volume write is
//! counted. Volume notifications are queued and only delivered when
//! [`SimulatedBackend::deliver_notifications`] runs, with no backend lock
//! held, which is how a platform callback thread observes them.

use super::backend::{AudioBackend, DeviceCallback, EndpointVolume, Subscription, VolumeCallback};
use super::device::{AudioError, DeviceEvent, DeviceState, Direction, Endpoint, PlatformError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Upper bound on notifications delivered by one pump, so a feedback loop
/// shows up as a failed assertion instead of a hang.
const MAX_DELIVERIES: usize = 1_000;

const E_FAIL: u32 = 0x8000_4005;

struct SimEndpoint {
    endpoint: Endpoint,
    volume: f32,
    writes: u32,
    /// Hardware step size; written levels snap to multiples of it.
    quantum: Option<f32>,
    /// Writes that fail with a transient error before writes succeed again.
    failing_writes: u32,
}

#[derive(Default)]
struct SimState {
    endpoints: Vec<SimEndpoint>,
    device_watchers: HashMap<u64, DeviceCallback>,
    volume_watchers: HashMap<u64, (String, VolumeCallback)>,
    pending: VecDeque<(String, f32)>,
    next_token: u64,
    enumeration_fails: bool,
}

impl SimState {
    fn find(&self, device_id: &str) -> Option<&SimEndpoint> {
        self.endpoints.iter().find(|e| e.endpoint.id == device_id)
    }

    fn find_mut(&mut self, device_id: &str) -> Option<&mut SimEndpoint> {
        self.endpoints.iter_mut().find(|e| e.endpoint.id == device_id)
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Simulated backend. Cloning yields another handle to the same devices.
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in an active endpoint at full volume.
    pub fn add_endpoint(&self, device_id: &str, name: &str, direction: Direction) {
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.find_mut(device_id) {
                existing.endpoint.state = DeviceState::Active;
                existing.endpoint.name = name.to_string();
            } else {
                state.endpoints.push(SimEndpoint {
                    endpoint: Endpoint::new(device_id, name, direction),
                    volume: 1.0,
                    writes: 0,
                    quantum: None,
                    failing_writes: 0,
                });
            }
        }
        self.notify_devices(DeviceEvent::DeviceAdded {
            device_id: device_id.to_string(),
        });
    }

    /// Change an endpoint's state, as the driver stack would.
    pub fn set_state(&self, device_id: &str, new_state: DeviceState) {
        let changed = match self.state.lock().find_mut(device_id) {
            Some(sim) => {
                sim.endpoint.state = new_state;
                true
            }
            None => false,
        };
        if changed {
            self.notify_devices(DeviceEvent::DeviceStateChanged {
                device_id: device_id.to_string(),
                new_state,
            });
        }
    }

    pub fn unplug(&self, device_id: &str) {
        self.set_state(device_id, DeviceState::Unplugged);
    }

    /// Remove an endpoint entirely.
    pub fn remove_endpoint(&self, device_id: &str) {
        self.state
            .lock()
            .endpoints
            .retain(|e| e.endpoint.id != device_id);
        self.notify_devices(DeviceEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
    }

    /// Rename an endpoint without changing its identity. Raises no event,
    /// like a property change the registry does not subscribe to.
    pub fn rename_endpoint(&self, device_id: &str, name: &str) {
        if let Some(sim) = self.state.lock().find_mut(device_id) {
            sim.endpoint.name = name.to_string();
        }
    }

    /// Mark an endpoint as the default for its direction.
    pub fn set_default(&self, device_id: &str) {
        let direction = {
            let mut state = self.state.lock();
            let Some(direction) = state.find(device_id).map(|e| e.endpoint.direction) else {
                return;
            };
            for sim in state.endpoints.iter_mut() {
                if sim.endpoint.direction == direction {
                    sim.endpoint.is_default = sim.endpoint.id == device_id;
                }
            }
            direction
        };
        self.notify_devices(DeviceEvent::DefaultDeviceChanged {
            direction,
            device_id: Some(device_id.to_string()),
        });
    }

    /// Snap written levels to multiples of `step`.
    pub fn set_quantization(&self, device_id: &str, step: f32) {
        if let Some(sim) = self.state.lock().find_mut(device_id) {
            sim.quantum = Some(step);
        }
    }

    /// Make the next `count` writes fail with a transient error.
    pub fn fail_writes(&self, device_id: &str, count: u32) {
        if let Some(sim) = self.state.lock().find_mut(device_id) {
            sim.failing_writes = count;
        }
    }

    /// Make enumeration fail until switched back.
    pub fn set_enumeration_fails(&self, fails: bool) {
        self.state.lock().enumeration_fails = fails;
    }

    /// Another application changes the volume. Not counted as our write.
    pub fn set_external_volume(&self, device_id: &str, level: f32) {
        let mut state = self.state.lock();
        if let Some(sim) = state.find_mut(device_id) {
            sim.volume = level.clamp(0.0, 1.0);
            let level = sim.volume;
            state.pending.push_back((device_id.to_string(), level));
        }
    }

    /// Deliver queued volume notifications, including the ones queued by
    /// writes made while delivering. Returns the number of notifications.
    pub fn deliver_notifications(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let (handlers, level) = {
                let mut state = self.state.lock();
                let Some((device_id, level)) = state.pending.pop_front() else {
                    break;
                };
                let handlers: Vec<VolumeCallback> = state
                    .volume_watchers
                    .values()
                    .filter(|(id, _)| *id == device_id)
                    .map(|(_, handler)| handler.clone())
                    .collect();
                (handlers, level)
            };
            for handler in handlers {
                handler(level);
            }
            delivered += 1;
        }
        delivered
    }

    pub fn pending_notifications(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Current hardware level of an endpoint.
    pub fn volume(&self, device_id: &str) -> Option<f32> {
        self.state.lock().find(device_id).map(|e| e.volume)
    }

    /// Successful writes made through [`EndpointVolume::set_volume`].
    pub fn write_count(&self, device_id: &str) -> u32 {
        self.state.lock().find(device_id).map_or(0, |e| e.writes)
    }

    /// Registered volume notification handlers for an endpoint.
    pub fn volume_subscriptions(&self, device_id: &str) -> usize {
        self.state
            .lock()
            .volume_watchers
            .values()
            .filter(|(id, _)| id == device_id)
            .count()
    }

    /// Registered device topology watchers.
    pub fn device_watchers(&self) -> usize {
        self.state.lock().device_watchers.len()
    }

    fn notify_devices(&self, event: DeviceEvent) {
        let watchers: Vec<DeviceCallback> =
            self.state.lock().device_watchers.values().cloned().collect();
        trace!("simulated device event {:?} to {} watchers", event, watchers.len());
        for watcher in watchers {
            watcher(event.clone());
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError> {
        let state = self.state.lock();
        if state.enumeration_fails {
            return Err(AudioError::EnumerationFailed(PlatformError::new(
                E_FAIL,
                "audio service unavailable",
            )));
        }
        Ok(state
            .endpoints
            .iter()
            .filter(|e| e.endpoint.direction == direction && e.endpoint.is_active())
            .map(|e| e.endpoint.clone())
            .collect())
    }

    fn endpoint(&self, device_id: &str) -> Result<Endpoint, AudioError> {
        self.state
            .lock()
            .find(device_id)
            .filter(|e| e.endpoint.is_active())
            .map(|e| e.endpoint.clone())
            .ok_or_else(|| AudioError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    fn open_volume(&self, device_id: &str) -> Result<Arc<dyn EndpointVolume>, AudioError> {
        self.endpoint(device_id)?;
        Ok(Arc::new(SimulatedVolume {
            state: self.state.clone(),
            device_id: device_id.to_string(),
        }))
    }

    fn watch_devices(&self, callback: DeviceCallback) -> Result<Box<dyn Subscription>, AudioError> {
        let mut state = self.state.lock();
        let token = state.token();
        state.device_watchers.insert(token, callback);
        Ok(Box::new(SimSubscription {
            state: self.state.clone(),
            token,
        }))
    }
}

struct SimulatedVolume {
    state: Arc<Mutex<SimState>>,
    device_id: String,
}

impl SimulatedVolume {
    fn invalidated(&self) -> AudioError {
        AudioError::DeviceInvalidated {
            device_id: self.device_id.clone(),
        }
    }
}

impl EndpointVolume for SimulatedVolume {
    fn get_volume(&self) -> Result<f32, AudioError> {
        let state = self.state.lock();
        match state.find(&self.device_id) {
            Some(sim) if sim.endpoint.is_active() => Ok(sim.volume),
            _ => Err(self.invalidated()),
        }
    }

    fn set_volume(&self, level: f32) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        let level = {
            let Some(sim) = state.find_mut(&self.device_id).filter(|e| e.endpoint.is_active())
            else {
                return Err(self.invalidated());
            };
            if sim.failing_writes > 0 {
                sim.failing_writes -= 1;
                return Err(AudioError::WriteFailed {
                    device_id: self.device_id.clone(),
                    source: PlatformError::new(E_FAIL, "transient write failure"),
                });
            }
            let level = level.clamp(0.0, 1.0);
            sim.volume = match sim.quantum {
                Some(step) => (level / step).round() * step,
                None => level,
            };
            sim.writes += 1;
            sim.volume
        };
        // The platform notifies on every write, including our own.
        state.pending.push_back((self.device_id.clone(), level));
        Ok(())
    }

    fn subscribe(&self, handler: VolumeCallback) -> Result<Box<dyn Subscription>, AudioError> {
        let mut state = self.state.lock();
        if state.find(&self.device_id).is_none() {
            return Err(self.invalidated());
        }
        let token = state.token();
        state
            .volume_watchers
            .insert(token, (self.device_id.clone(), handler));
        Ok(Box::new(SimSubscription {
            state: self.state.clone(),
            token,
        }))
    }
}

struct SimSubscription {
    state: Arc<Mutex<SimState>>,
    token: u64,
}

impl Subscription for SimSubscription {
    fn id(&self) -> u64 {
        self.token
    }
}

impl Drop for SimSubscription {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.device_watchers.remove(&self.token);
        state.volume_watchers.remove(&self.token);
    }
}
