//! Lock session lifecycle.
//!
//! Composes the device registry and the volume controller. A supervisor
//! thread consumes one serial channel carrying both device-change events
//! and controller events, re-validates the locked endpoint after device
//! changes, and forwards events to the caller.

use crate::audio::{
    AudioBackend, AudioError, DeviceEvent, DeviceRegistry, Direction, Endpoint, EventSink,
    LockEvent, LockPhase, LockStatus, TargetVolume, ThreadScope, VolumeController,
};
use crate::config::LockConfig;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

enum Signal {
    Devices(DeviceEvent),
    Lock(LockEvent),
    Shutdown,
}

/// The unit a caller starts and stops.
///
/// The `events` callback given to [`LockSession::new`] runs on the
/// supervisor thread. Dropping the session stops any active lock and
/// releases all platform subscriptions.
pub struct LockSession {
    registry: Arc<DeviceRegistry>,
    controller: Arc<VolumeController>,
    signals: Sender<Signal>,
    supervisor: Option<JoinHandle<()>>,
}

impl LockSession {
    pub fn new<F>(
        backend: Arc<dyn AudioBackend>,
        config: LockConfig,
        events: F,
    ) -> Result<Self, AudioError>
    where
        F: Fn(LockEvent) + Send + Sync + 'static,
    {
        let config = config.validated()?;
        let (signals, receiver) = mpsc::channel();

        let registry = Arc::new(DeviceRegistry::new(backend.clone()));
        let device_signals = signals.clone();
        registry.subscribe_to_changes(move |event| {
            let _ = device_signals.send(Signal::Devices(event));
        })?;

        let lock_signals = signals.clone();
        let controller = Arc::new(VolumeController::new(backend, config, move |event| {
            let _ = lock_signals.send(Signal::Lock(event));
        }));

        let supervisor = Supervisor {
            registry: registry.clone(),
            controller: controller.clone(),
            events: Arc::new(events),
        };
        let handle = thread::Builder::new()
            .name("mic-lock-supervisor".to_string())
            .spawn(move || supervisor.run(receiver))
            .map_err(AudioError::ThreadSpawn)?;

        info!(
            "Lock session ready (epsilon {}, max {} corrections per drift)",
            config.epsilon, config.max_corrections_per_drift
        );

        Ok(Self {
            registry,
            controller,
            signals,
            supervisor: Some(handle),
        })
    }

    /// Active endpoints for a direction.
    pub fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError> {
        self.registry.list_endpoints(direction)
    }

    /// Start holding `endpoint_id` at `target_percent` (clamped to 100).
    pub fn start_lock(&self, endpoint_id: &str, target_percent: u8) -> Result<(), AudioError> {
        if target_percent > 100 {
            warn!("Target {}% clamped to 100%", target_percent);
        }
        self.controller
            .start(endpoint_id, TargetVolume::from_percent(target_percent))
    }

    /// Stop the lock. Always succeeds.
    pub fn stop_lock(&self) {
        self.controller.stop();
    }

    pub fn status(&self) -> LockStatus {
        self.controller.status()
    }

    pub fn phase(&self) -> LockPhase {
        self.controller.phase()
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.registry.unsubscribe();
        self.controller.stop();
        let _ = self.signals.send(Signal::Shutdown);
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                warn!("Lock session supervisor panicked");
            }
        }
        debug!("Lock session closed");
    }
}

struct Supervisor {
    registry: Arc<DeviceRegistry>,
    controller: Arc<VolumeController>,
    events: EventSink,
}

impl Supervisor {
    fn run(self, signals: Receiver<Signal>) {
        let _scope = ThreadScope::enter();

        while let Ok(signal) = signals.recv() {
            match signal {
                Signal::Shutdown => break,
                Signal::Lock(event) => self.forward(event),
                Signal::Devices(event) => {
                    // Device events come in bursts; one rescan covers them all.
                    let mut batch = vec![event];
                    let mut shutdown = false;
                    while let Ok(next) = signals.try_recv() {
                        match next {
                            Signal::Devices(event) => batch.push(event),
                            Signal::Lock(event) => self.forward(event),
                            Signal::Shutdown => {
                                shutdown = true;
                                break;
                            }
                        }
                    }
                    self.devices_changed(&batch);
                    if shutdown {
                        break;
                    }
                }
            }
        }
    }

    fn forward(&self, event: LockEvent) {
        if let LockEvent::DeviceLost { .. } = event {
            self.controller.reap();
        }
        (self.events)(event);
    }

    fn devices_changed(&self, batch: &[DeviceEvent]) {
        debug!("{} device events: {:?}", batch.len(), batch);

        if let Some(locked) = self.controller.locked_endpoint() {
            let reported_gone = batch.iter().any(|event| match event {
                DeviceEvent::DeviceRemoved { device_id } => *device_id == locked.id,
                DeviceEvent::DeviceStateChanged {
                    device_id,
                    new_state,
                } => *device_id == locked.id && new_state.is_gone(),
                _ => false,
            });

            if reported_gone {
                self.controller.device_lost(&locked.id);
            } else {
                match self.registry.find_active(&locked.id, locked.direction) {
                    Ok(Some(current)) => self.controller.refresh_endpoint(&current),
                    Ok(None) => {
                        self.controller.device_lost(&locked.id);
                    }
                    Err(e) => warn!("Could not re-validate '{}': {}", locked.name, e),
                }
            }
        }

        (self.events)(LockEvent::DeviceListChanged);
    }
}
