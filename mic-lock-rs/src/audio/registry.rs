//! Device registry.
//!
//! Snapshots the active endpoints and owns the platform device-change
//! watch. The watch is released when the registry is dropped.

use super::backend::{AudioBackend, DeviceCallback, Subscription};
use super::device::{AudioError, DeviceEvent, Direction, Endpoint};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DeviceRegistry {
    backend: Arc<dyn AudioBackend>,
    watch: Mutex<Option<Box<dyn Subscription>>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            watch: Mutex::new(None),
        }
    }

    /// Active endpoints for a direction, in platform enumeration order.
    ///
    /// An empty list means there are no devices; a failed enumeration is
    /// always reported as `EnumerationFailed`.
    pub fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError> {
        let endpoints = self.backend.list_endpoints(direction).map_err(|e| {
            warn!("{} enumeration failed: {}", direction, e);
            e
        })?;
        Ok(endpoints
            .into_iter()
            .filter(|e| e.is_active() && e.direction == direction)
            .collect())
    }

    /// Find an endpoint by ID among the active endpoints of a direction.
    pub fn find_active(
        &self,
        device_id: &str,
        direction: Direction,
    ) -> Result<Option<Endpoint>, AudioError> {
        Ok(self
            .list_endpoints(direction)?
            .into_iter()
            .find(|e| e.id == device_id))
    }

    /// Register a callback for device changes, replacing any previous one.
    ///
    /// The callback runs on a platform thread. It should only schedule a
    /// rescan, never enumerate inline.
    pub fn subscribe_to_changes<F>(&self, callback: F) -> Result<(), AudioError>
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let callback: DeviceCallback = Arc::new(callback);
        let subscription = self.backend.watch_devices(callback)?;
        debug!("device watch {} registered", subscription.id());
        // The previous watch is dropped after the lock is released.
        let previous = self.watch.lock().replace(subscription);
        drop(previous);
        Ok(())
    }

    /// Release the device-change watch. No-op if none is registered.
    pub fn unsubscribe(&self) {
        let subscription = self.watch.lock().take();
        if let Some(subscription) = subscription {
            debug!("device watch {} released", subscription.id());
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.watch.lock().is_some()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
