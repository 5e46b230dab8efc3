//! Volume lock controller.
//!
//! Holds one endpoint's master volume at a target level. Caller threads
//! drive `start`/`stop`; hardware notifications arrive on a platform thread
//! and go through the same state lock, so a correction write can never
//! start once `stop` has returned.
//!
//! Lock order: `transitions` before `state`. Notification handlers only
//! take `state`, and events are emitted after `state` is released.

use super::backend::{AudioBackend, EndpointVolume, Subscription, VolumeCallback};
use super::device::{AudioError, Endpoint, TargetVolume};
use crate::config::LockConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Externally visible state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Idle,
    Locking,
    /// A corrective write is in flight (sub-state of `Locking`)
    Correcting,
    /// Releasing the notification subscription
    Stopping,
}

/// What a caller displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    Locking {
        endpoint_id: String,
        endpoint_name: String,
        target_percent: u8,
    },
}

impl LockStatus {
    pub fn is_locking(&self) -> bool {
        matches!(self, LockStatus::Locking { .. })
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockStatus::Idle => write!(f, "Not locking"),
            LockStatus::Locking {
                endpoint_name,
                target_percent,
                ..
            } => write!(f, "Locking '{}' at {}%", endpoint_name, target_percent),
        }
    }
}

/// Events delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The lock started, stopped, or the locked device was renamed
    StatusChanged(LockStatus),

    /// The locked endpoint disappeared; the lock is now idle
    DeviceLost { endpoint_id: String },

    /// The device list should be re-read
    DeviceListChanged,
}

/// Sink for controller events.
pub type EventSink = Arc<dyn Fn(LockEvent) + Send + Sync>;

struct ActiveLock {
    endpoint: Endpoint,
    target: TargetVolume,
    volume: Arc<dyn EndpointVolume>,
    subscription: Option<Box<dyn Subscription>>,
    epoch: u64,
    /// Corrective writes since the last in-tolerance reading
    burst_writes: u32,
    /// Off-target level the hardware settled at after the burst cap was hit
    settled_level: Option<f32>,
    /// Failed corrective writes since the last successful one
    consecutive_write_failures: u32,
}

impl ActiveLock {
    fn status(&self) -> LockStatus {
        LockStatus::Locking {
            endpoint_id: self.endpoint.id.clone(),
            endpoint_name: self.endpoint.name.clone(),
            target_percent: self.target.percent(),
        }
    }
}

enum Phase {
    Idle,
    Locking(Box<ActiveLock>),
    Stopping,
}

struct ControllerState {
    phase: Phase,
    next_epoch: u64,
    /// Subscriptions dropped from a notification thread are parked here
    /// and released from a caller thread.
    retired: Vec<Box<dyn Subscription>>,
}

impl ControllerState {
    /// Move out of `Locking`, leaving `next` behind.
    fn take_active(&mut self, next: Phase) -> Option<Box<ActiveLock>> {
        match std::mem::replace(&mut self.phase, next) {
            Phase::Locking(active) => Some(active),
            other => {
                self.phase = other;
                None
            }
        }
    }
}

enum Correction {
    Ignored,
    Settled,
    Corrected,
    Capped,
    /// Write failed; retried on the next notification
    Retry(AudioError),
    /// The endpoint is gone or keeps rejecting writes
    Lost(AudioError),
}

struct Shared {
    backend: Arc<dyn AudioBackend>,
    config: LockConfig,
    transitions: Mutex<()>,
    state: Mutex<ControllerState>,
    correcting: AtomicBool,
    corrections: AtomicU64,
    events: EventSink,
}

impl Shared {
    fn emit(&self, event: LockEvent) {
        (self.events)(event);
    }

    /// Notification entry point. `epoch` is `None` for direct calls that
    /// apply to whatever session is current.
    fn on_notification(&self, epoch: Option<u64>, reported: f32) {
        let mut state = self.state.lock();
        let outcome = match &mut state.phase {
            Phase::Locking(active) if epoch.map_or(true, |e| e == active.epoch) => {
                self.correct(active, reported)
            }
            _ => Correction::Ignored,
        };

        match outcome {
            Correction::Ignored => trace!("stale volume notification {:.3} ignored", reported),
            Correction::Settled => trace!("volume {:.3} within tolerance", reported),
            Correction::Corrected => {
                self.corrections.fetch_add(1, Ordering::Relaxed);
            }
            Correction::Capped => {}
            Correction::Lost(err) => {
                let Some(mut active) = state.take_active(Phase::Idle) else {
                    return;
                };
                // Unregistering from inside the callback is not allowed on
                // every platform; the session reaps it from its own thread.
                if let Some(subscription) = active.subscription.take() {
                    state.retired.push(subscription);
                }
                drop(state);
                warn!(
                    "Giving up on '{}' after failed correction: {}",
                    active.endpoint.name, err
                );
                self.emit(LockEvent::DeviceLost {
                    endpoint_id: active.endpoint.id.clone(),
                });
                self.emit(LockEvent::StatusChanged(LockStatus::Idle));
            }
            Correction::Retry(err) => {
                warn!("Correction skipped, retrying on next notification: {}", err);
            }
        }
    }

    fn correct(&self, active: &mut ActiveLock, reported: f32) -> Correction {
        if !reported.is_finite() {
            return Correction::Ignored;
        }
        let epsilon = self.config.epsilon;
        if active.target.deviation(reported) <= epsilon {
            active.burst_writes = 0;
            active.settled_level = None;
            return Correction::Settled;
        }

        if let Some(settled) = active.settled_level {
            if (reported - settled).abs() <= epsilon {
                return Correction::Capped;
            }
            // A different off-target reading is a new external drift.
            active.settled_level = None;
            active.burst_writes = 0;
        }

        if active.burst_writes >= self.config.max_corrections_per_drift {
            debug!(
                "Hardware settled at {:.3} after {} corrections, target {:.3}",
                reported,
                active.burst_writes,
                active.target.scalar()
            );
            active.settled_level = Some(reported);
            return Correction::Capped;
        }

        self.correcting.store(true, Ordering::Release);
        let result = active.volume.set_volume(active.target.scalar());
        self.correcting.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                active.burst_writes += 1;
                active.consecutive_write_failures = 0;
                debug!(
                    "Drift on '{}': {:.3} -> {:.3}",
                    active.endpoint.name,
                    reported,
                    active.target.scalar()
                );
                Correction::Corrected
            }
            Err(err) if err.indicates_device_loss() => Correction::Lost(err),
            Err(err) => {
                active.consecutive_write_failures += 1;
                if active.consecutive_write_failures >= self.config.max_corrections_per_drift {
                    Correction::Lost(err)
                } else {
                    Correction::Retry(err)
                }
            }
        }
    }
}

/// Lock state machine for a single endpoint at a time.
pub struct VolumeController {
    shared: Arc<Shared>,
}

impl VolumeController {
    /// Create an idle controller. `events` is called from caller threads and
    /// from platform notification threads.
    pub fn new<F>(backend: Arc<dyn AudioBackend>, config: LockConfig, events: F) -> Self
    where
        F: Fn(LockEvent) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                transitions: Mutex::new(()),
                state: Mutex::new(ControllerState {
                    phase: Phase::Idle,
                    next_epoch: 0,
                    retired: Vec::new(),
                }),
                correcting: AtomicBool::new(false),
                corrections: AtomicU64::new(0),
                events: Arc::new(events),
            }),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.shared.config
    }

    /// Start holding `device_id` at `target`.
    ///
    /// Writes the target immediately, subscribes to volume notifications,
    /// then publishes `Locking`. Fails with `AlreadyLocking` if a lock is
    /// active.
    pub fn start(&self, device_id: &str, target: TargetVolume) -> Result<(), AudioError> {
        let _transition = self.shared.transitions.lock();
        let retired = {
            let mut state = self.shared.state.lock();
            if let Phase::Locking(active) = &state.phase {
                return Err(AudioError::AlreadyLocking {
                    device_id: active.endpoint.id.clone(),
                });
            }
            std::mem::take(&mut state.retired)
        };
        drop(retired);

        let endpoint = self.shared.backend.endpoint(device_id)?;
        let volume = self.shared.backend.open_volume(device_id)?;
        volume
            .set_volume(target.scalar())
            .map_err(|err| match err {
                AudioError::DeviceInvalidated { device_id } => {
                    AudioError::DeviceNotFound { device_id }
                }
                other => other,
            })?;

        let epoch = {
            let mut state = self.shared.state.lock();
            state.next_epoch += 1;
            state.next_epoch
        };

        // Notifications that arrive before `Locking` is published are
        // ignored; the read below catches up on them.
        let subscription = volume.subscribe(notification_handler(&self.shared, epoch))?;

        let status = {
            let active = ActiveLock {
                endpoint: endpoint.clone(),
                target,
                volume: volume.clone(),
                subscription: Some(subscription),
                epoch,
                burst_writes: 0,
                settled_level: None,
                consecutive_write_failures: 0,
            };
            let status = active.status();
            self.shared.state.lock().phase = Phase::Locking(Box::new(active));
            status
        };

        info!("Locking '{}' at {}%", endpoint.name, target.percent());
        self.shared.emit(LockEvent::StatusChanged(status));

        match volume.get_volume() {
            Ok(level) => self.shared.on_notification(Some(epoch), level),
            Err(e) => debug!("initial volume read on '{}' failed: {}", endpoint.name, e),
        }
        Ok(())
    }

    /// Stop the lock. Safe in any state; never fails.
    pub fn stop(&self) {
        let _transition = self.shared.transitions.lock();
        let (active, retired) = {
            let mut state = self.shared.state.lock();
            let active = state.take_active(Phase::Stopping);
            if active.is_none() {
                state.phase = Phase::Idle;
            }
            (active, std::mem::take(&mut state.retired))
        };

        // Unregister outside the state lock so an in-flight notification
        // can finish and observe `Stopping`.
        drop(retired);
        let Some(mut active) = active else {
            return;
        };
        if let Some(subscription) = active.subscription.take() {
            debug!("volume subscription {} released", subscription.id());
        }
        self.shared.state.lock().phase = Phase::Idle;

        info!("Stopped locking '{}'", active.endpoint.name);
        self.shared.emit(LockEvent::StatusChanged(LockStatus::Idle));
    }

    /// Handle a volume notification for the current session.
    pub fn on_volume_changed(&self, reported: f32) {
        self.shared.on_notification(None, reported);
    }

    /// The locked endpoint went away. Returns true if it was the locked one.
    pub fn device_lost(&self, device_id: &str) -> bool {
        let _transition = self.shared.transitions.lock();
        let (active, retired) = {
            let mut state = self.shared.state.lock();
            let is_locked = matches!(&state.phase, Phase::Locking(a) if a.endpoint.id == device_id);
            if !is_locked {
                return false;
            }
            (
                state.take_active(Phase::Idle),
                std::mem::take(&mut state.retired),
            )
        };
        drop(retired);
        let Some(mut active) = active else {
            return false;
        };
        drop(active.subscription.take());

        warn!("Locked device '{}' is no longer available", active.endpoint.name);
        self.shared.emit(LockEvent::DeviceLost {
            endpoint_id: active.endpoint.id.clone(),
        });
        self.shared.emit(LockEvent::StatusChanged(LockStatus::Idle));
        true
    }

    /// Update the locked endpoint's snapshot (e.g. a new friendly name).
    pub fn refresh_endpoint(&self, endpoint: &Endpoint) {
        let status = {
            let mut state = self.shared.state.lock();
            match &mut state.phase {
                Phase::Locking(active)
                    if active.endpoint == *endpoint && active.endpoint.name != endpoint.name =>
                {
                    debug!(
                        "Locked device renamed '{}' -> '{}'",
                        active.endpoint.name, endpoint.name
                    );
                    active.endpoint.name = endpoint.name.clone();
                    active.status()
                }
                _ => return,
            }
        };
        self.shared.emit(LockEvent::StatusChanged(status));
    }

    /// Release subscriptions parked by notification threads.
    pub fn reap(&self) {
        let retired = std::mem::take(&mut self.shared.state.lock().retired);
        if !retired.is_empty() {
            debug!("released {} retired subscriptions", retired.len());
        }
    }

    pub fn phase(&self) -> LockPhase {
        if self.shared.correcting.load(Ordering::Acquire) {
            return LockPhase::Correcting;
        }
        match self.shared.state.lock().phase {
            Phase::Idle => LockPhase::Idle,
            Phase::Locking(_) => LockPhase::Locking,
            Phase::Stopping => LockPhase::Stopping,
        }
    }

    pub fn status(&self) -> LockStatus {
        match &self.shared.state.lock().phase {
            Phase::Locking(active) => active.status(),
            Phase::Idle | Phase::Stopping => LockStatus::Idle,
        }
    }

    /// Snapshot of the locked endpoint, if any.
    pub fn locked_endpoint(&self) -> Option<Endpoint> {
        match &self.shared.state.lock().phase {
            Phase::Locking(active) => Some(active.endpoint.clone()),
            _ => None,
        }
    }

    /// Successful corrective writes over the controller's lifetime.
    pub fn correction_count(&self) -> u64 {
        self.shared.corrections.load(Ordering::Relaxed)
    }
}

impl Drop for VolumeController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn notification_handler(shared: &Arc<Shared>, epoch: u64) -> VolumeCallback {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    Arc::new(move |level| {
        if let Some(shared) = weak.upgrade() {
            shared.on_notification(Some(epoch), level);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedBackend;
    use crate::audio::Direction;
    use proptest::prelude::*;
    use std::time::Duration;

    struct Harness {
        backend: SimulatedBackend,
        controller: VolumeController,
        events: Arc<Mutex<Vec<LockEvent>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(LockConfig::default())
        }

        fn with_config(config: LockConfig) -> Self {
            let backend = SimulatedBackend::new();
            backend.add_endpoint("mic-1", "mic-1", Direction::Capture);
            backend.add_endpoint("mic-2", "Headset", Direction::Capture);
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            let controller =
                VolumeController::new(Arc::new(backend.clone()), config, move |event| {
                    sink.lock().push(event)
                });
            Self {
                backend,
                controller,
                events,
            }
        }

        fn lost_events(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| matches!(e, LockEvent::DeviceLost { .. }))
                .count()
        }
    }

    fn approx(a: Option<f32>, b: f32) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-6)
    }

    #[test]
    fn test_start_writes_baseline_and_subscribes() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();

        assert!(approx(h.backend.volume("mic-1"), 0.40));
        assert_eq!(h.backend.write_count("mic-1"), 1);
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 1);
        assert_eq!(h.controller.phase(), LockPhase::Locking);
        assert_eq!(
            h.events.lock().last(),
            Some(&LockEvent::StatusChanged(h.controller.status()))
        );
    }

    #[test]
    fn test_drift_scenario() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        // Echo of the baseline write.
        h.backend.deliver_notifications();
        let baseline = h.backend.write_count("mic-1");

        h.backend.set_external_volume("mic-1", 0.55);
        // External change, then the echo of our correction.
        assert_eq!(h.backend.deliver_notifications(), 2);

        assert_eq!(h.backend.write_count("mic-1") - baseline, 1);
        assert!(approx(h.backend.volume("mic-1"), 0.40));
        assert_eq!(h.controller.correction_count(), 1);
        assert_eq!(
            h.controller.status(),
            LockStatus::Locking {
                endpoint_id: "mic-1".to_string(),
                endpoint_name: "mic-1".to_string(),
                target_percent: 40,
            }
        );
    }

    #[test]
    fn test_second_start_is_rejected() {
        let h = Harness::new();
        let target = TargetVolume::from_percent(40);
        h.controller.start("mic-1", target).unwrap();

        let err = h.controller.start("mic-2", target).unwrap_err();
        assert!(matches!(err, AudioError::AlreadyLocking { ref device_id } if device_id == "mic-1"));
        let err = h.controller.start("mic-1", target).unwrap_err();
        assert!(matches!(err, AudioError::AlreadyLocking { .. }));

        assert_eq!(h.backend.volume_subscriptions("mic-1"), 1);
        assert_eq!(h.backend.volume_subscriptions("mic-2"), 0);
        assert_eq!(h.backend.write_count("mic-2"), 0);
    }

    #[test]
    fn test_concurrent_starts_subscribe_once() {
        let h = Arc::new(Harness::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                std::thread::spawn(move || {
                    h.controller
                        .start("mic-1", TargetVolume::from_percent(30))
                        .is_ok()
                })
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(started, 1);
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 1);
        assert_eq!(h.backend.write_count("mic-1"), 1);
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let h = Harness::new();
        let err = h
            .controller
            .start("missing", TargetVolume::from_percent(50))
            .unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound { .. }));
        assert_eq!(h.controller.phase(), LockPhase::Idle);

        h.backend.unplug("mic-2");
        let err = h
            .controller
            .start("mic-2", TargetVolume::from_percent(50))
            .unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_stop_is_always_safe() {
        let h = Harness::new();
        h.controller.stop();
        assert_eq!(h.controller.phase(), LockPhase::Idle);

        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.controller.stop();
        assert_eq!(h.controller.phase(), LockPhase::Idle);
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);

        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.remove_endpoint("mic-1");
        h.controller.stop();
        h.controller.stop();
        assert_eq!(h.controller.phase(), LockPhase::Idle);
        assert_eq!(h.controller.status(), LockStatus::Idle);
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);
    }

    #[test]
    fn test_no_writes_after_stop() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();
        h.backend.set_external_volume("mic-1", 0.9);
        h.controller.stop();
        let writes = h.backend.write_count("mic-1");

        h.backend.deliver_notifications();
        h.controller.on_volume_changed(0.1);
        assert_eq!(h.backend.write_count("mic-1"), writes);
        assert!(approx(h.backend.volume("mic-1"), 0.9));
    }

    #[test]
    fn test_restart_ignores_previous_session() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.controller.stop();
        h.controller
            .start("mic-1", TargetVolume::from_percent(70))
            .unwrap();
        h.backend.deliver_notifications();

        h.backend.set_external_volume("mic-1", 0.2);
        h.backend.deliver_notifications();
        assert!(approx(h.backend.volume("mic-1"), 0.70));
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 1);
    }

    #[test]
    fn test_quantizing_hardware_is_capped() {
        let h = Harness::new();
        // 0.40 is not representable in 0.03 steps; the mixer lands on 0.39.
        h.backend.set_quantization("mic-1", 0.03);
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();
        let settled = h.backend.write_count("mic-1");

        h.backend.set_external_volume("mic-1", 0.60);
        h.backend.deliver_notifications();
        let writes = h.backend.write_count("mic-1") - settled;
        assert!(writes <= 2, "{writes} writes for one drift");
        assert_eq!(h.backend.pending_notifications(), 0);

        // A new external drift gets corrected again.
        h.backend.set_external_volume("mic-1", 0.81);
        h.backend.deliver_notifications();
        assert!(approx(h.backend.volume("mic-1"), 0.39));
    }

    #[test]
    fn test_explicit_cap_of_three() {
        let h = Harness::with_config(LockConfig {
            max_corrections_per_drift: 3,
            ..LockConfig::default()
        });
        h.backend.set_quantization("mic-1", 0.03);
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();
        let before = h.backend.write_count("mic-1");

        h.backend.set_external_volume("mic-1", 0.60);
        h.backend.deliver_notifications();
        assert_eq!(h.backend.write_count("mic-1") - before, 3);
    }

    #[test]
    fn test_transient_write_failure_retries_next_notification() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();

        h.backend.fail_writes("mic-1", 1);
        h.backend.set_external_volume("mic-1", 0.7);
        h.backend.deliver_notifications();
        assert!(approx(h.backend.volume("mic-1"), 0.7));
        assert_eq!(h.controller.phase(), LockPhase::Locking);

        h.backend.set_external_volume("mic-1", 0.71);
        h.backend.deliver_notifications();
        assert!(approx(h.backend.volume("mic-1"), 0.40));
        assert_eq!(h.lost_events(), 0);
    }

    #[test]
    fn test_persistent_write_failure_ends_lock() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();
        h.backend.fail_writes("mic-1", u32::MAX);

        h.backend.set_external_volume("mic-1", 0.9);
        h.backend.deliver_notifications();
        assert_eq!(h.controller.phase(), LockPhase::Locking);

        h.backend.set_external_volume("mic-1", 0.95);
        h.backend.deliver_notifications();
        assert_eq!(h.controller.phase(), LockPhase::Idle);
        assert_eq!(h.controller.status(), LockStatus::Idle);
        assert_eq!(h.lost_events(), 1);
        assert_eq!(
            h.events.lock().last(),
            Some(&LockEvent::StatusChanged(LockStatus::Idle))
        );

        h.controller.reap();
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);
    }

    #[test]
    fn test_successful_write_resets_failure_count() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();

        for level in [0.7, 0.8] {
            h.backend.fail_writes("mic-1", 1);
            h.backend.set_external_volume("mic-1", level);
            h.backend.deliver_notifications();
            // One failed write, then a successful retry on the next drift.
            h.backend.set_external_volume("mic-1", level + 0.05);
            h.backend.deliver_notifications();
            assert!(approx(h.backend.volume("mic-1"), 0.40));
        }
        assert_eq!(h.controller.phase(), LockPhase::Locking);
        assert_eq!(h.lost_events(), 0);
    }

    #[test]
    fn test_stop_while_notifications_in_flight() {
        for _ in 0..50 {
            let h = Arc::new(Harness::new());
            h.controller
                .start("mic-1", TargetVolume::from_percent(40))
                .unwrap();
            let running = Arc::new(AtomicBool::new(true));
            let pump = {
                let h = h.clone();
                let running = running.clone();
                std::thread::spawn(move || {
                    let mut level = 0.5;
                    while running.load(Ordering::Acquire) {
                        h.backend.set_external_volume("mic-1", level);
                        h.backend.deliver_notifications();
                        level = if level > 0.8 { 0.5 } else { level + 0.1 };
                    }
                })
            };

            std::thread::sleep(Duration::from_millis(2));
            h.controller.stop();
            let writes = h.backend.write_count("mic-1");
            std::thread::sleep(Duration::from_millis(5));
            running.store(false, Ordering::Release);
            pump.join().unwrap();

            assert_eq!(h.backend.write_count("mic-1"), writes);
            assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);
        }
    }

    #[test]
    fn test_write_failure_on_lost_device_goes_idle() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();
        h.backend.deliver_notifications();

        // The device vanishes between detection and correction.
        h.backend.set_external_volume("mic-1", 0.9);
        h.backend.set_state("mic-1", crate::audio::DeviceState::NotPresent);
        h.backend.deliver_notifications();

        assert_eq!(h.controller.phase(), LockPhase::Idle);
        assert_eq!(h.lost_events(), 1);
        // Parked until a caller thread reaps it.
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 1);
        h.controller.reap();
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);

        // The registry path for the same device reports nothing further.
        assert!(!h.controller.device_lost("mic-1"));
        assert_eq!(h.lost_events(), 1);
    }

    #[test]
    fn test_device_lost_releases_subscription_once() {
        let h = Harness::new();
        h.controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();

        assert!(!h.controller.device_lost("mic-2"));
        assert!(h.controller.device_lost("mic-1"));
        assert!(!h.controller.device_lost("mic-1"));

        assert_eq!(h.controller.phase(), LockPhase::Idle);
        assert_eq!(h.backend.volume_subscriptions("mic-1"), 0);
        assert_eq!(h.lost_events(), 1);
        assert_eq!(
            h.events.lock().last(),
            Some(&LockEvent::StatusChanged(LockStatus::Idle))
        );
    }

    #[test]
    fn test_refresh_endpoint_updates_name() {
        let h = Harness::new();
        h.controller
            .start("mic-2", TargetVolume::from_percent(55))
            .unwrap();
        let mut renamed = h.controller.locked_endpoint().unwrap();
        renamed.name = "Headset (Bluetooth)".to_string();
        h.controller.refresh_endpoint(&renamed);

        assert_eq!(
            h.controller.status().to_string(),
            "Locking 'Headset (Bluetooth)' at 55%"
        );
    }

    /// Backend whose volume subscription records the controller phase and
    /// drifts the hardware before registration completes.
    struct RacingBackend {
        sim: SimulatedBackend,
        controller: Arc<Mutex<Weak<VolumeController>>>,
        observed: Arc<Mutex<Vec<LockPhase>>>,
    }

    struct RacingVolume {
        inner: Arc<dyn EndpointVolume>,
        sim: SimulatedBackend,
        device_id: String,
        controller: Arc<Mutex<Weak<VolumeController>>>,
        observed: Arc<Mutex<Vec<LockPhase>>>,
    }

    impl AudioBackend for RacingBackend {
        fn list_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>, AudioError> {
            self.sim.list_endpoints(direction)
        }

        fn endpoint(&self, device_id: &str) -> Result<Endpoint, AudioError> {
            self.sim.endpoint(device_id)
        }

        fn open_volume(&self, device_id: &str) -> Result<Arc<dyn EndpointVolume>, AudioError> {
            Ok(Arc::new(RacingVolume {
                inner: self.sim.open_volume(device_id)?,
                sim: self.sim.clone(),
                device_id: device_id.to_string(),
                controller: self.controller.clone(),
                observed: self.observed.clone(),
            }))
        }

        fn watch_devices(
            &self,
            callback: crate::audio::DeviceCallback,
        ) -> Result<Box<dyn Subscription>, AudioError> {
            self.sim.watch_devices(callback)
        }
    }

    impl EndpointVolume for RacingVolume {
        fn get_volume(&self) -> Result<f32, AudioError> {
            self.inner.get_volume()
        }

        fn set_volume(&self, level: f32) -> Result<(), AudioError> {
            self.inner.set_volume(level)
        }

        fn subscribe(&self, handler: VolumeCallback) -> Result<Box<dyn Subscription>, AudioError> {
            let subscription = self.inner.subscribe(handler)?;
            let controller = self.controller.lock().upgrade();
            if let Some(controller) = controller {
                self.observed.lock().push(controller.phase());
            }
            self.sim.set_external_volume(&self.device_id, 0.9);
            Ok(subscription)
        }
    }

    #[test]
    fn test_locking_published_after_subscription() {
        let sim = SimulatedBackend::new();
        sim.add_endpoint("mic-1", "mic-1", Direction::Capture);
        let slot = Arc::new(Mutex::new(Weak::new()));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let backend = RacingBackend {
            sim: sim.clone(),
            controller: slot.clone(),
            observed: observed.clone(),
        };
        let controller = Arc::new(VolumeController::new(
            Arc::new(backend),
            LockConfig::default(),
            |_| {},
        ));
        *slot.lock() = Arc::downgrade(&controller);

        controller
            .start("mic-1", TargetVolume::from_percent(40))
            .unwrap();

        assert_eq!(*observed.lock(), vec![LockPhase::Idle]);
        assert_eq!(controller.phase(), LockPhase::Locking);
        assert_eq!(sim.volume_subscriptions("mic-1"), 1);
        // The drift during registration is corrected without a notification.
        assert!(approx(sim.volume("mic-1"), 0.40));
        assert_eq!(sim.write_count("mic-1"), 2);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LockStatus::Idle.to_string(), "Not locking");
    }

    proptest! {
        #[test]
        fn prop_in_tolerance_notifications_never_write(
            percent in 0u8..=100,
            offsets in proptest::collection::vec(-0.0009f32..0.0009, 1..40),
        ) {
            let h = Harness::new();
            let target = TargetVolume::from_percent(percent);
            h.controller.start("mic-1", target).unwrap();
            let writes = h.backend.write_count("mic-1");

            for offset in offsets {
                h.controller.on_volume_changed(target.scalar() + offset);
            }
            prop_assert_eq!(h.backend.write_count("mic-1"), writes);
        }

        #[test]
        fn prop_single_drift_bounded(
            percent in 0u8..=100,
            drift in 0.0f32..=1.0,
            step in prop_oneof![Just(None), (0.01f32..0.1).prop_map(Some)],
        ) {
            let h = Harness::new();
            if let Some(step) = step {
                h.backend.set_quantization("mic-1", step);
            }
            h.controller.start("mic-1", TargetVolume::from_percent(percent)).unwrap();
            h.backend.deliver_notifications();
            let writes = h.backend.write_count("mic-1");

            h.backend.set_external_volume("mic-1", drift);
            h.backend.deliver_notifications();
            prop_assert!(h.backend.write_count("mic-1") - writes <= 2);
        }
    }
}
