//! FFI bindings for the microphone volume lock.
//!
//! This crate provides C ABI functions for use from C# via P/Invoke.
//! All functions use panic::catch_unwind to prevent Rust panics from
//! unwinding across the FFI boundary.

use mic_lock::audio::{platform_backend, AudioBackend, ThreadScope};
use mic_lock::{
    AudioError, Direction, Endpoint, LockConfig, LockEvent, LockSession, LockStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// Error Handling
// ============================================================================

/// Error codes returned by FFI functions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidHandle = -1,
    InvalidArgument = -2,
    DeviceNotFound = -3,
    ComError = -4,
    JsonError = -5,
    VolumeNotAvailable = -6,
    AlreadyLocking = -7,
    WriteFailed = -8,
    EnumerationFailed = -9,
    Unsupported = -10,
    InvalidConfig = -11,
    Panic = -99,
}

impl From<&AudioError> for ErrorCode {
    fn from(err: &AudioError) -> Self {
        match err {
            AudioError::DeviceNotFound { .. } | AudioError::DeviceInvalidated { .. } => {
                ErrorCode::DeviceNotFound
            }
            AudioError::AlreadyLocking { .. } => ErrorCode::AlreadyLocking,
            AudioError::WriteFailed { .. } => ErrorCode::WriteFailed,
            AudioError::EnumerationFailed(_) => ErrorCode::EnumerationFailed,
            AudioError::VolumeNotAvailable => ErrorCode::VolumeNotAvailable,
            AudioError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            AudioError::Unsupported => ErrorCode::Unsupported,
            AudioError::StringConversion(_) => ErrorCode::InvalidArgument,
            _ => ErrorCode::ComError,
        }
    }
}

/// Thread-local storage for the last error.
thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

fn set_last_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some((code, message.into()));
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

fn record_error(err: &AudioError) -> ErrorCode {
    let code = ErrorCode::from(err);
    set_last_error(code, err.to_string());
    code
}

// ============================================================================
// Data Types for JSON Serialization
// ============================================================================

/// Configuration for engine creation. Every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub epsilon: Option<f32>,

    #[serde(default)]
    pub max_corrections_per_drift: Option<u32>,
}

impl EngineConfig {
    fn lock_config(&self) -> LockConfig {
        let defaults = LockConfig::default();
        LockConfig {
            epsilon: self.epsilon.unwrap_or(defaults.epsilon),
            max_corrections_per_drift: self
                .max_corrections_per_drift
                .unwrap_or(defaults.max_corrections_per_drift),
        }
    }
}

/// An audio endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointDto {
    pub id: String,
    pub name: String,
    pub direction: String,
    pub is_default: bool,
}

impl From<Endpoint> for EndpointDto {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            id: endpoint.id,
            name: endpoint.name,
            direction: endpoint.direction.to_string(),
            is_default: endpoint.is_default,
        }
    }
}

/// Response containing a list of devices.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<EndpointDto>,
}

/// Lock status for display.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusDto {
    pub locking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_percent: Option<u8>,
    pub text: String,
}

impl From<LockStatus> for StatusDto {
    fn from(status: LockStatus) -> Self {
        let text = status.to_string();
        match status {
            LockStatus::Idle => Self {
                locking: false,
                endpoint_id: None,
                endpoint_name: None,
                target_percent: None,
                text,
            },
            LockStatus::Locking {
                endpoint_id,
                endpoint_name,
                target_percent,
            } => Self {
                locking: true,
                endpoint_id: Some(endpoint_id),
                endpoint_name: Some(endpoint_name),
                target_percent: Some(target_percent),
                text,
            },
        }
    }
}

/// An event from the lock session.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDto {
    StatusChanged { status: StatusDto },
    DeviceLost { endpoint_id: String },
    DeviceListChanged,
}

impl From<LockEvent> for EventDto {
    fn from(event: LockEvent) -> Self {
        match event {
            LockEvent::StatusChanged(status) => EventDto::StatusChanged {
                status: status.into(),
            },
            LockEvent::DeviceLost { endpoint_id } => EventDto::DeviceLost { endpoint_id },
            LockEvent::DeviceListChanged => EventDto::DeviceListChanged,
        }
    }
}

// ============================================================================
// Engine Handle Type
// ============================================================================

/// Opaque handle to the lock engine. Actually points to a MicLockEngine struct.
pub type MicLockHandle = *mut c_void;

/// Events held for a host that polls slowly or not at all.
const MAX_PENDING_EVENTS: usize = 64;

/// Pending events waiting for `mic_lock_poll_event`.
///
/// Holds at most [`MAX_PENDING_EVENTS`]; the oldest event is dropped when
/// full. At most one `DeviceListChanged` is pending at a time.
#[derive(Default)]
struct EventQueue {
    pending: Mutex<VecDeque<LockEvent>>,
}

impl EventQueue {
    fn push(&self, event: LockEvent) {
        let mut pending = self.pending.lock();
        if event == LockEvent::DeviceListChanged && pending.contains(&event) {
            return;
        }
        if pending.len() >= MAX_PENDING_EVENTS {
            if let Some(dropped) = pending.pop_front() {
                debug!("event queue full, dropping {:?}", dropped);
            }
        }
        pending.push_back(event);
    }

    fn pop(&self) -> Option<LockEvent> {
        self.pending.lock().pop_front()
    }
}

/// Internal engine state.
struct MicLockEngine {
    session: LockSession,
    events: Arc<EventQueue>,
}

impl MicLockEngine {
    fn with_backend(backend: Arc<dyn AudioBackend>, config: LockConfig) -> Result<Self, AudioError> {
        let events = Arc::new(EventQueue::default());
        let sink = events.clone();
        Ok(Self {
            session: LockSession::new(backend, config, move |event| sink.push(event))?,
            events,
        })
    }

    fn into_handle(self) -> MicLockHandle {
        Box::into_raw(Box::new(self)) as MicLockHandle
    }

    fn next_event(&self) -> Option<LockEvent> {
        self.events.pop()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Allocate a C string from a Rust string. Caller must free with mic_lock_free_string.
fn alloc_c_string(s: &str) -> *mut c_char {
    // Interior nul bytes are stripped rather than failing the call.
    let cleaned: String = s.chars().filter(|c| *c != '\0').collect();
    match CString::new(cleaned) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Parse a C string to a Rust string slice.
unsafe fn parse_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Borrow the engine behind a handle.
unsafe fn engine<'a>(handle: MicLockHandle) -> Option<&'a MicLockEngine> {
    (handle as *const MicLockEngine).as_ref()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, AudioError> {
    serde_json::to_string(value).map_err(|e| AudioError::StringConversion(e.to_string()))
}

/// Execute a closure with COM set up for the current thread.
fn with_com<T, F: FnOnce() -> Result<T, AudioError>>(f: F) -> Result<T, AudioError> {
    let _scope = ThreadScope::enter();
    f()
}

fn init_logging(level: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.unwrap_or("warn")));
    // A host may create several engines; only the first installs a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn parse_config(config_json: *const c_char) -> Result<EngineConfig, (ErrorCode, String)> {
    if config_json.is_null() {
        return Ok(EngineConfig::default());
    }
    let json = unsafe { parse_c_str(config_json) }
        .ok_or((ErrorCode::InvalidArgument, "Config is not valid UTF-8".to_string()))?;
    if json.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_json::from_str(json).map_err(|e| (ErrorCode::JsonError, format!("Invalid config: {}", e)))
}

// ============================================================================
// FFI Functions - Lifecycle
// ============================================================================

/// Create a new lock engine instance.
///
/// # Arguments
/// * `config_json` - JSON configuration string (can be null for defaults)
///
/// # Returns
/// Handle to the engine, or null on failure. Check mic_lock_last_error_code() on failure.
///
/// # Safety
/// The returned handle must be freed with mic_lock_destroy().
#[no_mangle]
pub extern "C" fn mic_lock_create(config_json: *const c_char) -> MicLockHandle {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let config = match parse_config(config_json) {
            Ok(config) => config,
            Err((code, message)) => {
                set_last_error(code, message);
                return ptr::null_mut();
            }
        };
        init_logging(config.log_level.as_deref());

        let created = config.lock_config().validated().and_then(|lock_config| {
            with_com(|| MicLockEngine::with_backend(platform_backend()?, lock_config))
        });
        match created {
            Ok(engine) => {
                debug!("engine created");
                engine.into_handle()
            }
            Err(e) => {
                record_error(&e);
                ptr::null_mut()
            }
        }
    });

    match result {
        Ok(handle) => handle,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during engine creation");
            ptr::null_mut()
        }
    }
}

/// Destroy a lock engine instance. Stops any active lock.
///
/// # Safety
/// The handle must have been created by mic_lock_create() and must not be used after this call.
#[no_mangle]
pub extern "C" fn mic_lock_destroy(handle: MicLockHandle) {
    if handle.is_null() {
        return;
    }

    let result = panic::catch_unwind(|| {
        let _ = with_com(|| {
            unsafe {
                drop(Box::from_raw(handle as *mut MicLockEngine));
            }
            Ok(())
        });
    });
    if result.is_err() {
        warn!("panic while destroying engine");
    }
}

// ============================================================================
// FFI Functions - Devices
// ============================================================================

/// List active devices.
///
/// # Arguments
/// * `handle` - Engine handle
/// * `direction` - 0 = capture (microphones), 1 = render (outputs)
///
/// # Returns
/// JSON string containing the device list. Caller must free with mic_lock_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn mic_lock_list_devices(handle: MicLockHandle, direction: u32) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine(handle) }) else {
            set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
            return ptr::null_mut();
        };
        let direction = match direction {
            0 => Direction::Capture,
            1 => Direction::Render,
            _ => {
                set_last_error(ErrorCode::InvalidArgument, "Invalid direction");
                return ptr::null_mut();
            }
        };

        let json = with_com(|| {
            let devices = engine.session.list_endpoints(direction)?;
            to_json(&DeviceListResponse {
                devices: devices.into_iter().map(Into::into).collect(),
            })
        });
        match json {
            Ok(json) => alloc_c_string(&json),
            Err(e) => {
                record_error(&e);
                ptr::null_mut()
            }
        }
    }));

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during device enumeration");
            ptr::null_mut()
        }
    }
}

// ============================================================================
// FFI Functions - Lock
// ============================================================================

/// Start holding a capture device at a volume.
///
/// # Arguments
/// * `handle` - Engine handle
/// * `device_id` - The device ID (UTF-8 string)
/// * `percent` - Target volume, 0 to 100 (larger values are clamped)
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn mic_lock_start(
    handle: MicLockHandle,
    device_id: *const c_char,
    percent: i32,
) -> i32 {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine(handle) }) else {
            set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
            return ErrorCode::InvalidHandle as i32;
        };
        let Some(device_id) = (unsafe { parse_c_str(device_id) }) else {
            set_last_error(ErrorCode::InvalidArgument, "Invalid device ID");
            return ErrorCode::InvalidArgument as i32;
        };
        if percent < 0 {
            set_last_error(ErrorCode::InvalidArgument, "Percent must not be negative");
            return ErrorCode::InvalidArgument as i32;
        }
        let percent = percent.min(100) as u8;

        match with_com(|| engine.session.start_lock(device_id, percent)) {
            Ok(()) => ErrorCode::Success as i32,
            Err(e) => record_error(&e) as i32,
        }
    }));

    match result {
        Ok(code) => code,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during lock start");
            ErrorCode::Panic as i32
        }
    }
}

/// Stop the active lock. Succeeds when nothing is locked.
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn mic_lock_stop(handle: MicLockHandle) -> i32 {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine(handle) }) else {
            set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
            return ErrorCode::InvalidHandle as i32;
        };
        let _ = with_com(|| {
            engine.session.stop_lock();
            Ok(())
        });
        ErrorCode::Success as i32
    }));

    match result {
        Ok(code) => code,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during lock stop");
            ErrorCode::Panic as i32
        }
    }
}

/// Get the lock status.
///
/// # Returns
/// JSON status. Caller must free with mic_lock_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn mic_lock_status(handle: MicLockHandle) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine(handle) }) else {
            set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
            return ptr::null_mut();
        };
        match to_json(&StatusDto::from(engine.session.status())) {
            Ok(json) => alloc_c_string(&json),
            Err(e) => {
                record_error(&e);
                ptr::null_mut()
            }
        }
    }));

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during status query");
            ptr::null_mut()
        }
    }
}

/// Take the next pending event without blocking.
///
/// # Returns
/// JSON event, or null if no event is pending (last error code stays 0).
/// Caller must free with mic_lock_free_string().
#[no_mangle]
pub extern "C" fn mic_lock_poll_event(handle: MicLockHandle) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine(handle) }) else {
            set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
            return ptr::null_mut();
        };
        let Some(event) = engine.next_event() else {
            return ptr::null_mut();
        };
        match to_json(&EventDto::from(event)) {
            Ok(json) => alloc_c_string(&json),
            Err(e) => {
                record_error(&e);
                ptr::null_mut()
            }
        }
    }));

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during event poll");
            ptr::null_mut()
        }
    }
}

// ============================================================================
// FFI Functions - Memory Management
// ============================================================================

/// Free a string allocated by this library.
///
/// # Safety
/// The pointer must have been returned by one of the mic_lock_* functions.
/// Do not call this on strings from other sources.
#[no_mangle]
pub extern "C" fn mic_lock_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    });
}

// ============================================================================
// FFI Functions - Error Handling
// ============================================================================

/// Get the last error code.
///
/// # Returns
/// The error code from the last failed operation, or 0 if no error.
#[no_mangle]
pub extern "C" fn mic_lock_last_error_code() -> i32 {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(code, _)| *code as i32)
            .unwrap_or(0)
    })
}

/// Get the last error message.
///
/// # Returns
/// Error message string. Caller must free with mic_lock_free_string().
/// Returns null if no error.
#[no_mangle]
pub extern "C" fn mic_lock_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(_, msg)| alloc_c_string(msg))
            .unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// FFI Functions - Utility
// ============================================================================

/// Get the library version.
///
/// # Returns
/// Version string. Caller must free with mic_lock_free_string().
#[no_mangle]
pub extern "C" fn mic_lock_version() -> *mut c_char {
    alloc_c_string(env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mic_lock::audio::simulated::SimulatedBackend;
    use std::time::{Duration, Instant};

    fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        mic_lock_free_string(ptr);
        s
    }

    fn simulated_engine() -> (SimulatedBackend, MicLockHandle) {
        let backend = SimulatedBackend::new();
        backend.add_endpoint("mic-1", "USB Microphone", Direction::Capture);
        backend.add_endpoint("spk-1", "Speakers", Direction::Render);
        let engine =
            MicLockEngine::with_backend(Arc::new(backend.clone()), LockConfig::default()).unwrap();
        (backend, engine.into_handle())
    }

    fn poll_until(handle: MicLockHandle, wanted: &str) -> Vec<serde_json::Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            let ptr = mic_lock_poll_event(handle);
            if ptr.is_null() {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            let event: serde_json::Value = serde_json::from_str(&take_string(ptr)).unwrap();
            let done = event["type"] == wanted;
            events.push(event);
            if done {
                return events;
            }
        }
        panic!("no {wanted} event, got {events:?}");
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(
            ErrorCode::from(&AudioError::DeviceNotFound {
                device_id: "test".to_string()
            }),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(
            ErrorCode::from(&AudioError::AlreadyLocking {
                device_id: "test".to_string()
            }),
            ErrorCode::AlreadyLocking
        );
        assert_eq!(ErrorCode::from(&AudioError::Unsupported), ErrorCode::Unsupported);
    }

    #[test]
    fn test_create_rejects_bad_json() {
        let json = CString::new("{not json").unwrap();
        let handle = mic_lock_create(json.as_ptr());
        assert!(handle.is_null());
        assert_eq!(mic_lock_last_error_code(), ErrorCode::JsonError as i32);
        assert!(take_string(mic_lock_last_error_message()).starts_with("Invalid config"));
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let json = CString::new(r#"{"epsilon": 0.0}"#).unwrap();
        assert!(mic_lock_create(json.as_ptr()).is_null());
        assert_eq!(mic_lock_last_error_code(), ErrorCode::InvalidConfig as i32);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_create_without_platform_backend() {
        assert!(mic_lock_create(ptr::null()).is_null());
        assert_eq!(mic_lock_last_error_code(), ErrorCode::Unsupported as i32);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_corrections_per_drift": 3}"#).unwrap();
        let lock = config.lock_config();
        assert_eq!(lock.epsilon, LockConfig::DEFAULT_EPSILON);
        assert_eq!(lock.max_corrections_per_drift, 3);
    }

    #[test]
    fn test_list_devices() {
        let (_backend, handle) = simulated_engine();
        let json: serde_json::Value =
            serde_json::from_str(&take_string(mic_lock_list_devices(handle, 0))).unwrap();
        assert_eq!(json["devices"][0]["id"], "mic-1");
        assert_eq!(json["devices"][0]["direction"], "capture");

        let json: serde_json::Value =
            serde_json::from_str(&take_string(mic_lock_list_devices(handle, 1))).unwrap();
        assert_eq!(json["devices"][0]["name"], "Speakers");

        assert!(mic_lock_list_devices(handle, 7).is_null());
        assert_eq!(mic_lock_last_error_code(), ErrorCode::InvalidArgument as i32);
        mic_lock_destroy(handle);
    }

    #[test]
    fn test_lock_lifecycle() {
        let (backend, handle) = simulated_engine();
        let device = CString::new("mic-1").unwrap();

        assert_eq!(mic_lock_start(handle, device.as_ptr(), 40), 0);
        assert_eq!(
            mic_lock_start(handle, device.as_ptr(), 40),
            ErrorCode::AlreadyLocking as i32
        );

        let status: serde_json::Value =
            serde_json::from_str(&take_string(mic_lock_status(handle))).unwrap();
        assert_eq!(status["locking"], true);
        assert_eq!(status["target_percent"], 40);
        assert_eq!(status["text"], "Locking 'USB Microphone' at 40%");

        backend.set_external_volume("mic-1", 0.9);
        backend.deliver_notifications();
        assert!((backend.volume("mic-1").unwrap() - 0.4).abs() < 1e-6);

        backend.unplug("mic-1");
        let events = poll_until(handle, "device_lost");
        assert_eq!(events.last().unwrap()["endpoint_id"], "mic-1");

        assert_eq!(mic_lock_stop(handle), 0);
        let status: serde_json::Value =
            serde_json::from_str(&take_string(mic_lock_status(handle))).unwrap();
        assert_eq!(status["locking"], false);
        assert_eq!(status["text"], "Not locking");
        mic_lock_destroy(handle);
    }

    #[test]
    fn test_start_argument_errors() {
        let (_backend, handle) = simulated_engine();
        assert_eq!(
            mic_lock_start(handle, ptr::null(), 40),
            ErrorCode::InvalidArgument as i32
        );
        let device = CString::new("mic-1").unwrap();
        assert_eq!(
            mic_lock_start(handle, device.as_ptr(), -5),
            ErrorCode::InvalidArgument as i32
        );
        let missing = CString::new("mic-9").unwrap();
        assert_eq!(
            mic_lock_start(handle, missing.as_ptr(), 40),
            ErrorCode::DeviceNotFound as i32
        );
        mic_lock_destroy(handle);
    }

    #[test]
    fn test_null_handle() {
        assert!(mic_lock_status(ptr::null_mut()).is_null());
        assert_eq!(mic_lock_last_error_code(), ErrorCode::InvalidHandle as i32);
        assert_eq!(mic_lock_stop(ptr::null_mut()), ErrorCode::InvalidHandle as i32);
        assert!(mic_lock_poll_event(ptr::null_mut()).is_null());
        mic_lock_destroy(ptr::null_mut());
    }

    #[test]
    fn test_poll_without_events() {
        let (_backend, handle) = simulated_engine();
        assert!(mic_lock_poll_event(handle).is_null());
        assert_eq!(mic_lock_last_error_code(), 0);
        mic_lock_destroy(handle);
    }

    #[test]
    fn test_device_list_changes_coalesce() {
        let queue = EventQueue::default();
        for _ in 0..10 {
            queue.push(LockEvent::DeviceListChanged);
        }
        queue.push(LockEvent::DeviceLost {
            endpoint_id: "mic-1".to_string(),
        });
        queue.push(LockEvent::DeviceListChanged);

        assert_eq!(queue.pop(), Some(LockEvent::DeviceListChanged));
        assert!(matches!(queue.pop(), Some(LockEvent::DeviceLost { .. })));
        assert_eq!(queue.pop(), None);

        // Once the pending hint is taken, the next one queues again.
        queue.push(LockEvent::DeviceListChanged);
        assert_eq!(queue.pop(), Some(LockEvent::DeviceListChanged));
    }

    #[test]
    fn test_event_queue_is_bounded() {
        let queue = EventQueue::default();
        for i in 0..MAX_PENDING_EVENTS + 10 {
            queue.push(LockEvent::DeviceLost {
                endpoint_id: format!("mic-{i}"),
            });
        }
        assert_eq!(queue.pending.lock().len(), MAX_PENDING_EVENTS);
        assert_eq!(
            queue.pop(),
            Some(LockEvent::DeviceLost {
                endpoint_id: "mic-10".to_string()
            })
        );
    }

    #[test]
    fn test_unpolled_device_churn_stays_bounded() {
        let (backend, handle) = simulated_engine();
        for i in 0..200 {
            backend.add_endpoint(&format!("mic-{}", i + 2), "Headset", Direction::Capture);
        }
        // The supervisor keeps draining; wait for it to settle then count.
        let engine = unsafe { engine(handle) }.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.events.pending.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            engine.events.pending.lock().len(),
            1,
            "device churn should leave one pending hint"
        );
        mic_lock_destroy(handle);
    }

    #[test]
    fn test_version() {
        let version = take_string(mic_lock_version());
        assert!(!version.is_empty());
    }
}
