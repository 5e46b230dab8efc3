//! Microphone Volume Lock - Library
//!
//! Keeps an audio input device's hardware volume pinned at a chosen level,
//! correcting changes made by other applications, hardware buttons, or the
//! operating system.
//!
//! ## Features
//!
//! - List active capture and render endpoints
//! - Hold one endpoint at a target percentage until stopped
//! - Bounded drift correction that never feeds back on its own writes
//! - Automatic release when the locked device is unplugged or disabled
//!
//! [`LockSession`] is the entry point. With the `simulated` feature,
//! `audio::simulated::SimulatedBackend` stands in for the platform audio
//! subsystem in tests.

pub mod audio;
pub mod config;
pub mod session;

pub use audio::{
    AudioError, Direction, Endpoint, LockEvent, LockPhase, LockStatus, TargetVolume,
};
pub use config::LockConfig;
pub use session::LockSession;
