//! Lock engine configuration.
//!
//! Nothing here is persisted; values come from command line flags,
//! environment variables, or the JSON handed to the FFI layer.

use crate::audio::AudioError;

/// Tuning for the drift-correction loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockConfig {
    /// Tolerance between a reported level and the target that is not
    /// treated as drift. Absorbs mixer quantization and our own echo.
    pub epsilon: f32,

    /// Corrective writes allowed for one off-target level before the
    /// controller waits for a different reading.
    pub max_corrections_per_drift: u32,
}

impl LockConfig {
    pub const DEFAULT_EPSILON: f32 = 0.001;
    pub const DEFAULT_MAX_CORRECTIONS: u32 = 2;
    const MAX_EPSILON: f32 = 0.05;

    /// Check the values are usable.
    pub fn validate(&self) -> Result<(), AudioError> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 || self.epsilon > Self::MAX_EPSILON {
            return Err(AudioError::InvalidConfig(format!(
                "epsilon must be in (0, {}], got {}",
                Self::MAX_EPSILON,
                self.epsilon
            )));
        }
        if self.max_corrections_per_drift == 0 {
            return Err(AudioError::InvalidConfig(
                "max_corrections_per_drift must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Return a validated copy.
    pub fn validated(self) -> Result<Self, AudioError> {
        self.validate()?;
        Ok(self)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            epsilon: Self::DEFAULT_EPSILON,
            max_corrections_per_drift: Self::DEFAULT_MAX_CORRECTIONS,
        }
    }
}
