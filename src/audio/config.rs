//! Capture configuration: stride, transform window and band count
//!
//! A [`CaptureConfiguration`] is validated once and never mutated. Changing
//! any of its values means building a new one and restarting the pipeline.

use super::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest transform window accepted
pub const MIN_WINDOW_SAMPLES: usize = 8;

/// Default upper bound for windows derived from a band count
pub const DEFAULT_MAX_WINDOW_SAMPLES: usize = 32_768;

/// Default number of samples retired per analysed window
pub const DEFAULT_STRIDE_SAMPLES: usize = 512;

/// Validated stride / window / band parameters for one capture run.
///
/// `band_count` never exceeds `window_samples / 2`, so the Nyquist bin and
/// everything mirrored above it are never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfiguration {
    stride_samples: usize,
    window_samples: usize,
    band_count: usize,
}

impl CaptureConfiguration {
    /// Derive the window from a desired band count (4x rule, capped).
    ///
    /// If the cap forces a window too small for `band_count`, the band
    /// count is clamped to `window / 2`.
    pub fn from_band_count(
        band_count: usize,
        stride_samples: usize,
        max_window_samples: usize,
    ) -> Result<Self, CaptureError> {
        check_window(max_window_samples, "maximum window")?;
        let window_samples = Self::window_samples_for(band_count, max_window_samples);
        Self::from_band_count_with_window(band_count, window_samples, stride_samples)
    }

    /// Use an explicit window; a band count the window cannot honour without
    /// mirroring is silently clamped to `window / 2`.
    pub fn from_band_count_with_window(
        band_count: usize,
        window_samples: usize,
        stride_samples: usize,
    ) -> Result<Self, CaptureError> {
        check_stride(stride_samples)?;
        check_window(window_samples, "window")?;
        if band_count == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "band count must be at least 1".to_string(),
            ));
        }

        let limit = Self::band_count_for(window_samples);
        if band_count > limit {
            log::debug!(
                "Clamping band count {} to {} for a {}-sample window",
                band_count,
                limit,
                window_samples
            );
        }

        Ok(Self {
            stride_samples,
            window_samples,
            band_count: band_count.min(limit),
        })
    }

    /// Use an explicit window and expose every unique bin below Nyquist.
    pub fn from_window_samples(
        window_samples: usize,
        stride_samples: usize,
    ) -> Result<Self, CaptureError> {
        check_stride(stride_samples)?;
        check_window(window_samples, "window")?;
        Ok(Self {
            stride_samples,
            window_samples,
            band_count: Self::band_count_for(window_samples),
        })
    }

    /// `next_pow2(max(8, 4 * band_count))`, capped at `max_window_samples`.
    pub fn window_samples_for(band_count: usize, max_window_samples: usize) -> usize {
        band_count
            .saturating_mul(4)
            .max(MIN_WINDOW_SAMPLES)
            .checked_next_power_of_two()
            .unwrap_or(max_window_samples)
            .min(max_window_samples)
    }

    /// Unique bins of a real transform, Nyquist excluded.
    pub fn band_count_for(window_samples: usize) -> usize {
        window_samples / 2
    }

    pub fn stride_samples(&self) -> usize {
        self.stride_samples
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            stride_samples: DEFAULT_STRIDE_SAMPLES,
            window_samples: 1024,
            band_count: 512,
        }
    }
}

fn check_stride(stride_samples: usize) -> Result<(), CaptureError> {
    if !stride_samples.is_power_of_two() {
        return Err(CaptureError::InvalidConfiguration(format!(
            "stride must be a power of two greater than zero, got {}",
            stride_samples
        )));
    }
    Ok(())
}

fn check_window(window_samples: usize, what: &str) -> Result<(), CaptureError> {
    if !window_samples.is_power_of_two() || window_samples < MIN_WINDOW_SAMPLES {
        return Err(CaptureError::InvalidConfiguration(format!(
            "{} must be a power of two >= {}, got {}",
            what, MIN_WINDOW_SAMPLES, window_samples
        )));
    }
    Ok(())
}

/// Process-level tunables that outlive a single [`CaptureConfiguration`].
///
/// Every field has a default, so a settings file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Upper clamp applied to every magnitude
    #[serde(default = "default_magnitude_ceiling")]
    pub magnitude_ceiling: f32,

    /// Cap for windows derived from a band count
    #[serde(default = "default_max_window_samples")]
    pub max_window_samples: usize,

    /// Samples kept for oscilloscope-style display
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Pause after starting the hardware before `start()` returns
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Channel count requested from the device before falling back to mono
    #[serde(default = "default_preferred_channels")]
    pub preferred_channels: u16,

    /// Requested sample rate; the device default is used when unset
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// Accumulator preallocation, in windows
    #[serde(default = "default_accumulator_headroom")]
    pub accumulator_headroom: usize,

    /// Frames mixed down per chunk inside the real-time callback
    #[serde(default = "default_callback_scratch_frames")]
    pub callback_scratch_frames: usize,

    /// Input device name; the default input device is used when unset
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_magnitude_ceiling() -> f32 {
    100.0
}

fn default_max_window_samples() -> usize {
    DEFAULT_MAX_WINDOW_SAMPLES
}

fn default_history_capacity() -> usize {
    4096
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_preferred_channels() -> u16 {
    2
}

fn default_accumulator_headroom() -> usize {
    4
}

fn default_callback_scratch_frames() -> usize {
    4096
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            magnitude_ceiling: default_magnitude_ceiling(),
            max_window_samples: default_max_window_samples(),
            history_capacity: default_history_capacity(),
            settle_delay_ms: default_settle_delay_ms(),
            preferred_channels: default_preferred_channels(),
            sample_rate: None,
            accumulator_headroom: default_accumulator_headroom(),
            callback_scratch_frames: default_callback_scratch_frames(),
            device_name: None,
        }
    }
}

impl CaptureSettings {
    /// Parse settings from a JSON document and validate them
    pub fn from_json_str(json: &str) -> Result<Self, CaptureError> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| CaptureError::InvalidConfiguration(format!("settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and validate a JSON settings file
    pub fn from_path(path: &Path) -> Result<Self, CaptureError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if !(self.magnitude_ceiling.is_finite() && self.magnitude_ceiling > 0.0) {
            return Err(CaptureError::InvalidConfiguration(format!(
                "magnitude ceiling must be positive, got {}",
                self.magnitude_ceiling
            )));
        }
        check_window(self.max_window_samples, "maximum window")?;
        if self.history_capacity == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "history capacity must be at least 1".to_string(),
            ));
        }
        if self.preferred_channels == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "preferred channel count must be at least 1".to_string(),
            ));
        }
        if self.accumulator_headroom == 0 || self.callback_scratch_frames == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "accumulator headroom and callback scratch must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
