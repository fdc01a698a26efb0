//! Audio capture and analysis module

mod buffer;
mod capture;
mod config;
mod fft;
mod permission;
mod sources;
mod synthetic;
mod worker;

pub use buffer::{RawWaveformHistory, SampleAccumulator};
pub use capture::{
    negotiate_format, AudioHost, CallbackStatus, CaptureBuffer, CaptureSink, DeviceFormat,
    FaultHook, HardwareCaptureSession, InputUnit, NegotiatedFormat, StreamRequest,
};
pub use config::{CaptureConfiguration, CaptureSettings};
pub use fft::{downsampled, SpectralAnalyzer, SpectrumSnapshot};
pub use permission::{PermissionOracle, StaticPermission};
pub use sources::{list_input_sources, CpalHost, InputSource, SourceError};
pub use synthetic::{signals, SyntheticFeed, SyntheticHost, SyntheticSignal};
pub use worker::{AnalysisWaker, AnalysisWorker};

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by configuration, analysis setup and the capture session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Microphone permission denied: grant access in the system privacy settings")]
    PermissionDenied,

    #[error("Invalid capture configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Internal setup failure, transform context unavailable: {0}")]
    TransformSetupFailed(String),

    #[error("Audio device rejected the stream (busy or unsupported format): {0}")]
    InvalidAudioFormat(String),
}

/// Copyable discriminant of [`CaptureError`], kept in the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    InvalidConfiguration,
    TransformSetupFailed,
    InvalidAudioFormat,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::PermissionDenied => ErrorKind::PermissionDenied,
            CaptureError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            CaptureError::TransformSetupFailed(_) => ErrorKind::TransformSetupFailed,
            CaptureError::InvalidAudioFormat(_) => ErrorKind::InvalidAudioFormat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_distinguish_corrective_actions() {
        let denied = CaptureError::PermissionDenied.to_string();
        let format = CaptureError::InvalidAudioFormat("busy".into()).to_string();
        let setup = CaptureError::TransformSetupFailed("alloc".into()).to_string();

        assert!(denied.contains("permission"));
        assert!(format.contains("unsupported format"));
        assert!(setup.contains("Internal setup failure"));
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(CaptureError::PermissionDenied.kind(), ErrorKind::PermissionDenied);
        assert_eq!(
            CaptureError::InvalidConfiguration(String::new()).kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(
            CaptureError::TransformSetupFailed(String::new()).kind(),
            ErrorKind::TransformSetupFailed
        );
        assert_eq!(
            CaptureError::InvalidAudioFormat(String::new()).kind(),
            ErrorKind::InvalidAudioFormat
        );
    }
}
