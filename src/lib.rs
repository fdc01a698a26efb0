//! Microphone Spectrum Library
//!
//! Captures live microphone audio, mixes it to mono and turns overlapping
//! windows of it into frequency-magnitude snapshots for visualizers.
//!
//! The real-time callback only appends samples; a dedicated analysis
//! thread runs the FFT and publishes the latest [`audio::SpectrumSnapshot`]
//! for readers such as a render loop.

pub mod audio;
pub mod controller;
pub mod state;

pub use audio::{CaptureConfiguration, CaptureError, CaptureSettings, ErrorKind, SpectrumSnapshot};
pub use controller::CaptureController;
pub use state::{CaptureOutputs, CaptureSessionState};
