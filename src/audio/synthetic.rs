//! Synthetic input host and test-signal generators
//!
//! Lets the whole pipeline run without a microphone: either a generator
//! renders a known signal into the callback at real-time pace, or the test
//! drives the callback by hand through a [`SyntheticFeed`].

use super::{
    AudioHost, CallbackStatus, CaptureBuffer, CaptureError, CaptureSink, FaultHook, InputUnit,
    NegotiatedFormat, StreamRequest,
};
use cpal::SampleFormat;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Plain sample generators, mono f32
pub mod signals {
    use super::PI;
    use rand::Rng;

    /// Sample rate used by the reference test signals
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Bin a pure tone lands in for a given window
    pub fn expected_bin(frequency: f32, sample_rate: u32, window_samples: usize) -> usize {
        (frequency * window_samples as f32 / sample_rate as f32).round() as usize
    }

    pub fn sine(frequency: f32, sample_rate: u32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    /// Sum of `(frequency, amplitude)` tones, rescaled to a 0.9 peak if it
    /// would clip
    pub fn multi_tone(tones: &[(f32, f32)], sample_rate: u32, len: usize) -> Vec<f32> {
        let mut wave = vec![0.0f32; len];
        for &(frequency, amplitude) in tones {
            for (i, sample) in wave.iter_mut().enumerate() {
                *sample += amplitude * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin();
            }
        }

        let peak = wave.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if peak > 1.0 {
            for sample in wave.iter_mut() {
                *sample = *sample / peak * 0.9;
            }
        }
        wave
    }

    /// Linear chirp from `start` to `end` Hz over `len` samples
    pub fn sweep(start: f32, end: f32, sample_rate: u32, amplitude: f32, len: usize) -> Vec<f32> {
        let duration = len as f32 / sample_rate as f32;
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let phase = 2.0 * PI * (start * t + (end - start) * t * t / (2.0 * duration));
                amplitude * phase.sin()
            })
            .collect()
    }

    pub fn silence(len: usize) -> Vec<f32> {
        vec![0.0; len]
    }

    /// Uniform white noise through a 4-pole low-pass, run forward then
    /// backward for zero phase, rescaled to an `amplitude` peak
    pub fn lowpass_noise(cutoff: f32, sample_rate: u32, amplitude: f32, len: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        let mut wave: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0f32..=1.0)).collect();

        let alpha = lowpass_alpha(cutoff, sample_rate);
        for _ in 0..LOWPASS_POLES {
            one_pole(wave.iter_mut(), alpha);
        }
        for _ in 0..LOWPASS_POLES {
            one_pole(wave.iter_mut().rev(), alpha);
        }

        let peak = wave.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if peak > 0.0 {
            for sample in wave.iter_mut() {
                *sample *= amplitude / peak;
            }
        }
        wave
    }

    pub(super) const LOWPASS_POLES: usize = 4;

    /// Smoothing factor of a one-pole low-pass at `cutoff` Hz
    pub(super) fn lowpass_alpha(cutoff: f32, sample_rate: u32) -> f32 {
        let cutoff = cutoff.clamp(0.0, sample_rate as f32 / 2.0);
        1.0 - (-2.0 * PI * cutoff / sample_rate as f32).exp()
    }

    fn one_pole<'a>(samples: impl Iterator<Item = &'a mut f32>, alpha: f32) {
        let mut state = 0.0f32;
        for sample in samples {
            state += alpha * (*sample - state);
            *sample = state;
        }
    }

    /// Single non-zero sample at `position`
    pub fn impulse(len: usize, position: usize, amplitude: f32) -> Vec<f32> {
        let mut samples = vec![0.0; len];
        if let Some(sample) = samples.get_mut(position) {
            *sample = amplitude;
        }
        samples
    }
}

/// Continuous signal rendered block by block by the synthetic host
#[derive(Debug, Clone, PartialEq)]
pub enum SyntheticSignal {
    Sine { frequency: f32, amplitude: f32 },
    MultiTone(Vec<(f32, f32)>),
    /// Sawtooth sweep that restarts every `period` seconds
    Sweep { start: f32, end: f32, amplitude: f32, period: f32 },
    /// White noise through a causal 4-pole low-pass; `amplitude` scales the
    /// white input
    LowpassNoise { cutoff: f32, amplitude: f32 },
    Silence,
}

impl SyntheticSignal {
    /// Value at absolute sample index `n`
    fn sample_at(&self, n: u64, sample_rate: u32) -> f32 {
        let rate = sample_rate as f64;
        let t = n as f64 / rate;
        match self {
            SyntheticSignal::Sine { frequency, amplitude } => {
                amplitude * phase_sin(*frequency as f64 * t)
            }
            SyntheticSignal::MultiTone(tones) => {
                let sum: f32 = tones
                    .iter()
                    .map(|&(frequency, amplitude)| amplitude * phase_sin(frequency as f64 * t))
                    .sum();
                let headroom: f32 = tones.iter().map(|&(_, a)| a.abs()).sum();
                if headroom > 1.0 {
                    sum / headroom * 0.9
                } else {
                    sum
                }
            }
            SyntheticSignal::Sweep { start, end, amplitude, period } => {
                let period = (*period as f64).max(1.0 / rate);
                let t = t % period;
                let cycles = *start as f64 * t + (*end - *start) as f64 * t * t / (2.0 * period);
                amplitude * phase_sin(cycles)
            }
            SyntheticSignal::LowpassNoise { .. } | SyntheticSignal::Silence => 0.0,
        }
    }
}

/// Renders a [`SyntheticSignal`] sample by sample, keeping filter state
struct SignalRenderer {
    signal: SyntheticSignal,
    sample_rate: u32,
    position: u64,
    rng: StdRng,
    alpha: f32,
    poles: [f32; signals::LOWPASS_POLES],
}

impl SignalRenderer {
    fn new(signal: SyntheticSignal, sample_rate: u32) -> Self {
        let alpha = match &signal {
            SyntheticSignal::LowpassNoise { cutoff, .. } => {
                signals::lowpass_alpha(*cutoff, sample_rate)
            }
            _ => 1.0,
        };
        Self {
            signal,
            sample_rate,
            position: 0,
            rng: StdRng::from_entropy(),
            alpha,
            poles: [0.0; signals::LOWPASS_POLES],
        }
    }

    fn next_sample(&mut self) -> f32 {
        let value = match self.signal {
            SyntheticSignal::LowpassNoise { amplitude, .. } => {
                let mut x = amplitude * self.rng.gen_range(-1.0f32..=1.0);
                for pole in self.poles.iter_mut() {
                    *pole += self.alpha * (x - *pole);
                    x = *pole;
                }
                x
            }
            _ => self.signal.sample_at(self.position, self.sample_rate),
        };
        self.position += 1;
        value
    }
}

fn phase_sin(cycles: f64) -> f32 {
    (2.0 * std::f64::consts::PI * cycles.fract()).sin() as f32
}

/// State shared between the host, its units and the feed
#[derive(Default)]
struct SyntheticShared {
    sink: Mutex<Option<CaptureSink>>,
    fault: Mutex<Option<FaultHook>>,
    running: AtomicBool,
    opens: AtomicUsize,
}

/// [`AudioHost`] that never touches hardware
pub struct SyntheticHost {
    signal: Option<SyntheticSignal>,
    sample_rate: u32,
    channels: u16,
    block_frames: usize,
    fail_open: bool,
    fail_start: bool,
    shared: Arc<SyntheticShared>,
}

impl SyntheticHost {
    /// Host that renders `signal` in real time once started
    pub fn generator(signal: SyntheticSignal, sample_rate: u32) -> Self {
        Self {
            signal: Some(signal),
            sample_rate,
            channels: 1,
            block_frames: 256,
            fail_open: false,
            fail_start: false,
            shared: Arc::new(SyntheticShared::default()),
        }
    }

    /// Host whose frames are pushed by hand through the returned feed
    pub fn manual(sample_rate: u32) -> (Self, SyntheticFeed) {
        let host = Self {
            signal: None,
            ..Self::generator(SyntheticSignal::Silence, sample_rate)
        };
        let feed = SyntheticFeed {
            shared: host.shared.clone(),
            channels: 1,
        };
        (host, feed)
    }

    /// Deliver the signal duplicated across `channels` interleaved channels
    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels.max(1);
        self
    }

    pub fn with_block_frames(mut self, block_frames: usize) -> Self {
        self.block_frames = block_frames.max(1);
        self
    }

    /// Refuse every stream format
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Open fine but fail to start rendering
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Number of units opened so far
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::Relaxed)
    }
}

impl AudioHost for SyntheticHost {
    fn open_input(
        &self,
        request: &StreamRequest,
        sink: CaptureSink,
        on_fault: FaultHook,
    ) -> Result<Box<dyn InputUnit>, CaptureError> {
        if self.fail_open {
            return Err(CaptureError::InvalidAudioFormat(
                "synthetic device refused the stream format".to_string(),
            ));
        }

        let format = NegotiatedFormat {
            channels: self.channels,
            sample_rate: request.sample_rate.unwrap_or(self.sample_rate),
            sample_format: SampleFormat::F32,
        };

        *self.shared.sink.lock() = Some(sink);
        *self.shared.fault.lock() = Some(on_fault);
        self.shared.running.store(false, Ordering::Release);
        self.shared.opens.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(SyntheticUnit {
            shared: self.shared.clone(),
            signal: self.signal.clone(),
            format,
            block_frames: self.block_frames,
            fail_start: self.fail_start,
            render_thread: None,
        }))
    }
}

struct SyntheticUnit {
    shared: Arc<SyntheticShared>,
    signal: Option<SyntheticSignal>,
    format: NegotiatedFormat,
    block_frames: usize,
    fail_start: bool,
    render_thread: Option<JoinHandle<()>>,
}

impl InputUnit for SyntheticUnit {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.fail_start {
            return Err(CaptureError::InvalidAudioFormat(
                "synthetic device failed to start".to_string(),
            ));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(signal) = self.signal.clone() else {
            return Ok(());
        };
        let shared = self.shared.clone();
        let format = self.format;
        let block_frames = self.block_frames;

        let handle = thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || render_loop(shared, signal, format, block_frames))
            .map_err(|e| CaptureError::InvalidAudioFormat(e.to_string()))?;
        self.render_thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.render_thread.take() {
            let _ = handle.join();
        }
        self.shared.sink.lock().take();
        self.shared.fault.lock().take();
    }
}

impl Drop for SyntheticUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    shared: Arc<SyntheticShared>,
    signal: SyntheticSignal,
    format: NegotiatedFormat,
    block_frames: usize,
) {
    let channels = format.channels as usize;
    let block_period = Duration::from_secs_f64(block_frames as f64 / format.sample_rate as f64);
    let mut interleaved = vec![0.0f32; block_frames * channels];
    let mut renderer = SignalRenderer::new(signal, format.sample_rate);

    while shared.running.load(Ordering::Acquire) {
        for frame in interleaved.chunks_exact_mut(channels) {
            frame.fill(renderer.next_sample());
        }
        if let Some(sink) = shared.sink.lock().as_mut() {
            sink.push_interleaved(&interleaved, channels);
        }
        thread::sleep(block_period);
    }
}

/// Hand-driven callback for a [`SyntheticHost::manual`] host
#[derive(Clone)]
pub struct SyntheticFeed {
    shared: Arc<SyntheticShared>,
    channels: usize,
}

impl SyntheticFeed {
    /// Treat pushed slices as interleaved with this many channels
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Whether a unit is open and holding the callback
    pub fn is_attached(&self) -> bool {
        self.shared.sink.lock().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Deliver interleaved samples through the callback, as the hardware
    /// would once the unit is started
    pub fn push(&self, samples: &[f32]) -> CallbackStatus {
        self.push_buffer(Some(CaptureBuffer::Interleaved {
            samples,
            channels: self.channels,
        }))
    }

    pub fn push_buffer(&self, buffer: Option<CaptureBuffer<'_>>) -> CallbackStatus {
        if !self.is_running() {
            return CallbackStatus::NoData;
        }
        match self.shared.sink.lock().as_mut() {
            Some(sink) => sink.deliver(buffer),
            None => CallbackStatus::NoData,
        }
    }

    /// Report a stream failure the way a host would
    pub fn fault(&self, error: CaptureError) {
        let hook = self.shared.fault.lock().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }
}
