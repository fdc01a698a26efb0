//! Spectral analysis: Hann window, forward FFT, non-mirrored magnitudes

use super::{CaptureConfiguration, CaptureError};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::ops::Deref;
use std::sync::Arc;

/// One published spectrum: `band_count` magnitudes in `[0, ceiling]`.
///
/// Cloning is cheap; the values are shared and never mutated after
/// construction, so readers always see a complete array.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSnapshot {
    bands: Arc<[f32]>,
}

impl SpectrumSnapshot {
    /// Zero-filled snapshot of the given length
    pub fn zeroed(band_count: usize) -> Self {
        Self {
            bands: vec![0.0; band_count].into(),
        }
    }

    pub fn from_vec(bands: Vec<f32>) -> Self {
        Self {
            bands: bands.into(),
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.bands
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.bands.to_vec()
    }

    /// Index and value of the strongest band
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.bands
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

impl Deref for SpectrumSnapshot {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.bands
    }
}

impl Default for SpectrumSnapshot {
    fn default() -> Self {
        Self::zeroed(0)
    }
}

/// Every `factor`-th band, in order; a factor of 0 is treated as 1
pub fn downsampled(snapshot: &SpectrumSnapshot, factor: usize) -> SpectrumSnapshot {
    SpectrumSnapshot::from_vec(snapshot.iter().copied().step_by(factor.max(1)).collect())
}

/// FFT analyzer bound to a single window size.
///
/// The plan and scratch buffers are created once; a different window size
/// needs a new analyzer.
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window_samples: usize,
    band_count: usize,
    magnitude_ceiling: f32,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralAnalyzer {
    /// Plan the transform for `config.window_samples()`.
    pub fn new(
        config: &CaptureConfiguration,
        magnitude_ceiling: f32,
    ) -> Result<Self, CaptureError> {
        let window_samples = config.window_samples();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(window_samples);
        if fft.len() != window_samples {
            return Err(CaptureError::TransformSetupFailed(format!(
                "planned length {} does not match window {}",
                fft.len(),
                window_samples
            )));
        }

        let scratch_len = fft.get_inplace_scratch_len();
        let mut window = Vec::new();
        let mut buffer = Vec::new();
        let mut scratch = Vec::new();
        window
            .try_reserve_exact(window_samples)
            .and_then(|_| buffer.try_reserve_exact(window_samples))
            .and_then(|_| scratch.try_reserve_exact(scratch_len))
            .map_err(|e| {
                CaptureError::TransformSetupFailed(format!(
                    "cannot allocate {}-point transform: {}",
                    window_samples, e
                ))
            })?;

        // Hann window
        window.extend((0..window_samples).map(|i| {
            0.5 * (1.0
                - (2.0 * std::f32::consts::PI * i as f32 / (window_samples - 1) as f32).cos())
        }));
        buffer.resize(window_samples, Complex::new(0.0, 0.0));
        scratch.resize(scratch_len, Complex::new(0.0, 0.0));

        log::debug!(
            "Planned {}-point FFT, {} bands, ceiling {}",
            window_samples,
            config.band_count(),
            magnitude_ceiling
        );

        Ok(Self {
            fft,
            window_samples,
            band_count: config.band_count(),
            magnitude_ceiling,
            window,
            buffer,
            scratch,
        })
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn magnitude_ceiling(&self) -> f32 {
        self.magnitude_ceiling
    }

    /// Turn one window of raw samples into a clamped magnitude spectrum.
    ///
    /// Only bins `0 .. window/2` are used: the upper half of a real
    /// signal's transform is the complex conjugate of the lower half.
    pub fn analyze(&mut self, samples: &[f32]) -> SpectrumSnapshot {
        if samples.len() < self.window_samples {
            return SpectrumSnapshot::zeroed(self.band_count);
        }

        for ((slot, &sample), &w) in self
            .buffer
            .iter_mut()
            .zip(samples.iter())
            .zip(self.window.iter())
        {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let unique_bins = self.window_samples / 2;
        let ceiling = self.magnitude_ceiling;
        let mut bands: Vec<f32> = self.buffer[..unique_bins]
            .iter()
            .take(self.band_count)
            .map(|c| clamp_magnitude(c.norm(), ceiling))
            .collect();
        bands.resize(self.band_count, 0.0);

        SpectrumSnapshot::from_vec(bands)
    }
}

fn clamp_magnitude(value: f32, ceiling: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer(window: usize, bands: usize, ceiling: f32) -> SpectralAnalyzer {
        let config = CaptureConfiguration::from_band_count_with_window(bands, window, window / 2)
            .unwrap();
        SpectralAnalyzer::new(&config, ceiling).unwrap()
    }

    fn sine(freq: f32, sample_rate: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn short_input_yields_zeroed_spectrum() {
        let mut analyzer = analyzer(1024, 256, 100.0);
        let spectrum = analyzer.analyze(&[0.5; 100]);
        assert_eq!(spectrum.len(), 256);
        assert!(spectrum.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn silence_produces_no_energy() {
        let mut analyzer = analyzer(512, 256, 100.0);
        let spectrum = analyzer.analyze(&[0.0; 512]);
        assert_eq!(spectrum.len(), 256);
        assert!(spectrum.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sine_peaks_at_expected_bin() {
        let window = 1024;
        let sample_rate = 44_100.0;
        let mut analyzer = analyzer(window, window / 2, 100.0);

        for freq in [200.0_f32, 440.0, 1000.0, 5000.0] {
            let spectrum = analyzer.analyze(&sine(freq, sample_rate, 0.1, window));
            let expected = (freq * window as f32 / sample_rate).round() as isize;
            let (peak, _) = spectrum.peak().unwrap();
            assert!(
                (peak as isize - expected).abs() <= 1,
                "{freq} Hz: expected bin {expected}, got {peak}"
            );
        }
    }

    #[test]
    fn tone_near_nyquist_is_not_mirrored_into_low_bins() {
        let window = 256;
        let mut analyzer = analyzer(window, window / 2, 1000.0);
        // bin 120 of 128 unique bins
        let spectrum = analyzer.analyze(&sine(120.0, window as f32, 0.5, window));

        let (peak, peak_value) = spectrum.peak().unwrap();
        assert!((peak as isize - 120).abs() <= 1);
        let low_max = spectrum[..100].iter().copied().fold(0.0f32, f32::max);
        assert!(low_max < peak_value * 0.01, "low bins carry {low_max}");
    }

    #[test]
    fn impulse_is_clamped_to_ceiling() {
        let window = 1024;
        let mut analyzer = analyzer(window, 256, 100.0);
        let mut samples = vec![0.0; window];
        samples[window / 2] = 500.0;

        let spectrum = analyzer.analyze(&samples);
        assert_eq!(spectrum.len(), 256);
        assert!(spectrum.iter().all(|&v| (0.0..=100.0).contains(&v)));
        assert_eq!(spectrum.peak().unwrap().1, 100.0);
    }

    #[test]
    fn output_length_matches_band_count() {
        let mut analyzer = analyzer(64, 5, 100.0);
        let spectrum = analyzer.analyze(&sine(3.0, 64.0, 1.0, 80));
        assert_eq!(spectrum.len(), 5);
    }

    #[test]
    fn nan_input_maps_to_zero() {
        assert_eq!(clamp_magnitude(f32::NAN, 100.0), 0.0);
        assert_eq!(clamp_magnitude(f32::INFINITY, 100.0), 100.0);
        assert_eq!(clamp_magnitude(42.0, 100.0), 42.0);
    }

    #[test]
    fn downsampled_keeps_every_nth_band() {
        let snapshot = SpectrumSnapshot::from_vec((0..10).map(|i| i as f32).collect());
        assert_eq!(downsampled(&snapshot, 3).to_vec(), vec![0.0, 3.0, 6.0, 9.0]);
        assert_eq!(downsampled(&snapshot, 0).len(), 10);
        assert_eq!(downsampled(&snapshot, 1), snapshot);
    }
}
