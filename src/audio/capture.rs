//! Hardware capture session and the real-time input callback
//!
//! The platform layer is reached through [`AudioHost`] / [`InputUnit`]. Each
//! host hands delivered frames to a [`CaptureSink`], which mixes them to mono
//! and appends them to the shared [`SampleAccumulator`]. Nothing in the sink's
//! steady-state path allocates, logs or waits on anything but the
//! accumulator's lock.

use super::{AnalysisWaker, CaptureError, PermissionOracle, SampleAccumulator};
use cpal::SampleFormat;
use std::sync::Arc;

/// Called from the host when the stream fails after it was opened
pub type FaultHook = Arc<dyn Fn(CaptureError) + Send + Sync>;

/// What the caller would like the device to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Channels to request before falling back to mono
    pub preferred_channels: u16,

    /// Sample rate to request; 48 kHz, then 44.1 kHz, then the device
    /// maximum are tried when unset or unsupported
    pub sample_rate: Option<u32>,

    /// Input device name; `None` selects the default input device
    pub device_name: Option<String>,

    /// Frames mixed down per chunk inside the callback
    pub scratch_frames: usize,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            preferred_channels: 2,
            sample_rate: None,
            device_name: None,
            scratch_frames: 4096,
        }
    }
}

/// One supported configuration range advertised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub sample_format: SampleFormat,
}

impl From<&cpal::SupportedStreamConfigRange> for DeviceFormat {
    fn from(range: &cpal::SupportedStreamConfigRange) -> Self {
        Self {
            channels: range.channels(),
            min_sample_rate: range.min_sample_rate().0,
            max_sample_rate: range.max_sample_rate().0,
            sample_format: range.sample_format(),
        }
    }
}

/// The stream format a session actually runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

impl NegotiatedFormat {
    /// Whether the callback averages several channels down to mono
    pub fn mixes_down(&self) -> bool {
        self.channels > 1
    }
}

/// Sample formats the callback knows how to convert to f32
pub(crate) fn is_convertible(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32
            | SampleFormat::F64
            | SampleFormat::I8
            | SampleFormat::I16
            | SampleFormat::I32
            | SampleFormat::U8
            | SampleFormat::U16
            | SampleFormat::U32
    )
}

/// Pick a stream format from the ranges a device supports.
///
/// Preference order: the preferred channel count as f32, the preferred
/// channel count in any convertible format, mono f32, mono in any format,
/// then anything convertible (its channels are averaged down).
pub fn negotiate_format(
    supported: &[DeviceFormat],
    request: &StreamRequest,
) -> Option<NegotiatedFormat> {
    let preferred = request.preferred_channels.max(1);
    let usable: Vec<&DeviceFormat> = supported
        .iter()
        .filter(|f| f.channels > 0 && is_convertible(f.sample_format))
        .collect();

    let tiers: [&dyn Fn(&DeviceFormat) -> bool; 5] = [
        &|f: &DeviceFormat| f.channels == preferred && f.sample_format == SampleFormat::F32,
        &|f: &DeviceFormat| f.channels == preferred,
        &|f: &DeviceFormat| f.channels == 1 && f.sample_format == SampleFormat::F32,
        &|f: &DeviceFormat| f.channels == 1,
        &|_: &DeviceFormat| true,
    ];

    for (tier, accepts) in tiers.iter().enumerate() {
        let candidates: Vec<&DeviceFormat> =
            usable.iter().copied().filter(|f| accepts(*f)).collect();
        let chosen = candidates
            .iter()
            .find(|f| {
                request
                    .sample_rate
                    .is_some_and(|r| (f.min_sample_rate..=f.max_sample_rate).contains(&r))
            })
            .or_else(|| candidates.first());

        if let Some(format) = chosen {
            if tier > 0 {
                log::warn!(
                    "Preferred {}-channel f32 input unavailable, \
                     falling back to {} channel(s) {:?}",
                    preferred,
                    format.channels,
                    format.sample_format
                );
            }
            return Some(NegotiatedFormat {
                channels: format.channels,
                sample_rate: choose_sample_rate(format, request.sample_rate),
                sample_format: format.sample_format,
            });
        }
    }

    None
}

fn choose_sample_rate(format: &DeviceFormat, requested: Option<u32>) -> u32 {
    requested
        .into_iter()
        .chain([48_000, 44_100])
        .find(|r| (format.min_sample_rate..=format.max_sample_rate).contains(r))
        .unwrap_or(format.max_sample_rate)
}

/// Frames as delivered by the platform
#[derive(Debug, Clone, Copy)]
pub enum CaptureBuffer<'a> {
    /// One buffer holding `channels` interleaved samples per frame
    Interleaved { samples: &'a [f32], channels: usize },

    /// One buffer per channel
    Planar(&'a [&'a [f32]]),
}

impl<'a> CaptureBuffer<'a> {
    /// Detect the layout of a platform buffer list.
    ///
    /// A single buffer is interleaved with `interleaved_channels` channels;
    /// several buffers are one channel each.
    pub fn from_buffer_list(
        buffers: &'a [&'a [f32]],
        interleaved_channels: usize,
    ) -> Option<Self> {
        match buffers {
            [] => None,
            [single] => Some(CaptureBuffer::Interleaved {
                samples: *single,
                channels: interleaved_channels,
            }),
            planes => Some(CaptureBuffer::Planar(planes)),
        }
    }
}

/// Result of one callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Mono frames appended to the accumulator
    Delivered(usize),

    /// No buffer was delivered
    NoData,

    /// The buffer was inconsistent; whatever whole frames it held were kept
    Malformed(usize),
}

/// Real-time side of the pipeline, moved into the platform callback.
pub struct CaptureSink {
    accumulator: Arc<SampleAccumulator>,
    waker: AnalysisWaker,
    window_samples: usize,
    scratch: Vec<f32>,
}

impl CaptureSink {
    pub fn new(
        accumulator: Arc<SampleAccumulator>,
        waker: AnalysisWaker,
        window_samples: usize,
        scratch_frames: usize,
    ) -> Self {
        Self {
            accumulator,
            waker,
            window_samples,
            scratch: vec![0.0; scratch_frames.max(1)],
        }
    }

    /// Entry point for hosts that hand over f32 buffer lists.
    pub fn deliver(&mut self, buffer: Option<CaptureBuffer<'_>>) -> CallbackStatus {
        match buffer {
            None => CallbackStatus::NoData,
            Some(CaptureBuffer::Interleaved { samples, channels }) => {
                self.push_interleaved(samples, channels)
            }
            Some(CaptureBuffer::Planar(planes)) => self.push_planar(planes),
        }
    }

    /// Mix interleaved frames of any cpal sample type down to mono.
    pub fn push_interleaved<T>(&mut self, data: &[T], channels: usize) -> CallbackStatus
    where
        T: cpal::Sample,
        f32: cpal::FromSample<T>,
    {
        if channels == 0 {
            return CallbackStatus::Malformed(0);
        }
        if data.is_empty() {
            return CallbackStatus::NoData;
        }

        let frames = data.len() / channels;
        let whole = &data[..frames * channels];
        let chunk_frames = self.scratch.len();
        let scale = 1.0 / channels as f32;

        for chunk in whole.chunks(chunk_frames * channels) {
            let n = chunk.len() / channels;
            for (slot, frame) in self.scratch[..n].iter_mut().zip(chunk.chunks_exact(channels)) {
                let sum: f32 = frame
                    .iter()
                    .map(|&s| <f32 as cpal::Sample>::from_sample(s))
                    .sum();
                *slot = sum * scale;
            }
            self.forward(n);
        }

        if frames * channels == data.len() {
            CallbackStatus::Delivered(frames)
        } else {
            CallbackStatus::Malformed(frames)
        }
    }

    /// Mix one-buffer-per-channel frames down to mono.
    pub fn push_planar(&mut self, planes: &[&[f32]]) -> CallbackStatus {
        let Some(frames) = planes.iter().map(|p| p.len()).min() else {
            return CallbackStatus::Malformed(0);
        };
        let consistent = planes.iter().all(|p| p.len() == frames);
        if frames == 0 {
            return if consistent {
                CallbackStatus::NoData
            } else {
                CallbackStatus::Malformed(0)
            };
        }

        let chunk_frames = self.scratch.len();
        let scale = 1.0 / planes.len() as f32;
        let mut offset = 0;
        while offset < frames {
            let n = chunk_frames.min(frames - offset);
            for (i, slot) in self.scratch[..n].iter_mut().enumerate() {
                let sum: f32 = planes.iter().map(|p| p[offset + i]).sum();
                *slot = sum * scale;
            }
            self.forward(n);
            offset += n;
        }

        if consistent {
            CallbackStatus::Delivered(frames)
        } else {
            CallbackStatus::Malformed(frames)
        }
    }

    fn forward(&self, frames: usize) {
        let buffered = self.accumulator.append(&self.scratch[..frames]);
        if buffered >= self.window_samples {
            self.waker.wake();
        }
    }
}

/// Platform audio subsystem able to open an input unit
pub trait AudioHost: Send + Sync {
    /// Open and configure an input unit with `sink` registered as its
    /// callback. The unit must not deliver frames before `start`.
    fn open_input(
        &self,
        request: &StreamRequest,
        sink: CaptureSink,
        on_fault: FaultHook,
    ) -> Result<Box<dyn InputUnit>, CaptureError>;
}

/// An opened hardware input
pub trait InputUnit: Send {
    fn format(&self) -> NegotiatedFormat;

    /// Begin rendering; failures surface as `InvalidAudioFormat`
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Halt rendering and release the hardware. Idempotent.
    fn stop(&mut self);
}

/// Exclusive owner of the opened input unit
pub struct HardwareCaptureSession {
    unit: Box<dyn InputUnit>,
    running: bool,
}

impl HardwareCaptureSession {
    /// Ask for microphone permission, then open the host's input unit with
    /// `sink` as its real-time callback.
    pub async fn open(
        host: &dyn AudioHost,
        permission: &dyn PermissionOracle,
        request: &StreamRequest,
        sink: CaptureSink,
        on_fault: FaultHook,
    ) -> Result<Self, CaptureError> {
        if !permission.request_microphone_permission().await {
            log::warn!("Microphone permission denied");
            return Err(CaptureError::PermissionDenied);
        }

        let unit = host.open_input(request, sink, on_fault)?;
        let format = unit.format();
        log::info!(
            "Capture session opened: {} Hz, {} channel(s), {:?}{}",
            format.sample_rate,
            format.channels,
            format.sample_format,
            if format.mixes_down() { ", mixed to mono" } else { "" }
        );

        Ok(Self {
            unit,
            running: false,
        })
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.unit.format()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.running {
            return Ok(());
        }
        self.unit.start().map_err(|e| match e {
            CaptureError::InvalidAudioFormat(_) => e,
            other => CaptureError::InvalidAudioFormat(other.to_string()),
        })?;
        self.running = true;
        Ok(())
    }

    /// Halt and dispose the unit. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.running {
            log::info!("Capture session stopping");
        }
        self.unit.stop();
        self.running = false;
    }
}

impl Drop for HardwareCaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(window: usize, scratch: usize) -> (CaptureSink, Arc<SampleAccumulator>) {
        let accumulator = Arc::new(SampleAccumulator::with_capacity(256));
        let sink =
            CaptureSink::new(accumulator.clone(), AnalysisWaker::detached(), window, scratch);
        (sink, accumulator)
    }

    fn drained(acc: &SampleAccumulator) -> Vec<f32> {
        acc.try_drain_window(acc.len(), acc.len()).unwrap_or_default()
    }

    fn range(channels: u16, format: SampleFormat) -> DeviceFormat {
        DeviceFormat {
            channels,
            min_sample_rate: 8_000,
            max_sample_rate: 96_000,
            sample_format: format,
        }
    }

    #[test]
    fn interleaved_stereo_is_averaged() {
        let (mut sink, acc) = sink(1024, 16);
        let status = sink.deliver(Some(CaptureBuffer::Interleaved {
            samples: &[1.0, 0.0, 0.5, 0.5, -1.0, 1.0],
            channels: 2,
        }));
        assert_eq!(status, CallbackStatus::Delivered(3));
        assert_eq!(drained(&acc), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn planar_stereo_is_averaged() {
        let (mut sink, acc) = sink(1024, 16);
        let left: &[f32] = &[1.0, 0.5, -1.0];
        let right: &[f32] = &[0.0, 0.5, 1.0];
        let planes = [left, right];
        let buffer = CaptureBuffer::from_buffer_list(&planes, 1).unwrap();
        assert_eq!(sink.deliver(Some(buffer)), CallbackStatus::Delivered(3));
        assert_eq!(drained(&acc), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn large_buffers_are_processed_in_scratch_chunks() {
        let (mut sink, acc) = sink(1024, 4);
        let samples: Vec<f32> = (0..22).map(|i| i as f32).collect();
        assert_eq!(sink.push_interleaved(&samples, 2), CallbackStatus::Delivered(11));
        let mono = drained(&acc);
        assert_eq!(mono.len(), 11);
        assert_eq!(mono[0], 0.5);
        assert_eq!(mono[10], 20.5);
    }

    #[test]
    fn integer_samples_are_converted() {
        let (mut sink, acc) = sink(1024, 16);
        assert_eq!(sink.push_interleaved(&[i16::MAX, i16::MAX], 1), CallbackStatus::Delivered(2));
        let mono = drained(&acc);
        assert!(mono.iter().all(|&v| (v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn missing_or_malformed_buffers_are_tolerated() {
        let (mut sink, acc) = sink(1024, 16);
        assert_eq!(sink.deliver(None), CallbackStatus::NoData);
        assert_eq!(
            sink.deliver(Some(CaptureBuffer::Interleaved { samples: &[1.0], channels: 0 })),
            CallbackStatus::Malformed(0)
        );
        assert_eq!(
            sink.deliver(Some(CaptureBuffer::Interleaved {
                samples: &[1.0, 1.0, 1.0],
                channels: 2
            })),
            CallbackStatus::Malformed(1)
        );
        let short: &[f32] = &[1.0];
        let long: &[f32] = &[1.0, 1.0];
        assert_eq!(sink.push_planar(&[short, long]), CallbackStatus::Malformed(1));
        assert_eq!(sink.push_planar(&[]), CallbackStatus::Malformed(0));
        assert!(CaptureBuffer::from_buffer_list(&[], 2).is_none());
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn negotiation_prefers_stereo_f32() {
        let supported = [
            range(1, SampleFormat::F32),
            range(2, SampleFormat::I16),
            range(2, SampleFormat::F32),
        ];
        let format = negotiate_format(&supported, &StreamRequest::default()).unwrap();
        assert_eq!(format.channels, 2);
        assert_eq!(format.sample_format, SampleFormat::F32);
        assert_eq!(format.sample_rate, 48_000);
        assert!(format.mixes_down());
    }

    #[test]
    fn negotiation_falls_back_to_mono() {
        let supported = [range(1, SampleFormat::I16), range(1, SampleFormat::F32)];
        let format = negotiate_format(&supported, &StreamRequest::default()).unwrap();
        assert_eq!(format.channels, 1);
        assert_eq!(format.sample_format, SampleFormat::F32);
        assert!(!format.mixes_down());
    }

    #[test]
    fn negotiation_accepts_wider_layouts_and_honours_rate() {
        let supported = [DeviceFormat {
            channels: 6,
            min_sample_rate: 44_100,
            max_sample_rate: 44_100,
            sample_format: SampleFormat::I32,
        }];
        let request = StreamRequest {
            sample_rate: Some(22_050),
            ..StreamRequest::default()
        };
        let format = negotiate_format(&supported, &request).unwrap();
        assert_eq!(format.channels, 6);
        assert_eq!(format.sample_rate, 44_100);

        let request = StreamRequest {
            sample_rate: Some(16_000),
            ..StreamRequest::default()
        };
        let format = negotiate_format(&[range(2, SampleFormat::F32)], &request).unwrap();
        assert_eq!(format.sample_rate, 16_000);
    }

    #[test]
    fn negotiation_fails_without_convertible_formats() {
        assert!(negotiate_format(&[], &StreamRequest::default()).is_none());
        let unsupported = [range(2, SampleFormat::I64)];
        assert!(negotiate_format(&unsupported, &StreamRequest::default()).is_none());
    }
}
