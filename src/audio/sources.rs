//! cpal-backed input host and input device enumeration

use super::capture::{is_convertible, negotiate_format};
use super::{
    AudioHost, CaptureError, CaptureSink, DeviceFormat, FaultHook, InputUnit, NegotiatedFormat,
    StreamRequest,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Input device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    /// Device name, usable as `CaptureSettings::device_name`
    pub name: String,

    /// Whether this is the host's default input device
    pub is_default: bool,

    /// Largest channel count among the device's convertible formats
    pub max_channels: u16,
}

/// Audio source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to enumerate devices: {0}")]
    EnumerationError(String),
}

/// List input devices (microphones) on the default host
pub fn list_input_sources() -> Result<Vec<InputSource>, SourceError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| SourceError::EnumerationError(e.to_string()))?;

    let mut sources = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        let max_channels = device
            .supported_input_configs()
            .map(|configs| {
                configs
                    .filter(|c| is_convertible(c.sample_format()))
                    .map(|c| c.channels())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        sources.push(InputSource {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            max_channels,
        });
    }

    Ok(sources)
}

/// Commands sent to the capture thread
enum UnitCommand {
    Start(mpsc::Sender<Result<(), CaptureError>>),
    Stop,
}

/// [`AudioHost`] backed by cpal's default host.
///
/// `cpal::Stream` is not `Send`, so every stream lives on its own
/// `audio-capture` thread and is driven through a command channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn open_input(
        &self,
        request: &StreamRequest,
        sink: CaptureSink,
        on_fault: FaultHook,
    ) -> Result<Box<dyn InputUnit>, CaptureError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let request = request.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(request, sink, on_fault, command_rx, ready_tx))
            .map_err(|e| {
                CaptureError::InvalidAudioFormat(format!("cannot spawn capture thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(format)) => Ok(Box::new(CpalInputUnit {
                command_tx,
                thread_handle: Some(handle),
                format,
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::InvalidAudioFormat(
                    "capture thread exited during setup".to_string(),
                ))
            }
        }
    }
}

/// Input unit whose stream is owned by a dedicated thread
struct CpalInputUnit {
    command_tx: mpsc::Sender<UnitCommand>,
    thread_handle: Option<JoinHandle<()>>,
    format: NegotiatedFormat,
}

impl InputUnit for CpalInputUnit {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(UnitCommand::Start(reply_tx))
            .map_err(|_| CaptureError::InvalidAudioFormat("capture thread is gone".to_string()))?;
        reply_rx.recv().map_err(|_| {
            CaptureError::InvalidAudioFormat("capture thread exited while starting".to_string())
        })?
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(UnitCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalInputUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::InvalidAudioFormat(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                CaptureError::InvalidAudioFormat(format!("input device not found: {}", name))
            }),
        None => host.default_input_device().ok_or_else(|| {
            CaptureError::InvalidAudioFormat("no input device available".to_string())
        }),
    }
}

/// Open the device, then serve start/stop commands until told to stop
fn run_capture_thread(
    request: StreamRequest,
    sink: CaptureSink,
    on_fault: FaultHook,
    command_rx: mpsc::Receiver<UnitCommand>,
    ready_tx: mpsc::SyncSender<Result<NegotiatedFormat, CaptureError>>,
) {
    let stream = match open_stream(&request, sink, on_fault) {
        Ok((stream, format)) => {
            let _ = ready_tx.send(Ok(format));
            stream
        }
        Err(e) => {
            log::error!("Failed to open input stream: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    loop {
        match command_rx.recv() {
            Ok(UnitCommand::Start(reply)) => {
                let result = stream
                    .play()
                    .map_err(|e| CaptureError::InvalidAudioFormat(e.to_string()));
                if result.is_ok() {
                    log::info!("Audio capture started");
                }
                let _ = reply.send(result);
            }
            Ok(UnitCommand::Stop) => {
                log::info!("Audio capture stopping");
                break;
            }
            Err(_) => {
                log::info!("Audio capture channel disconnected");
                break;
            }
        }
    }

    if let Err(e) = stream.pause() {
        log::warn!("Failed to pause input stream: {}", e);
    }
    drop(stream);
}

fn open_stream(
    request: &StreamRequest,
    sink: CaptureSink,
    on_fault: FaultHook,
) -> Result<(cpal::Stream, NegotiatedFormat), CaptureError> {
    let host = cpal::default_host();
    let device = select_device(&host, request.device_name.as_deref())?;
    log::info!(
        "Using audio input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported: Vec<DeviceFormat> = device
        .supported_input_configs()
        .map_err(|e| CaptureError::InvalidAudioFormat(e.to_string()))?
        .map(|range| DeviceFormat::from(&range))
        .collect();

    let format = negotiate_format(&supported, request).ok_or_else(|| {
        CaptureError::InvalidAudioFormat("no supported input format".to_string())
    })?;

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match format.sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, sink, on_fault),
        SampleFormat::F64 => build_stream::<f64>(&device, &config, sink, on_fault),
        SampleFormat::I8 => build_stream::<i8>(&device, &config, sink, on_fault),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, sink, on_fault),
        SampleFormat::I32 => build_stream::<i32>(&device, &config, sink, on_fault),
        SampleFormat::U8 => build_stream::<u8>(&device, &config, sink, on_fault),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, sink, on_fault),
        SampleFormat::U32 => build_stream::<u32>(&device, &config, sink, on_fault),
        other => {
            return Err(CaptureError::InvalidAudioFormat(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| CaptureError::InvalidAudioFormat(e.to_string()))?;

    Ok((stream, format))
}

/// Build the input stream for a given sample type
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut sink: CaptureSink,
    on_fault: FaultHook,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            sink.push_interleaved(data, channels);
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            on_fault(CaptureError::InvalidAudioFormat(err.to_string()));
        },
        None,
    )
}
