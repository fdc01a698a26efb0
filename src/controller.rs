//! Capture controller: owns the pipeline and drives the session lifecycle
//!
//! ```text
//! Idle --start--> Starting --ok--> Running --stop--> Stopping --> Idle
//!                    |                |
//!                    +--error--> Failed <--stream fault
//! Running --reconfigure--> Stopping --> Starting --> Running
//! ```
//!
//! Teardown always halts the hardware before the analysis worker, and the
//! worker owns the analyzer, so no callback can run against a released
//! transform.

use crate::audio::{
    AnalysisWorker, AudioHost, CaptureConfiguration, CaptureError, CaptureSettings, CaptureSink,
    FaultHook, HardwareCaptureSession, NegotiatedFormat, PermissionOracle, SampleAccumulator,
    SpectralAnalyzer, SpectrumSnapshot, StreamRequest,
};
use crate::state::{CaptureOutputs, CaptureSessionState, SharedCapture};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;

/// Everything that exists only while capturing
struct Pipeline {
    session: HardwareCaptureSession,
    worker: AnalysisWorker,
    accumulator: Arc<SampleAccumulator>,
}

impl Pipeline {
    fn shutdown(&mut self) {
        self.session.stop();
        self.worker.stop();
        self.accumulator.clear();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Holds the live pipeline.
///
/// Shared with the fault hook so a failed stream is released right away
/// instead of at the next controller call.
#[derive(Default)]
struct PipelineSlot {
    pipeline: Mutex<Option<Pipeline>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineSlot {
    fn install(&self, pipeline: Pipeline) {
        *self.pipeline.lock() = Some(pipeline);
    }

    fn format(&self) -> Option<NegotiatedFormat> {
        self.pipeline.lock().as_ref().map(|p| p.session.format())
    }

    /// Shut the pipeline down on this thread and wait for any background
    /// teardown still in progress
    fn shutdown(&self) {
        let pipeline = self.pipeline.lock().take();
        if let Some(mut pipeline) = pipeline {
            pipeline.shutdown();
        }

        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            if handle.join().is_err() {
                log::error!("Capture teardown thread panicked");
            }
        }
    }

    /// Release the pipeline without blocking the caller.
    ///
    /// Fault hooks run on host threads that the hardware teardown joins, so
    /// the work is handed to a `capture-teardown` thread.
    fn shutdown_in_background(self: Arc<Self>) {
        let slot = self.clone();
        let spawned = thread::Builder::new()
            .name("capture-teardown".to_string())
            .spawn(move || {
                let pipeline = slot.pipeline.lock().take();
                if let Some(mut pipeline) = pipeline {
                    pipeline.shutdown();
                }
                log::info!("Released failed capture session");
            });

        match spawned {
            Ok(handle) => *self.reaper.lock() = Some(handle),
            Err(e) => log::error!("Cannot spawn capture teardown thread: {}", e),
        }
    }
}

/// Microphone-to-spectrum controller
pub struct CaptureController {
    host: Arc<dyn AudioHost>,
    permission: Arc<dyn PermissionOracle>,
    settings: CaptureSettings,
    configuration: CaptureConfiguration,
    shared: Arc<SharedCapture>,
    slot: Arc<PipelineSlot>,
}

impl CaptureController {
    /// Create an idle controller with the default configuration
    pub fn new(
        host: Arc<dyn AudioHost>,
        permission: Arc<dyn PermissionOracle>,
        settings: CaptureSettings,
    ) -> Self {
        let configuration = CaptureConfiguration::default();
        let shared = Arc::new(SharedCapture::new(
            configuration.band_count(),
            settings.history_capacity,
        ));
        Self {
            host,
            permission,
            settings,
            configuration,
            shared,
            slot: Arc::new(PipelineSlot::default()),
        }
    }

    /// Start capturing with `config`.
    ///
    /// While already running this behaves like [`reconfigure`](Self::reconfigure).
    /// Returns once the hardware has started and the settle delay elapsed;
    /// on error the controller is left in `Failed` with nothing running.
    pub async fn start(&mut self, config: CaptureConfiguration) -> Result<(), CaptureError> {
        if matches!(
            self.state(),
            CaptureSessionState::Running | CaptureSessionState::Starting
        ) {
            self.shared.set_state(CaptureSessionState::Stopping);
            self.teardown();
        }
        self.launch(config).await
    }

    /// Halt capture and return to `Idle`. A no-op when idle.
    pub fn stop(&mut self) {
        match self.state() {
            CaptureSessionState::Idle => {}
            CaptureSessionState::Failed(_) => {
                self.teardown();
                self.shared.reset_outputs(self.configuration.band_count());
                self.shared.set_state(CaptureSessionState::Idle);
            }
            _ => {
                self.shared.set_state(CaptureSessionState::Stopping);
                self.teardown();
                self.shared.reset_outputs(self.configuration.band_count());
                self.shared.set_state(CaptureSessionState::Idle);
            }
        }
    }

    /// Swap the analysis configuration.
    ///
    /// A running session is torn down and restarted with `config`. Otherwise
    /// whatever a failed session left behind is released, the configuration
    /// is stored for the next `start` and the snapshot is resized to its band
    /// count. A `Failed` state stays `Failed`.
    pub async fn reconfigure(&mut self, config: CaptureConfiguration) -> Result<(), CaptureError> {
        if self.state().is_running() {
            log::info!(
                "Reconfiguring capture: {} -> {} bands",
                self.configuration.band_count(),
                config.band_count()
            );
            self.shared.set_state(CaptureSessionState::Stopping);
            self.teardown();
            return self.launch(config).await;
        }

        self.teardown();
        self.configuration = config;
        self.shared.reset_outputs(config.band_count());
        Ok(())
    }

    pub fn state(&self) -> CaptureSessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureSessionState> {
        self.outputs().subscribe()
    }

    /// Read handle that stays valid across restarts
    pub fn outputs(&self) -> CaptureOutputs {
        CaptureOutputs {
            shared: self.shared.clone(),
        }
    }

    pub fn current_snapshot(&self) -> SpectrumSnapshot {
        self.outputs().current_snapshot()
    }

    pub fn raw_history(&self) -> Vec<f32> {
        self.outputs().raw_history()
    }

    pub fn last_error(&self) -> Option<CaptureError> {
        self.outputs().last_error()
    }

    pub fn configuration(&self) -> CaptureConfiguration {
        self.configuration
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Format negotiated with the device, while a session is open
    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.slot.format()
    }

    async fn launch(&mut self, config: CaptureConfiguration) -> Result<(), CaptureError> {
        self.teardown();
        self.configuration = config;
        self.shared.reset_outputs(config.band_count());
        self.shared.set_state(CaptureSessionState::Starting);

        let result = match self.build_pipeline(config).await {
            Ok(pipeline) => {
                self.slot.install(pipeline);
                self.shared.enter_running()
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                log::info!(
                    "Capture running: {} bands, window {}, stride {}",
                    config.band_count(),
                    config.window_samples(),
                    config.stride_samples()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start capture: {}", e);
                self.teardown();
                self.shared.fail(&e);
                Err(e)
            }
        }
    }

    /// Bring up analyzer, worker and hardware in that order.
    ///
    /// Any early return drops what was built so far, the session before the
    /// worker.
    async fn build_pipeline(
        &mut self,
        config: CaptureConfiguration,
    ) -> Result<Pipeline, CaptureError> {
        let analyzer = SpectralAnalyzer::new(&config, self.settings.magnitude_ceiling)?;
        let accumulator = Arc::new(SampleAccumulator::with_capacity(
            config.window_samples() * self.settings.accumulator_headroom,
        ));

        let publisher = self.shared.clone();
        let worker = AnalysisWorker::spawn(
            accumulator.clone(),
            analyzer,
            config.stride_samples(),
            move |snapshot, retired| publisher.publish(snapshot, retired),
        )?;

        let sink = CaptureSink::new(
            accumulator.clone(),
            worker.waker(),
            config.window_samples(),
            self.settings.callback_scratch_frames,
        );

        let generation = self.shared.begin_session();
        let fault_state = self.shared.clone();
        // Weak: the hook lives inside the pipeline the slot owns
        let slot: Weak<PipelineSlot> = Arc::downgrade(&self.slot);
        let on_fault: FaultHook = Arc::new(move |error| {
            if fault_state.report_fault(generation, error) {
                if let Some(slot) = slot.upgrade() {
                    slot.shutdown_in_background();
                }
            }
        });

        let mut session = HardwareCaptureSession::open(
            self.host.as_ref(),
            self.permission.as_ref(),
            &self.stream_request(),
            sink,
            on_fault,
        )
        .await?;
        session.start()?;

        tokio::time::sleep(self.settings.settle_delay()).await;

        Ok(Pipeline {
            session,
            worker,
            accumulator,
        })
    }

    fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            preferred_channels: self.settings.preferred_channels,
            sample_rate: self.settings.sample_rate,
            device_name: self.settings.device_name.clone(),
            scratch_frames: self.settings.callback_scratch_frames,
        }
    }

    fn teardown(&mut self) {
        self.slot.shutdown();
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.teardown();
    }
}
