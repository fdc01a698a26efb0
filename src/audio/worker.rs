//! Analysis worker: the single consumer of the sample accumulator
//!
//! The capture callback never runs the FFT. It only unparks this thread,
//! and repeated wake-ups coalesce into one pending token, so at most one
//! window is analysed at a time and spectra come out in capture order.

use super::{CaptureError, SampleAccumulator, SpectralAnalyzer, SpectrumSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

/// Pending windows allowed before the oldest are skipped
pub const MAX_BACKLOG_WINDOWS: usize = 4;

/// Upper bound on how long the worker sleeps without a wake-up
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Handle the real-time callback uses to signal that a window is ready.
///
/// Waking is lock-free and never allocates.
#[derive(Debug, Clone, Default)]
pub struct AnalysisWaker {
    thread: Option<Thread>,
}

impl AnalysisWaker {
    /// A waker not attached to any worker; `wake` does nothing
    pub fn detached() -> Self {
        Self { thread: None }
    }

    pub fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.unpark();
        }
    }
}

/// Dedicated analysis thread owning the [`SpectralAnalyzer`].
///
/// The analyzer is dropped when the thread exits, so stopping the worker
/// after the hardware guarantees the callback never outlives the transform.
pub struct AnalysisWorker {
    stop: Arc<AtomicBool>,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
}

impl AnalysisWorker {
    /// Spawn the worker.
    ///
    /// `publish` receives every spectrum together with the raw samples the
    /// window retired from the accumulator.
    pub fn spawn<F>(
        accumulator: Arc<SampleAccumulator>,
        mut analyzer: SpectralAnalyzer,
        stride_samples: usize,
        mut publish: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnMut(SpectrumSnapshot, &[f32]) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("spectrum-analysis".to_string())
            .spawn(move || {
                let window_samples = analyzer.window_samples();
                let mut window = Vec::with_capacity(window_samples);

                while !stop_flag.load(Ordering::Acquire) {
                    let skipped = accumulator.skip_backlog(
                        window_samples,
                        stride_samples,
                        MAX_BACKLOG_WINDOWS,
                    );
                    if skipped > 0 {
                        log::debug!("Analysis fell behind, skipped {} samples", skipped);
                    }

                    if accumulator.drain_window_into(&mut window, window_samples, stride_samples) {
                        let spectrum = analyzer.analyze(&window);
                        let retired = stride_samples.min(window.len());
                        publish(spectrum, &window[..retired]);
                    } else {
                        thread::park_timeout(IDLE_WAIT);
                    }
                }
                log::debug!("Analysis worker exiting");
            })
            .map_err(|e| {
                CaptureError::TransformSetupFailed(format!("cannot spawn analysis thread: {}", e))
            })?;

        Ok(Self {
            stop,
            thread: handle.thread().clone(),
            handle: Some(handle),
        })
    }

    pub fn waker(&self) -> AnalysisWaker {
        AnalysisWaker {
            thread: Some(self.thread.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Request cancellation and wait for the in-flight window to finish.
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.thread.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Analysis worker panicked");
            }
        }
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureConfiguration;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn worker_analyses_windows_in_order() {
        let config = CaptureConfiguration::from_window_samples(16, 8).unwrap();
        let analyzer = SpectralAnalyzer::new(&config, 100.0).unwrap();
        let accumulator = Arc::new(SampleAccumulator::with_capacity(64));
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();

        let mut worker = AnalysisWorker::spawn(accumulator.clone(), analyzer, 8, move |s, raw| {
            sink.lock().push((s.len(), raw.to_vec()));
        })
        .unwrap();

        let ramp: Vec<f32> = (0..24).map(|i| i as f32).collect();
        accumulator.append(&ramp);
        worker.waker().wake();

        assert!(wait_for(|| published.lock().len() == 2));
        worker.stop();

        let published = published.lock();
        assert_eq!(published[0].0, 8);
        assert_eq!(published[0].1, (0..8).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(published[1].1, (8..16).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(accumulator.len(), 8);
    }

    #[test]
    fn stopped_worker_drains_nothing() {
        let config = CaptureConfiguration::from_window_samples(8, 8).unwrap();
        let analyzer = SpectralAnalyzer::new(&config, 100.0).unwrap();
        let accumulator = Arc::new(SampleAccumulator::with_capacity(32));
        let mut worker =
            AnalysisWorker::spawn(accumulator.clone(), analyzer, 8, |_, _| {}).unwrap();

        worker.stop();
        worker.stop();
        assert!(!worker.is_running());

        accumulator.append(&[0.0; 16]);
        worker.waker().wake();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(accumulator.len(), 16);
    }

    #[test]
    fn detached_waker_is_inert() {
        AnalysisWaker::detached().wake();
    }
}
