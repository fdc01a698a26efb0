//! Capture session state and the outputs shared with readers

use crate::audio::{CaptureError, ErrorKind, RawWaveformHistory, SpectrumSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Transitions buffered per subscriber before the oldest are dropped
const TRANSITION_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of the capture controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CaptureSessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed(ErrorKind),
}

impl CaptureSessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, CaptureSessionState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CaptureSessionState::Failed(_))
    }
}

/// State written by the controller, the analysis worker and fault hooks
pub(crate) struct SharedCapture {
    state: Mutex<CaptureSessionState>,
    transitions: broadcast::Sender<CaptureSessionState>,
    snapshot: Mutex<SpectrumSnapshot>,
    history: Mutex<RawWaveformHistory>,
    /// Error of the most recent failure, kept until the next start
    last_error: Mutex<Option<CaptureError>>,
    /// Fault raised while the session was still starting
    pending_fault: Mutex<Option<CaptureError>>,
    /// Bumped for every hardware session so late faults from an old one are ignored
    generation: AtomicU64,
}

impl SharedCapture {
    pub(crate) fn new(band_count: usize, history_capacity: usize) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(CaptureSessionState::Idle),
            transitions,
            snapshot: Mutex::new(SpectrumSnapshot::zeroed(band_count)),
            history: Mutex::new(RawWaveformHistory::new(history_capacity)),
            last_error: Mutex::new(None),
            pending_fault: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> CaptureSessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: CaptureSessionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            log::info!("Capture state: {:?} -> {:?}", previous, next);
        }
        // No subscribers is fine
        let _ = self.transitions.send(next);
    }

    /// Enter `Failed` and remember the error
    pub(crate) fn fail(&self, error: &CaptureError) {
        *self.last_error.lock() = Some(error.clone());
        self.set_state(CaptureSessionState::Failed(error.kind()));
    }

    /// Zero the spectrum at `band_count` bands and empty the history
    pub(crate) fn reset_outputs(&self, band_count: usize) {
        *self.snapshot.lock() = SpectrumSnapshot::zeroed(band_count);
        self.history.lock().clear();
    }

    /// Called by the analysis worker for every window
    pub(crate) fn publish(&self, snapshot: SpectrumSnapshot, retired: &[f32]) {
        *self.snapshot.lock() = snapshot;
        self.history.lock().push_samples(retired);
    }

    /// Start a new hardware session and return its generation
    pub(crate) fn begin_session(&self) -> u64 {
        self.pending_fault.lock().take();
        self.last_error.lock().take();
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stream failure reported by a host.
    ///
    /// Returns `true` when this fault moved a running session to `Failed`,
    /// in which case the caller owns releasing the pipeline.
    pub(crate) fn report_fault(&self, generation: u64, error: CaptureError) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("Ignoring fault from a retired capture session: {}", error);
            return false;
        }

        let mut state = self.state.lock();
        match *state {
            CaptureSessionState::Starting => {
                log::warn!("Capture stream failed while starting: {}", error);
                *self.pending_fault.lock() = Some(error);
                false
            }
            CaptureSessionState::Running => {
                log::error!("Capture stream failed: {}", error);
                let next = CaptureSessionState::Failed(error.kind());
                *self.last_error.lock() = Some(error);
                *state = next;
                drop(state);
                let _ = self.transitions.send(next);
                true
            }
            _ => false,
        }
    }

    /// Move `Starting` to `Running`, unless a fault arrived while starting.
    ///
    /// The check and the transition happen under the state lock, so a fault
    /// lands either here or in `report_fault`'s running branch.
    pub(crate) fn enter_running(&self) -> Result<(), CaptureError> {
        let mut state = self.state.lock();
        if let Some(fault) = self.pending_fault.lock().take() {
            return Err(fault);
        }
        let previous = std::mem::replace(&mut *state, CaptureSessionState::Running);
        drop(state);

        log::info!("Capture state: {:?} -> {:?}", previous, CaptureSessionState::Running);
        let _ = self.transitions.send(CaptureSessionState::Running);
        Ok(())
    }
}

/// Cloneable read handle on what the capture pipeline produces.
///
/// Safe to poll from any thread, e.g. a render loop, while the controller
/// is being reconfigured.
#[derive(Clone)]
pub struct CaptureOutputs {
    pub(crate) shared: Arc<SharedCapture>,
}

impl CaptureOutputs {
    /// Latest spectrum, zeroed until the first window is analysed
    pub fn current_snapshot(&self) -> SpectrumSnapshot {
        self.shared.snapshot.lock().clone()
    }

    /// Recent mono samples, oldest first
    pub fn raw_history(&self) -> Vec<f32> {
        self.shared.history.lock().to_vec()
    }

    pub fn state(&self) -> CaptureSessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Error behind the current `Failed` state, if any
    pub fn last_error(&self) -> Option<CaptureError> {
        self.shared.last_error.lock().clone()
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureSessionState> {
        self.shared.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(bands: usize, history: usize) -> CaptureOutputs {
        CaptureOutputs {
            shared: Arc::new(SharedCapture::new(bands, history)),
        }
    }

    #[test]
    fn starts_idle_with_zeroed_snapshot() {
        let out = outputs(64, 16);
        assert_eq!(out.state(), CaptureSessionState::Idle);
        assert!(!out.is_running());
        assert_eq!(out.current_snapshot().len(), 64);
        assert!(out.current_snapshot().iter().all(|&v| v == 0.0));
        assert!(out.raw_history().is_empty());
    }

    #[test]
    fn publish_replaces_snapshot_and_extends_history() {
        let out = outputs(4, 6);
        out.shared
            .publish(SpectrumSnapshot::from_vec(vec![1.0, 2.0, 3.0, 4.0]), &[0.1, 0.2, 0.3, 0.4]);
        out.shared
            .publish(SpectrumSnapshot::from_vec(vec![4.0, 3.0, 2.0, 1.0]), &[0.5, 0.6, 0.7, 0.8]);

        assert_eq!(out.current_snapshot().to_vec(), vec![4.0, 3.0, 2.0, 1.0]);
        assert_eq!(out.raw_history(), vec![0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);

        out.shared.reset_outputs(8);
        assert_eq!(out.current_snapshot().len(), 8);
        assert!(out.raw_history().is_empty());
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let out = outputs(4, 4);
        let mut rx = out.subscribe();
        out.shared.set_state(CaptureSessionState::Starting);
        out.shared.set_state(CaptureSessionState::Running);

        assert_eq!(rx.recv().await.unwrap(), CaptureSessionState::Starting);
        assert_eq!(rx.recv().await.unwrap(), CaptureSessionState::Running);
    }

    #[test]
    fn faults_fail_only_the_current_running_session() {
        let out = outputs(4, 4);
        let first = out.shared.begin_session();
        out.shared.set_state(CaptureSessionState::Running);
        let second = out.shared.begin_session();

        assert!(!out
            .shared
            .report_fault(first, CaptureError::InvalidAudioFormat("old".into())));
        assert_eq!(out.state(), CaptureSessionState::Running);

        assert!(out
            .shared
            .report_fault(second, CaptureError::InvalidAudioFormat("unplugged".into())));
        assert_eq!(
            out.state(),
            CaptureSessionState::Failed(ErrorKind::InvalidAudioFormat)
        );
        assert!(matches!(
            out.last_error(),
            Some(CaptureError::InvalidAudioFormat(_))
        ));
    }

    #[test]
    fn fault_while_starting_blocks_entering_running() {
        let out = outputs(4, 4);
        let generation = out.shared.begin_session();
        out.shared.set_state(CaptureSessionState::Starting);
        assert!(!out
            .shared
            .report_fault(generation, CaptureError::InvalidAudioFormat("busy".into())));
        assert_eq!(out.state(), CaptureSessionState::Starting);

        assert!(matches!(
            out.shared.enter_running(),
            Err(CaptureError::InvalidAudioFormat(_))
        ));
        assert_eq!(out.state(), CaptureSessionState::Starting);
    }

    #[test]
    fn fault_after_entering_running_fails_the_session() {
        let out = outputs(4, 4);
        let generation = out.shared.begin_session();
        out.shared.set_state(CaptureSessionState::Starting);
        out.shared.enter_running().unwrap();
        assert_eq!(out.state(), CaptureSessionState::Running);

        assert!(out
            .shared
            .report_fault(generation, CaptureError::InvalidAudioFormat("gone".into())));
        assert!(out.state().is_failed());
    }

    #[test]
    fn state_serializes_for_frontends() {
        let json = serde_json::to_string(&CaptureSessionState::Failed(ErrorKind::PermissionDenied))
            .unwrap();
        assert_eq!(json, r#"{"Failed":"permission_denied"}"#);
    }
}
