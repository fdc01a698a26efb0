//! Sample buffers shared between the capture callback and the analysis worker

use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of mono samples fed by the real-time callback.
///
/// Every method holds the lock only for the copy itself; allocation and
/// analysis happen outside it.
pub struct SampleAccumulator {
    samples: Mutex<VecDeque<f32>>,
}

impl SampleAccumulator {
    /// Create an accumulator with room for `capacity` samples before growing
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append samples in delivery order, returning the buffered length
    pub fn append(&self, data: &[f32]) -> usize {
        let mut samples = self.samples.lock();
        samples.extend(data);
        samples.len()
    }

    /// Copy out the oldest `window` samples and retire `stride` of them.
    ///
    /// Returns `None` until at least `window` samples are buffered.
    pub fn try_drain_window(&self, window: usize, stride: usize) -> Option<Vec<f32>> {
        let mut out = Vec::with_capacity(window);
        self.drain_window_into(&mut out, window, stride)
            .then_some(out)
    }

    /// Same as [`try_drain_window`](Self::try_drain_window) but reuses `out`.
    ///
    /// `out` is cleared and refilled; returns `false` (leaving `out` empty)
    /// when not enough samples are buffered.
    pub fn drain_window_into(&self, out: &mut Vec<f32>, window: usize, stride: usize) -> bool {
        out.clear();
        let mut samples = self.samples.lock();
        if window == 0 || samples.len() < window {
            return false;
        }

        let (front, back) = samples.as_slices();
        if front.len() >= window {
            out.extend_from_slice(&front[..window]);
        } else {
            out.extend_from_slice(front);
            out.extend_from_slice(&back[..window - front.len()]);
        }

        let retire = stride.min(samples.len());
        samples.drain(..retire);
        true
    }

    /// Drop the oldest complete windows so at most `keep` remain pending.
    ///
    /// Returns the number of samples discarded.
    pub fn skip_backlog(&self, window: usize, stride: usize, keep: usize) -> usize {
        if window == 0 || stride == 0 {
            return 0;
        }
        let mut samples = self.samples.lock();
        if samples.len() < window {
            return 0;
        }
        let pending = (samples.len() - window) / stride + 1;
        if pending <= keep.max(1) {
            return 0;
        }
        let discard = (pending - keep.max(1)) * stride;
        samples.drain(..discard);
        discard
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Circular buffer of the most recently analysed raw samples
#[derive(Debug, Clone)]
pub struct RawWaveformHistory {
    samples: Vec<f32>,
    write_pos: usize,
    len: usize,
}

impl RawWaveformHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            write_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push samples, evicting the oldest once full
    pub fn push_samples(&mut self, data: &[f32]) {
        let capacity = self.capacity();
        // Only the tail can survive a push larger than the ring.
        let data = &data[data.len().saturating_sub(capacity)..];
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % capacity;
        }
        self.len = (self.len + data.len()).min(capacity);
    }

    /// The retained samples, oldest first
    pub fn to_vec(&self) -> Vec<f32> {
        let capacity = self.capacity();
        let start = (self.write_pos + capacity - self.len) % capacity;
        (0..self.len)
            .map(|i| self.samples[(start + i) % capacity])
            .collect()
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn drain_waits_for_a_full_window() {
        let acc = SampleAccumulator::with_capacity(64);
        acc.append(&ramp(15));
        assert!(acc.try_drain_window(16, 4).is_none());
        assert_eq!(acc.len(), 15);
    }

    #[test]
    fn drain_copies_window_and_retires_stride() {
        let acc = SampleAccumulator::with_capacity(64);
        acc.append(&ramp(10));
        let len = acc.append(&ramp(10));
        assert_eq!(len, 20);

        let window = acc.try_drain_window(16, 4).unwrap();
        assert_eq!(window.len(), 16);
        assert_eq!(&window[..10], ramp(10).as_slice());
        assert_eq!(acc.len(), 16);

        // Overlap: the next window starts `stride` samples later.
        let next = acc.try_drain_window(16, 4).unwrap();
        assert_eq!(next[0], 4.0);
        assert_eq!(acc.len(), 12);
        assert!(acc.try_drain_window(16, 4).is_none());
    }

    #[test]
    fn stride_larger_than_buffer_retires_everything() {
        let acc = SampleAccumulator::with_capacity(16);
        acc.append(&ramp(12));
        let window = acc.try_drain_window(8, 32).unwrap();
        assert_eq!(window.len(), 8);
        assert!(acc.is_empty());
    }

    #[test]
    fn drain_handles_wrapped_storage() {
        let acc = SampleAccumulator::with_capacity(8);
        acc.append(&ramp(8));
        acc.try_drain_window(8, 6).unwrap();
        acc.append(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);

        let window = acc.try_drain_window(8, 8).unwrap();
        assert_eq!(window, vec![6.0, 7.0, 100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
    }

    #[test]
    fn skip_backlog_keeps_newest_windows() {
        let acc = SampleAccumulator::with_capacity(64);
        acc.append(&ramp(40));
        // window 16, stride 8: windows start at 0, 8, 16, 24 -> 4 pending
        assert_eq!(acc.skip_backlog(16, 8, 2), 16);
        let window = acc.try_drain_window(16, 8).unwrap();
        assert_eq!(window[0], 16.0);
        assert_eq!(acc.skip_backlog(16, 8, 2), 0);
    }

    #[test]
    fn clear_drops_everything() {
        let acc = SampleAccumulator::with_capacity(8);
        acc.append(&ramp(5));
        acc.clear();
        assert!(acc.is_empty());
    }

    #[test]
    fn history_returns_samples_oldest_first() {
        let mut history = RawWaveformHistory::new(8);
        history.push_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(history.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn history_evicts_oldest_when_full() {
        let mut history = RawWaveformHistory::new(5);
        history.push_samples(&[1.0, 2.0, 3.0]);
        history.push_samples(&[4.0, 5.0, 6.0]);
        assert_eq!(history.to_vec(), vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn history_keeps_tail_of_oversized_push() {
        let mut history = RawWaveformHistory::new(4);
        history.push_samples(&ramp(10));
        assert_eq!(history.to_vec(), vec![6.0, 7.0, 8.0, 9.0]);
        history.clear();
        assert!(history.is_empty());
    }
}
