use std::collections::VecDeque;

/// Fixed-capacity window of `(time, value)` samples; the oldest sample is dropped
/// once the window is full.
#[derive(Debug, Clone)]
pub struct TimeSeriesWindow {
    capacity: usize,
    samples: VecDeque<(f64, f64)>,
}

impl TimeSeriesWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, time: f64, value: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((time, value));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_time(&self) -> Option<f64> {
        self.samples.front().map(|s| s.0)
    }

    pub fn last_time(&self) -> Option<f64> {
        self.samples.back().map(|s| s.0)
    }

    pub fn time(&self, index: usize) -> f64 {
        self.samples[index].0
    }

    pub fn value(&self, index: usize) -> f64 {
        self.samples[index].1
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples.iter().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
