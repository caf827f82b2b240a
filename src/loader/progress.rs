//! Whole-percent progress tracking for bulk loads.

/// Turns statement indices into whole-percent values, emitting a value only
/// when the rounded percentage changes.
///
/// Used inside the worker so a load of a million statements produces about
/// a hundred progress events instead of a million.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    total: usize,
    last: u8,
}

impl ProgressThrottle {
    pub fn new(total: usize) -> Self {
        Self { total, last: 0 }
    }

    /// Percentage before statement `index` runs, if it differs from the last one.
    pub fn observe(&mut self, index: usize) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let percent = ((index as f64 / self.total as f64) * 100.0).round() as u8;
        if percent == self.last {
            return None;
        }
        self.last = percent;
        Some(percent)
    }
}

/// Main-side progress sink: forwards strictly increasing values and closes
/// with 100 on success.
pub(crate) struct ProgressReporter<F> {
    callback: F,
    last: Option<u8>,
}

impl<F: FnMut(u8)> ProgressReporter<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback,
            last: None,
        }
    }

    pub(crate) fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        (self.callback)(percent);
    }

    pub(crate) fn finish(&mut self) {
        self.report(100);
    }
}
