/// Converts raw elapsed-time signals into a per-job percentage that never
/// moves backwards.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage in `[0, 100]` for `raw_elapsed` seconds out of
    /// `total_duration`. Returns 0 while the total is unknown or not positive.
    pub fn update(&mut self, raw_elapsed: f64, total_duration: f64) -> f64 {
        if !total_duration.is_finite() || total_duration <= 0.0 {
            return 0.0;
        }
        let pct = if raw_elapsed.is_finite() {
            (100.0 * raw_elapsed / total_duration).clamp(0.0, 100.0)
        } else {
            0.0
        };
        if pct > self.last {
            self.last = pct;
        }
        self.last
    }
}
