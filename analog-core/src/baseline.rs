//! Resting-level calibration for analog probes.
//!
//! Before a probing run the host samples the idle sensor many times, takes the
//! median as the baseline and homes with `baseline + offset` as the trigger
//! level, so the configured offset is relative to whatever the sensor reads at
//! rest.

/// Readings collected per calibration by default.
pub const DEFAULT_BASELINE_SAMPLES: usize = 1024;

/// Spread of the collected readings.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Baseline {
    pub min: u16,
    pub q1: f32,
    pub median: f32,
    pub q3: f32,
    pub max: u16,
}

impl Baseline {
    /// Resting level: the median, truncated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn level(&self) -> u16 {
        self.median as u16
    }

    /// Trigger level for `analog_endstop_home`.
    #[must_use]
    pub fn threshold(&self, offset: u16) -> u16 {
        self.level().saturating_add(offset)
    }
}

/// Collects up to `N` readings and summarises them.
#[derive(Clone, Debug, Default)]
pub struct BaselineEstimator<const N: usize = DEFAULT_BASELINE_SAMPLES> {
    samples: heapless::Vec<u16, N>,
}

impl<const N: usize> BaselineEstimator<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: heapless::Vec::new(),
        }
    }

    /// Records a reading; returns `false` once the estimator is full.
    pub fn push(&mut self, value: u16) -> bool {
        self.samples.push(value).is_ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    /// Summarises the readings; needs at least two.
    ///
    /// Quartiles use the exclusive method: the `i`-th cut point sits at
    /// position `i * (n + 1) / 4` of the sorted data, linearly interpolated.
    #[must_use]
    pub fn finish(&self) -> Option<Baseline> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let data = sorted.as_slice();
        if data.len() < 2 {
            return None;
        }

        Some(Baseline {
            min: *data.first()?,
            q1: cut_point(data, 1),
            median: cut_point(data, 2),
            q3: cut_point(data, 3),
            max: *data.last()?,
        })
    }

    /// Discards the collected readings.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// Outer cut points clamp to the first/last pair and extrapolate, so `delta`
// may fall outside 0..=4.
#[allow(clippy::cast_precision_loss)]
fn cut_point(sorted: &[u16], quarter: i64) -> f32 {
    let len = i64::try_from(sorted.len()).unwrap_or(i64::MAX);
    let scaled = quarter * (len + 1);
    let index = (scaled / 4).clamp(1, len - 1);
    let delta = scaled - index * 4;
    let upper_index = usize::try_from(index).unwrap_or(1);
    let lower = f32::from(sorted[upper_index - 1]);
    let upper = f32::from(sorted[upper_index]);
    (lower * (4 - delta) as f32 + upper * delta as f32) / 4.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(values: &[u16]) -> BaselineEstimator<16> {
        let mut estimator = BaselineEstimator::new();
        for &value in values {
            assert!(estimator.push(value));
        }
        estimator
    }

    #[test]
    fn quartiles_match_exclusive_method() {
        // Reference: statistics.quantiles([1..=9], n=4) == [2.5, 5.0, 7.5]
        let baseline = estimator(&[9, 3, 1, 7, 5, 2, 8, 4, 6]).finish().expect("baseline");
        assert_eq!(baseline.min, 1);
        assert_eq!(baseline.max, 9);
        assert!((baseline.q1 - 2.5).abs() < f32::EPSILON);
        assert!((baseline.median - 5.0).abs() < f32::EPSILON);
        assert!((baseline.q3 - 7.5).abs() < f32::EPSILON);
    }

    #[test]
    fn level_truncates_the_median() {
        // statistics.quantiles([10, 11, 20, 21], n=4) == [10.25, 15.5, 20.75]
        let baseline = estimator(&[21, 10, 20, 11]).finish().expect("baseline");
        assert!((baseline.q1 - 10.25).abs() < f32::EPSILON);
        assert!((baseline.q3 - 20.75).abs() < f32::EPSILON);
        assert_eq!(baseline.level(), 15);
        assert_eq!(baseline.threshold(100), 115);
        assert_eq!(baseline.threshold(u16::MAX), u16::MAX);
    }

    #[test]
    fn needs_two_samples() {
        assert_eq!(estimator(&[]).finish(), None);
        assert_eq!(estimator(&[5]).finish(), None);
        // statistics.quantiles([5, 7], n=4) == [4.5, 6.0, 7.5]
        let baseline = estimator(&[5, 7]).finish().expect("baseline");
        assert!((baseline.q1 - 4.5).abs() < f32::EPSILON);
        assert!((baseline.q3 - 7.5).abs() < f32::EPSILON);
        assert_eq!(baseline.level(), 6);
    }

    #[test]
    fn refuses_samples_once_full() {
        let mut estimator = BaselineEstimator::<2>::new();
        assert!(estimator.push(1));
        assert!(estimator.push(2));
        assert!(estimator.is_full());
        assert!(!estimator.push(3));
        estimator.clear();
        assert!(estimator.is_empty());
    }
}
