//! Fixed-window moving average used to de-noise endstop readings.
//!
//! The window is a circular buffer of raw ADC samples with a running sum, so
//! each update costs one subtraction and one addition regardless of window
//! size. The average is only meaningful once the window has filled; until
//! then [`MovingAverage::add_sample`] reports zero so a partially filled window
//! can never look like a threshold crossing.

/// Window length used by the analog endstop.
pub const FILTER_CAPACITY: usize = 128;

/// Running-sum moving average over the last `N` samples.
///
/// `N` must be a power of two so the average reduces to a shift.
#[derive(Clone, Debug)]
pub struct MovingAverage<const N: usize = FILTER_CAPACITY> {
    buffer: [u16; N],
    index: usize,
    count: usize,
    sum: u32,
}

impl<const N: usize> MovingAverage<N> {
    const SHIFT: u32 = {
        assert!(N.is_power_of_two(), "moving average capacity must be a power of two");
        assert!(N <= 1 << 16, "moving average capacity overflows the running sum");
        N.trailing_zeros()
    };

    /// Creates an empty filter.
    #[must_use]
    pub const fn new() -> Self {
        let _ = Self::SHIFT;
        Self {
            buffer: [0; N],
            index: 0,
            count: 0,
            sum: 0,
        }
    }

    /// Discards every held sample.
    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
        self.sum = 0;
    }

    /// Pushes `value` into the window and returns the current average.
    ///
    /// Returns `0` until `N` samples have been accepted since the last reset.
    pub fn add_sample(&mut self, value: u16) -> u16 {
        if self.is_full() {
            self.sum -= u32::from(self.buffer[self.index]);
        } else {
            self.count += 1;
        }

        self.buffer[self.index] = value;
        self.sum += u32::from(value);
        self.index = (self.index + 1) % N;

        if self.is_full() {
            // sum <= N * u16::MAX, so the shifted result always fits.
            u16::try_from(self.sum >> Self::SHIFT).unwrap_or(u16::MAX)
        } else {
            0
        }
    }

    /// Returns `true` once the window holds `N` samples.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.count == N
    }

    /// Number of samples currently held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` when no samples are held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of the held samples.
    #[must_use]
    pub const fn sum(&self) -> u32 {
        self.sum
    }

    /// Window length.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_zero_until_window_fills() {
        let mut filter = MovingAverage::<128>::new();
        for _ in 0..127 {
            assert_eq!(filter.add_sample(1000), 0);
        }
        assert!(!filter.is_full());
        assert_eq!(filter.add_sample(1000), 1000);
        assert!(filter.is_full());
    }

    #[test]
    fn oldest_sample_leaves_the_window() {
        let mut filter = MovingAverage::<4>::new();
        for value in [4, 8, 12, 16] {
            filter.add_sample(value);
        }
        assert_eq!(filter.sum(), 40);

        // Evicts the 4.
        assert_eq!(filter.add_sample(20), (8 + 12 + 16 + 20) / 4);
        assert_eq!(filter.sum(), 56);
        assert_eq!(filter.len(), 4);
    }

    #[test]
    fn reset_restarts_the_fill_phase() {
        let mut filter = MovingAverage::<4>::new();
        for _ in 0..6 {
            filter.add_sample(100);
        }
        filter.reset();
        assert!(filter.is_empty());
        assert_eq!(filter.sum(), 0);
        assert_eq!(filter.add_sample(100), 0);
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn full_scale_samples_do_not_overflow() {
        let mut filter = MovingAverage::<128>::new();
        let mut last = 0;
        for _ in 0..1000 {
            last = filter.add_sample(u16::MAX);
        }
        assert_eq!(last, u16::MAX);
        assert_eq!(filter.sum(), 128 * u32::from(u16::MAX));
    }
}
