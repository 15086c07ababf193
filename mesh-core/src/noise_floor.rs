//! Channel quality estimator: running noise floor from idle-channel RSSI samples.

/// Samples averaged into one noise floor estimate.
pub const NUM_NOISE_FLOOR_SAMPLES: u16 = 64;

/// A sample is rejected as traffic/interference when it is this far above the current floor.
pub const SAMPLING_THRESHOLD: i16 = 14;

/// Lowest floor ever reported (dBm). A silent channel must not drag the estimate further down.
pub const DEFAULT_MIN_NOISE_FLOOR: i16 = -120;

/// Running noise floor plus the activity threshold used for listen-before-talk.
#[derive(Debug, Clone)]
pub struct NoiseFloorEstimate {
    floor: i16,
    threshold: i16,
    sample_count: u16,
    sample_accumulator: i32,
    min_floor: i16,
}

impl NoiseFloorEstimate {
    pub fn new(min_floor: i16) -> Self {
        Self {
            floor: 0,
            threshold: 0,
            sample_count: 0,
            sample_accumulator: 0,
            min_floor,
        }
    }

    /// Forget everything, including the activity threshold.
    pub fn reset(&mut self) {
        self.floor = 0;
        self.threshold = 0;
        self.sample_count = 0;
        self.sample_accumulator = 0;
    }

    pub fn floor(&self) -> i16 {
        self.floor
    }

    pub fn threshold(&self) -> i16 {
        self.threshold
    }

    pub fn sample_count(&self) -> u16 {
        self.sample_count
    }

    /// True while the current window still needs samples.
    pub fn wants_sample(&self) -> bool {
        self.sample_count < NUM_NOISE_FLOOR_SAMPLES
    }

    /// Offer one instantaneous RSSI reading. Returns whether it was accepted into the window.
    ///
    /// Readings at or above `floor + SAMPLING_THRESHOLD` are outliers and are dropped.
    /// The floor is recomputed as soon as the window fills.
    pub fn offer_sample(&mut self, rssi: i16) -> bool {
        if !self.wants_sample() {
            return false;
        }
        if i32::from(rssi) >= i32::from(self.floor) + i32::from(SAMPLING_THRESHOLD) {
            return false;
        }
        self.sample_count += 1;
        self.sample_accumulator += i32::from(rssi);
        if self.sample_count == NUM_NOISE_FLOOR_SAMPLES {
            let avg = self.sample_accumulator / i32::from(NUM_NOISE_FLOOR_SAMPLES);
            self.floor = avg.max(i32::from(self.min_floor)) as i16;
            self.sample_accumulator = 0;
            tracing::debug!(floor = self.floor, "noise floor recalibrated");
        }
        true
    }

    /// Set the activity threshold and, once the previous window is complete, open a fresh one.
    pub fn trigger_calibration(&mut self, threshold: i16) {
        self.threshold = threshold;
        if self.sample_count >= NUM_NOISE_FLOOR_SAMPLES {
            self.sample_count = 0;
            self.sample_accumulator = 0;
        }
    }

    /// Whether `rssi` indicates someone else is on the air. Always false with a zero threshold.
    pub fn is_active(&self, rssi: i16) -> bool {
        if self.threshold == 0 {
            return false;
        }
        i32::from(rssi) > i32::from(self.floor) + i32::from(self.threshold)
    }
}

impl Default for NoiseFloorEstimate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_NOISE_FLOOR)
    }
}
