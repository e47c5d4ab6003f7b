/// Raw value as decoded from the peripheral, and the same value with the tare offset removed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub raw: f64,
    pub adjusted: f64,
}

/// Tare offset and running maximum of a single connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationState {
    tare_offset: f64,
    max_adjusted: f64,
    last_raw: Option<f64>,
}

impl CalibrationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tare_offset(&self) -> f64 {
        self.tare_offset
    }

    pub fn max_adjusted(&self) -> f64 {
        self.max_adjusted
    }

    /// The most recent raw value with the current tare offset applied, 0 if nothing was received
    /// yet.
    pub fn current_adjusted(&self) -> f64 {
        match self.last_raw {
            Some(raw) => raw - self.tare_offset,
            None => 0.0,
        }
    }

    pub fn apply(&mut self, raw: f64) -> Reading {
        let adjusted = raw - self.tare_offset;
        self.last_raw = Some(raw);

        if adjusted > self.max_adjusted {
            self.max_adjusted = adjusted;
        }

        Reading { raw, adjusted }
    }

    /// Make the current reading the new zero. The maximum is left alone.
    pub fn tare(&mut self) {
        self.tare_offset += self.current_adjusted();
    }

    /// Clear the maximum. This also re-zeroes the current reading, the same as `tare`.
    pub fn reset_max(&mut self) {
        self.max_adjusted = 0.0;
        self.tare();
    }

    pub fn on_connect(&mut self) {
        *self = Self::default();
    }

    pub fn on_disconnect(&mut self) {
        *self = Self::default();
    }
}
