//! Simulated laser diode under test.

use crate::common::MockRng;
use liv_core::capabilities::SourceMode;

/// Electrical and optical response of a simulated edge-emitting laser diode.
///
/// Electrically the diode is an ideal turn-on voltage in series with a
/// resistance. Optically it emits weak spontaneous light below threshold and
/// a linear stimulated output above it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserDiodeModel {
    /// Volts. No forward current flows below this.
    pub turn_on_voltage: f64,
    /// Ohms.
    pub series_resistance: f64,
    /// Amperes.
    pub threshold_current: f64,
    /// W/A above threshold.
    pub slope_efficiency: f64,
    /// W/A below threshold.
    pub spontaneous_efficiency: f64,
}

impl Default for LaserDiodeModel {
    fn default() -> Self {
        Self {
            turn_on_voltage: 1.5,
            series_resistance: 5.0,
            threshold_current: 0.015,
            slope_efficiency: 0.8,
            spontaneous_efficiency: 0.01,
        }
    }
}

/// Voltage, current and optical power at one drive level.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OperatingPoint {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl LaserDiodeModel {
    /// Terminal voltage for a forced current.
    pub fn voltage_at(&self, current: f64) -> f64 {
        if current > 0.0 {
            self.turn_on_voltage + current * self.series_resistance
        } else {
            current * self.series_resistance
        }
    }

    /// Current for a forced terminal voltage.
    pub fn current_at(&self, voltage: f64) -> f64 {
        if voltage > self.turn_on_voltage {
            (voltage - self.turn_on_voltage) / self.series_resistance
        } else {
            0.0
        }
    }

    /// Emitted optical power. Continuous at threshold.
    pub fn optical_power(&self, current: f64) -> f64 {
        if current <= 0.0 {
            0.0
        } else if current < self.threshold_current {
            current * self.spontaneous_efficiency
        } else {
            self.threshold_current * self.spontaneous_efficiency
                + (current - self.threshold_current) * self.slope_efficiency
        }
    }

    /// Noise-free response to a drive level in the given mode.
    pub fn operating_point(&self, mode: SourceMode, drive: f64) -> OperatingPoint {
        let (voltage, current) = match mode {
            SourceMode::Current => (self.voltage_at(drive), drive),
            SourceMode::Voltage => (drive, self.current_at(drive)),
        };
        OperatingPoint {
            voltage,
            current,
            power: self.optical_power(current),
        }
    }
}

/// Bounded uniform measurement noise.
///
/// Each reading is perturbed by at most `relative * |value| + floor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    pub relative: f64,
    pub floor: f64,
}

impl NoiseModel {
    /// 0.1 % of reading plus 10 µ-units, matching SMU readback accuracy.
    pub fn default_noise() -> Self {
        Self {
            relative: 1e-3,
            floor: 1e-5,
        }
    }

    pub fn none() -> Self {
        Self {
            relative: 0.0,
            floor: 0.0,
        }
    }

    /// Largest deviation `apply` can add to `value`.
    pub fn bound(&self, value: f64) -> f64 {
        self.relative * value.abs() + self.floor
    }

    pub fn apply(&self, value: f64, rng: &MockRng) -> f64 {
        value + rng.symmetric(self.bound(value))
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self::default_noise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_current_below_turn_on() {
        let diode = LaserDiodeModel::default();
        assert_eq!(diode.current_at(1.0), 0.0);
        assert_eq!(diode.current_at(1.5), 0.0);
        assert!((diode.current_at(2.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn voltage_and_current_are_inverse_above_turn_on() {
        let diode = LaserDiodeModel::default();
        for i in [0.001, 0.02, 0.3] {
            let v = diode.voltage_at(i);
            assert!((diode.current_at(v) - i).abs() < 1e-12);
        }
    }

    #[test]
    fn light_output_has_threshold_kink() {
        let diode = LaserDiodeModel::default();
        let below = diode.optical_power(0.010);
        assert!((below - 1e-4).abs() < 1e-12);

        let at = diode.optical_power(0.015);
        let above = diode.optical_power(0.025);
        assert!((above - at - 0.008).abs() < 1e-12);

        // Monotonic across threshold
        assert!(diode.optical_power(0.0149) < diode.optical_power(0.0151));
    }

    #[test]
    fn operating_point_follows_mode() {
        let diode = LaserDiodeModel::default();
        let by_current = diode.operating_point(SourceMode::Current, 0.02);
        assert!((by_current.voltage - 1.6).abs() < 1e-12);
        let by_voltage = diode.operating_point(SourceMode::Voltage, 1.6);
        assert!((by_voltage.current - 0.02).abs() < 1e-12);
        assert!((by_current.power - by_voltage.power).abs() < 1e-12);
    }

    #[test]
    fn noise_stays_within_bound() {
        let noise = NoiseModel::default_noise();
        let rng = MockRng::new(Some(3));
        for _ in 0..1000 {
            let reading = noise.apply(0.05, &rng);
            assert!((reading - 0.05).abs() <= noise.bound(0.05));
        }
        assert_eq!(NoiseModel::none().apply(0.05, &rng), 0.05);
    }
}
