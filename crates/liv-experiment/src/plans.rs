//! Setpoint plans.
//!
//! A [`SetpointPlan`] turns a validated [`SweepRange`] into the ordered list of
//! drive levels the controller visits:
//!
//! ```text
//! start=0, stop=10, step=2  ->  0, 2, 4, 6, 8, 10
//! start=0, stop=10, step=3  ->  0, 3, 6, 9, 10
//! ```
//!
//! Points are computed as `start + index * step` rather than by repeated
//! addition, and the final point is exactly `stop`.

use liv_core::config::SweepRange;

/// Ordered setpoints of one sweep. Iterating yields `(index, setpoint)`.
#[derive(Debug, Clone)]
pub struct SetpointPlan {
    sweep: SweepRange,
    num_points: usize,
    current_point: usize,
}

impl SetpointPlan {
    pub fn new(sweep: SweepRange) -> Self {
        Self {
            sweep,
            num_points: sweep.point_count(),
            current_point: 0,
        }
    }

    /// Total number of setpoints, including those already yielded.
    pub fn len(&self) -> usize {
        self.num_points
    }

    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    /// Setpoint at `index`, or `None` past the end.
    pub fn setpoint(&self, index: usize) -> Option<f64> {
        if index >= self.num_points {
            return None;
        }
        if index + 1 == self.num_points {
            return Some(self.sweep.stop);
        }
        Some(self.sweep.start + index as f64 * self.sweep.step)
    }

    /// All setpoints in order.
    pub fn setpoints(&self) -> Vec<f64> {
        (0..self.num_points).filter_map(|i| self.setpoint(i)).collect()
    }
}

impl Iterator for SetpointPlan {
    type Item = (usize, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current_point;
        let value = self.setpoint(index)?;
        self.current_point += 1;
        Some((index, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_points.saturating_sub(self.current_point);
        (remaining, Some(remaining))
    }
}
