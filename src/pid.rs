//! PID loop for one heating zone, no_std friendly.
//!
//! - `f32` math
//! - Fixed sample period: `compute` calls that arrive early return the last output
//! - Output and integrator clamped to the duty-cycle range (anti-windup)
//! - Derivative on error with optional first-order low-pass filtering
//! - Manual mode holds a forced output; returning to Automatic clears the
//!   integrator so a long forced-off period cannot wind it up
//!
//! Example
//! ```ignore
//! let mut pid = PidController::new(3.3, 0.02, 3.45)
//!     .with_output_limits(0.0, 255.0)
//!     .with_sample_period(Duration::from_millis(200));
//!
//! pid.set_mode(Mode::Automatic);
//! let duty = pid.compute(Instant::now(), plate_temp_c, setpoint_c);
//! ```

use embassy_time::{Duration, Instant};

use crate::parameters::Gains;

pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Manual,
    Automatic,
}

#[derive(Debug, Clone)]
pub struct PidController {
    // Gains
    kp: f32,
    ki: f32,
    kd: f32,

    // Output limits
    out_min: f32,
    out_max: f32,

    sample_period: Duration,
    last_compute: Option<Instant>,

    // State
    mode: Mode,
    manual_output: f32,
    integrator: f32,
    last_error: f32,
    last_derivative: f32,
    last_output: f32,

    // Derivative first-order low-pass filter coefficient (0..1).
    // 0 = heavy filtering, 1 = no filtering.
    d_filter_alpha: f32,
}

impl PidController {
    /// Create a new PID controller with given gains.
    /// Defaults: output limits [0,255], mode=Manual with output 0,
    /// sample period 200 ms, derivative filter alpha=1.0
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            out_min: 0.0,
            out_max: 255.0,
            sample_period: DEFAULT_SAMPLE_PERIOD,
            last_compute: None,
            mode: Mode::Manual,
            manual_output: 0.0,
            integrator: 0.0,
            last_error: 0.0,
            last_derivative: 0.0,
            last_output: 0.0,
            d_filter_alpha: 1.0,
        }
    }

    pub fn from_gains(gains: Gains) -> Self {
        Self::new(gains.kp, gains.ki, gains.kd)
    }

    /// Builder: set output limits.
    pub fn with_output_limits(mut self, min: f32, max: f32) -> Self {
        self.set_output_limits(min, max);
        self
    }

    /// Builder: set derivative filter alpha (0..1). 1 = no filtering.
    pub fn with_derivative_filter_alpha(mut self, alpha: f32) -> Self {
        self.set_derivative_filter_alpha(alpha);
        self
    }

    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }

    /// Set controller mode. Manual -> Automatic starts from a clean integrator.
    pub fn set_mode(&mut self, mode: Mode) {
        if mode == Mode::Automatic && self.mode == Mode::Manual {
            self.reset();
        }
        if mode == Mode::Manual {
            self.last_output = self.manual_output;
        }
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Value held at the output while in Manual mode.
    pub fn set_manual_output(&mut self, output: f32) {
        self.manual_output = clamp(output, self.out_min, self.out_max);
        if self.mode == Mode::Manual {
            self.last_output = self.manual_output;
        }
    }

    /// Shorthand used by every safety path: Manual with the output forced to 0.
    pub fn force_off(&mut self) {
        self.set_manual_output(0.0);
        self.set_mode(Mode::Manual);
    }

    /// Tune proportional, integral, derivative gains.
    pub fn tune(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn apply_gains(&mut self, gains: Gains) {
        self.tune(gains.kp, gains.ki, gains.kd);
    }

    /// Set output limits and clamp current state accordingly.
    pub fn set_output_limits(&mut self, min: f32, max: f32) {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.out_min = min;
        self.out_max = max;
        // Keep current output and integrator within bounds
        self.integrator = clamp(self.integrator, self.out_min, self.out_max);
        self.last_output = clamp(self.last_output, self.out_min, self.out_max);
        self.manual_output = clamp(self.manual_output, self.out_min, self.out_max);
    }

    /// Set derivative filter alpha [0..1].
    pub fn set_derivative_filter_alpha(&mut self, alpha: f32) {
        self.d_filter_alpha = clamp(alpha, 0.0, 1.0);
    }

    /// Reset internal state (integrator, derivative history, sample clock).
    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.last_error = 0.0;
        self.last_derivative = 0.0;
        self.last_compute = None;
        self.last_output = clamp(0.0, self.out_min, self.out_max);
    }

    /// Run one PID step if a sample period has elapsed since the last one.
    /// Returns the clamped control output.
    pub fn compute(&mut self, now: Instant, measurement: f32, setpoint: f32) -> f32 {
        if self.mode == Mode::Manual {
            self.last_output = self.manual_output;
            return self.last_output;
        }

        if !measurement.is_finite() || !setpoint.is_finite() {
            return self.last_output;
        }

        let first = match self.last_compute {
            None => true,
            Some(last) => match now.checked_duration_since(last) {
                Some(elapsed) if elapsed >= self.sample_period => false,
                _ => return self.last_output,
            },
        };
        self.last_compute = Some(now);

        let dt_s = self.sample_period.as_micros() as f32 / 1_000_000.0;
        let error = setpoint - measurement;

        // Proportional
        let p = self.kp * error;

        // Integral with anti-windup (clamp)
        self.integrator += self.ki * error * dt_s;
        self.integrator = clamp(self.integrator, self.out_min, self.out_max);

        // Derivative on error; no history on the first sample after a reset.
        let raw_d = if self.kd != 0.0 && !first && dt_s > 0.0 {
            self.kd * (error - self.last_error) / dt_s
        } else {
            0.0
        };

        let d = self.d_filter_alpha * raw_d + (1.0 - self.d_filter_alpha) * self.last_derivative;

        let output = clamp(p + self.integrator + d, self.out_min, self.out_max);

        self.last_output = output;
        self.last_error = error;
        self.last_derivative = d;

        output
    }

    /// Return the last computed output.
    pub fn output(&self) -> f32 {
        self.last_output
    }

    /// Last output rounded to an 8-bit duty cycle.
    pub fn duty(&self) -> u8 {
        let rounded = libm::roundf(self.last_output);
        if rounded <= 0.0 {
            0
        } else if rounded >= 255.0 {
            255
        } else {
            rounded as u8
        }
    }

    pub fn integrator(&self) -> f32 {
        self.integrator
    }

    /// Current gains.
    pub fn gains(&self) -> (f32, f32, f32) {
        (self.kp, self.ki, self.kd)
    }
}

#[inline]
fn clamp(x: f32, min: f32, max: f32) -> f32 {
    if x < min {
        min
    } else if x > max {
        max
    } else {
        x
    }
}
