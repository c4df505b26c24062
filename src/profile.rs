//! Reflow profile and the segment state machine that turns elapsed run time
//! into a setpoint.
//!
//! ```text
//!  temp
//!   ^            reflow_target ___________
//!   |                         /           |
//!   |     soak_target ______/             |
//!   |    ramp_target /                    |
//!   |           /                         |
//!   |  initial /                          |_ 0 (cooling)
//!   +-----------|---------|------|--------|------> t
//!          ramp_dur  soak_dur reflow_dur  +hold_dur
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

/// Hottest setpoint an edit or a stored profile may request.
pub const MAX_SETPOINT_C: u16 = 260;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Ramp,
    Soak,
    ReflowRamp,
    ReflowHold,
    Cooling,
}

impl Phase {
    pub fn to_str(&self) -> &'static str {
        match self {
            Phase::Ramp => "Ramp",
            Phase::Soak => "Soak",
            Phase::ReflowRamp => "Reflow Ramp",
            Phase::ReflowHold => "Reflow",
            Phase::Cooling => "Cooling",
        }
    }

    fn next(self) -> Phase {
        match self {
            Phase::Ramp => Phase::Soak,
            Phase::Soak => Phase::ReflowRamp,
            Phase::ReflowRamp => Phase::ReflowHold,
            Phase::ReflowHold | Phase::Cooling => Phase::Cooling,
        }
    }
}

/// Temperatures in °C, durations in seconds from run start (except `hold_duration`,
/// which is measured from the end of the reflow ramp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReflowProfile {
    pub ramp_target_temp: u16,
    pub ramp_duration: u16,
    pub soak_target_temp: u16,
    pub soak_duration: u16,
    pub reflow_target_temp: u16,
    pub reflow_duration: u16,
    pub hold_duration: u16,
}

/// MG Chemicals 4902P (Sn42Bi57Ag1) low temperature paste.
pub const DEFAULT_PROFILE: ReflowProfile = ReflowProfile {
    ramp_target_temp: 115,
    ramp_duration: 100,
    soak_target_temp: 145,
    soak_duration: 155,
    reflow_target_temp: 185,
    reflow_duration: 180,
    hold_duration: 35,
};

impl Default for ReflowProfile {
    fn default() -> Self {
        DEFAULT_PROFILE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileError {
    /// Segment end times must satisfy ramp < soak < reflow.
    NonMonotonic,
    TemperatureTooHigh(u16),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NonMonotonic => {
                write!(f, "segment times must increase: ramp < soak < reflow")
            }
            ProfileError::TemperatureTooHigh(t) => {
                write!(f, "{} C exceeds the {} C limit", t, MAX_SETPOINT_C)
            }
        }
    }
}

impl ReflowProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !(self.ramp_duration < self.soak_duration && self.soak_duration < self.reflow_duration) {
            return Err(ProfileError::NonMonotonic);
        }
        for t in [
            self.ramp_target_temp,
            self.soak_target_temp,
            self.reflow_target_temp,
        ] {
            if t > MAX_SETPOINT_C {
                return Err(ProfileError::TemperatureTooHigh(t));
            }
        }
        Ok(())
    }

    /// Elapsed second at which `phase` hands over to the next one.
    pub fn phase_end(&self, phase: Phase) -> Option<u32> {
        match phase {
            Phase::Ramp => Some(self.ramp_duration as u32),
            Phase::Soak => Some(self.soak_duration as u32),
            Phase::ReflowRamp => Some(self.reflow_duration as u32),
            Phase::ReflowHold => Some(self.reflow_duration as u32 + self.hold_duration as u32),
            Phase::Cooling => None,
        }
    }

    /// Total heated time of the profile.
    pub fn total_duration(&self) -> u32 {
        self.reflow_duration as u32 + self.hold_duration as u32
    }

    /// Setpoint rule of `phase` evaluated at `elapsed` seconds.
    pub fn setpoint(&self, phase: Phase, elapsed: u32, initial_temp: f32) -> f32 {
        let t = elapsed as f32;
        match phase {
            Phase::Ramp => interpolate(
                (0.0, initial_temp),
                (self.ramp_duration as f32, self.ramp_target_temp as f32),
                t,
            ),
            Phase::Soak => interpolate(
                (self.ramp_duration as f32, self.ramp_target_temp as f32),
                (self.soak_duration as f32, self.soak_target_temp as f32),
                t,
            ),
            Phase::ReflowRamp => interpolate(
                (self.soak_duration as f32, self.soak_target_temp as f32),
                (self.reflow_duration as f32, self.reflow_target_temp as f32),
                t,
            ),
            Phase::ReflowHold => self.reflow_target_temp as f32,
            Phase::Cooling => 0.0,
        }
    }
}

/// Straight line through two (time, temperature) points.
fn interpolate(start: (f32, f32), end: (f32, f32), t: f32) -> f32 {
    let span = end.0 - start.0;
    if span <= 0.0 {
        return end.1;
    }
    (end.1 - start.1) / span * (t - start.0) + start.1
}

/// One execution of a profile. Phases only move forward; `Cooling` is terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileRun {
    phase: Phase,
    initial_temp: f32,
}

impl ProfileRun {
    pub fn start(initial_temp: f32) -> Self {
        Self {
            phase: Phase::Ramp,
            initial_temp,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn initial_temp(&self) -> f32 {
        self.initial_temp
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Cooling
    }

    /// Advance past every segment whose end time has been reached, then
    /// return the setpoint for `elapsed`. Several segments can be crossed in
    /// one call when the seconds counter caught up after a stall.
    pub fn advance(&mut self, profile: &ReflowProfile, elapsed: u32) -> f32 {
        while let Some(end) = profile.phase_end(self.phase) {
            if elapsed < end {
                break;
            }
            self.phase = self.phase.next();
        }
        profile.setpoint(self.phase, elapsed, self.initial_temp)
    }
}
