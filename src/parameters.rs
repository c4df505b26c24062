//! Operator-tunable parameters and the edit staging area.
//!
//! An edit never touches the live values until it is committed: the encoder
//! moves a pending delta on top of the current value, and `commit_edit`
//! validates the complete resulting parameter set before swapping it in.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::heater::Zone;
use crate::profile::{ProfileError, ReflowProfile, DEFAULT_PROFILE, MAX_SETPOINT_C};

/// Gains are stored as hundredths in a 16-bit word.
pub const GAIN_SCALE: f32 = 100.0;
pub const MAX_GAIN: f32 = u16::MAX as f32 / GAIN_SCALE;

pub const DEFAULT_CONSTANT_TEMP_C: u16 = 35;

/// Largest pending delta in either direction. Every field fits in 16 bits,
/// so a wider span can only produce an out-of-range value.
pub const MAX_EDIT_DELTA: i32 = u16::MAX as i32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Gains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

pub const DEFAULT_GAINS: Gains = Gains {
    kp: 3.30,
    ki: 0.02,
    kd: 3.45,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PidTuning {
    pub zones: [Gains; 2],
}

impl PidTuning {
    pub fn gains(&self, zone: Zone) -> Gains {
        self.zones[zone.index()]
    }
}

impl Default for PidTuning {
    fn default() -> Self {
        Self {
            zones: [DEFAULT_GAINS; 2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Parameters {
    pub profile: ReflowProfile,
    pub tuning: PidTuning,
    pub constant_temp: u16,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            profile: DEFAULT_PROFILE,
            tuning: PidTuning::default(),
            constant_temp: DEFAULT_CONSTANT_TEMP_C,
        }
    }
}

impl Parameters {
    pub fn validate(&self) -> Result<(), ParameterError> {
        self.profile.validate().map_err(ParameterError::Profile)?;
        for gains in self.tuning.zones {
            for value in [gains.kp, gains.ki, gains.kd] {
                if !value.is_finite() || value < 0.0 {
                    return Err(ParameterError::NegativeGain);
                }
                if value > MAX_GAIN {
                    return Err(ParameterError::GainTooLarge);
                }
            }
        }
        if self.constant_temp > MAX_SETPOINT_C {
            return Err(ParameterError::Profile(ProfileError::TemperatureTooHigh(
                self.constant_temp,
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileField {
    RampTemp,
    RampDuration,
    SoakTemp,
    SoakDuration,
    ReflowTemp,
    ReflowDuration,
    HoldDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GainTerm {
    Kp,
    Ki,
    Kd,
}

/// Selects one editable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parameter {
    Profile(ProfileField),
    Gain(Zone, GainTerm),
    ConstantTemp,
}

impl Parameter {
    /// Profile and tuning values change how a reflow run behaves mid-flight.
    pub fn affects_reflow(&self) -> bool {
        !matches!(self, Parameter::ConstantTemp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParameterError {
    Profile(ProfileError),
    NegativeGain,
    GainTooLarge,
    /// Integer field outside 0..=65535.
    OutOfRange,
    NoPendingEdit,
    /// Profile or tuning commit attempted during a reflow run.
    Busy,
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterError::Profile(err) => write!(f, "invalid profile: {}", err),
            ParameterError::NegativeGain => write!(f, "PID gains must be non-negative"),
            ParameterError::GainTooLarge => write!(f, "PID gain above {}", MAX_GAIN),
            ParameterError::OutOfRange => write!(f, "value out of range"),
            ParameterError::NoPendingEdit => write!(f, "no edit in progress"),
            ParameterError::Busy => write!(f, "cannot change the profile while reflowing"),
        }
    }
}

/// A staged edit: the selected value plus encoder detents on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEdit {
    pub parameter: Parameter,
    pub delta: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    current: Parameters,
    edit: Option<PendingEdit>,
}

impl ParameterStore {
    pub fn current(&self) -> &Parameters {
        &self.current
    }

    pub fn profile(&self) -> &ReflowProfile {
        &self.current.profile
    }

    pub fn tuning(&self) -> &PidTuning {
        &self.current.tuning
    }

    pub fn constant_temp(&self) -> u16 {
        self.current.constant_temp
    }

    /// Replace everything at once (e.g. after loading from storage).
    pub fn replace(&mut self, params: Parameters) -> Result<(), ParameterError> {
        params.validate()?;
        self.current = params;
        self.edit = None;
        Ok(())
    }

    pub fn pending(&self) -> Option<PendingEdit> {
        self.edit
    }

    /// Open an edit on `parameter`, discarding any other pending edit.
    pub fn begin_edit(&mut self, parameter: Parameter) {
        self.edit = Some(PendingEdit {
            parameter,
            delta: 0,
        });
    }

    /// Apply encoder detents to the pending edit. Ignored when nothing is open.
    pub fn adjust(&mut self, steps: i32) {
        if let Some(edit) = self.edit.as_mut() {
            edit.delta = edit
                .delta
                .saturating_add(steps)
                .clamp(-MAX_EDIT_DELTA, MAX_EDIT_DELTA);
        }
    }

    pub fn cancel_edit(&mut self) {
        self.edit = None;
    }

    /// Value the operator would commit right now, for display.
    pub fn working_value(&self) -> Option<f32> {
        self.edit.map(|edit| match staged(&self.current, edit) {
            Staged::Integer(v) => v as f32,
            Staged::Hundredths(v) => v as f32 / GAIN_SCALE,
        })
    }

    /// Validate and apply the pending edit. On error the live parameters and
    /// the pending edit are left untouched so the operator can correct it.
    pub fn commit_edit(&mut self) -> Result<Parameter, ParameterError> {
        let edit = self.edit.ok_or(ParameterError::NoPendingEdit)?;
        let mut candidate = self.current;
        apply(&mut candidate, edit)?;
        candidate.validate()?;
        self.current = candidate;
        self.edit = None;
        Ok(edit.parameter)
    }
}

enum Staged {
    Integer(i32),
    Hundredths(i32),
}

fn staged(params: &Parameters, edit: PendingEdit) -> Staged {
    match edit.parameter {
        Parameter::Profile(field) => {
            let base = *profile_field(&params.profile, field) as i32;
            Staged::Integer(base.saturating_add(edit.delta))
        }
        Parameter::ConstantTemp => {
            Staged::Integer((params.constant_temp as i32).saturating_add(edit.delta))
        }
        Parameter::Gain(zone, term) => {
            let gain = gain_term(&params.tuning.zones[zone.index()], term);
            let base = libm::roundf(gain * GAIN_SCALE);
            Staged::Hundredths((base as i32).saturating_add(edit.delta))
        }
    }
}

fn apply(params: &mut Parameters, edit: PendingEdit) -> Result<(), ParameterError> {
    match (edit.parameter, staged(params, edit)) {
        (Parameter::Profile(field), Staged::Integer(v)) => {
            *profile_field_mut(&mut params.profile, field) = to_u16(v)?;
        }
        (Parameter::ConstantTemp, Staged::Integer(v)) => {
            params.constant_temp = to_u16(v)?;
        }
        (Parameter::Gain(zone, term), Staged::Hundredths(v)) => {
            if v < 0 {
                return Err(ParameterError::NegativeGain);
            }
            *gain_term_mut(&mut params.tuning.zones[zone.index()], term) = v as f32 / GAIN_SCALE;
        }
        _ => return Err(ParameterError::OutOfRange),
    }
    Ok(())
}

fn to_u16(value: i32) -> Result<u16, ParameterError> {
    u16::try_from(value).map_err(|_| ParameterError::OutOfRange)
}

fn profile_field(profile: &ReflowProfile, field: ProfileField) -> &u16 {
    match field {
        ProfileField::RampTemp => &profile.ramp_target_temp,
        ProfileField::RampDuration => &profile.ramp_duration,
        ProfileField::SoakTemp => &profile.soak_target_temp,
        ProfileField::SoakDuration => &profile.soak_duration,
        ProfileField::ReflowTemp => &profile.reflow_target_temp,
        ProfileField::ReflowDuration => &profile.reflow_duration,
        ProfileField::HoldDuration => &profile.hold_duration,
    }
}

fn profile_field_mut(profile: &mut ReflowProfile, field: ProfileField) -> &mut u16 {
    match field {
        ProfileField::RampTemp => &mut profile.ramp_target_temp,
        ProfileField::RampDuration => &mut profile.ramp_duration,
        ProfileField::SoakTemp => &mut profile.soak_target_temp,
        ProfileField::SoakDuration => &mut profile.soak_duration,
        ProfileField::ReflowTemp => &mut profile.reflow_target_temp,
        ProfileField::ReflowDuration => &mut profile.reflow_duration,
        ProfileField::HoldDuration => &mut profile.hold_duration,
    }
}

fn gain_term(gains: &Gains, term: GainTerm) -> f32 {
    match term {
        GainTerm::Kp => gains.kp,
        GainTerm::Ki => gains.ki,
        GainTerm::Kd => gains.kd,
    }
}

fn gain_term_mut(gains: &mut Gains, term: GainTerm) -> &mut f32 {
    match term {
        GainTerm::Kp => &mut gains.kp,
        GainTerm::Ki => &mut gains.ki,
        GainTerm::Kd => &mut gains.kd,
    }
}
