#![cfg_attr(not(test), no_std)]

#[cfg(feature = "defmt")]
pub use defmt as log;

#[cfg(not(feature = "defmt"))]
pub use log;

pub mod controller;
pub mod heater;
pub mod inputs;
pub mod parameters;
pub mod persistence;
pub mod pid;
pub mod profile;
pub mod telemetry;
pub mod thermistor;
pub mod timer;

pub static VERSION: &str = "v0.1";
pub static CONTROL_TICK_MILLIS: u32 = 100;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::watch::Watch;
use serde::{Deserialize, Serialize};

use crate::heater::Zone;
use crate::parameters::Parameter;
use crate::profile::Phase;

/// Operator commands produced by the menu layer (or the host command line).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// First half of the two-step start: arm a run in the given mode.
    Start(RunMode),
    ConfirmYes,
    ConfirmNo,
    /// Ask to stop a running session, or acknowledge a latched fault.
    Stop,
    BeginEdit(Parameter),
    /// Encoder detents applied to the pending edit.
    Adjust(i32),
    CommitEdit,
    CancelEdit,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunMode {
    Constant,
    Reflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Initializing,
    Idle,
    Armed,
    Running,
    ConfirmStop,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SaveStatus {
    Idle,
    InProgress,
    Saved,
    Failed,
}

/// Read-only view of the controller, produced once per control tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: Status,
    pub run_mode: Option<RunMode>,
    pub phase: Option<Phase>,
    pub temp1: f32,
    pub temp2: f32,
    pub setpoint: f32,
    pub elapsed_seconds: u32,
    pub fault1: bool,
    pub fault2: bool,
    pub pending_edit: Option<f32>,
    pub duty1: u8,
    pub duty2: u8,
    pub plates_hot: bool,
    pub save_status: SaveStatus,
}

impl Snapshot {
    pub fn temperature(&self, zone: Zone) -> f32 {
        match zone {
            Zone::One => self.temp1,
            Zone::Two => self.temp2,
        }
    }

    pub fn duty(&self, zone: Zone) -> u8 {
        match zone {
            Zone::One => self.duty1,
            Zone::Two => self.duty2,
        }
    }
}

pub static COMMAND_CHANNEL: Channel<CriticalSectionRawMutex, Command, 4> = Channel::new();
pub static CONTROLLER_STATE: Watch<CriticalSectionRawMutex, Snapshot, 3> = Watch::new();
