//! Simulated plant: two hot plates, their thermistors, an EEPROM and the
//! operator's encoder and button lines.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fs;
use std::path::PathBuf;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_hal::digital::{ErrorType, InputPin};
use embedded_hal_async::digital::Wait;
use embassy_time::{Duration, Instant, Timer};
use log::*;

use hotplate_controller::heater::{HeaterPort, Zone, MAX_DUTY};
use hotplate_controller::persistence::{PersistentStore, StorageError};
use hotplate_controller::thermistor::{SensorError, SensorPort, ThermistorConfig};

pub const PHYSICS_STEP: Duration = Duration::from_millis(50);

/// First-order thermal model of one plate.
#[derive(Debug, Clone, Copy)]
pub struct PlateModel {
    pub temperature: f32,
    pub ambient: f32,
    /// Heating rate at full duty and ambient temperature, °C/s.
    pub max_heating_rate: f32,
    /// Newton cooling coefficient, 1/s.
    pub heat_loss: f32,
}

impl PlateModel {
    pub fn new(ambient: f32) -> Self {
        Self {
            temperature: ambient,
            ambient,
            max_heating_rate: 3.0,
            heat_loss: 0.01,
        }
    }

    pub fn step(&mut self, duty: u8, dt_s: f32) {
        let heat_input = self.max_heating_rate * duty as f32 / MAX_DUTY as f32;
        let heat_loss = self.heat_loss * (self.temperature - self.ambient);
        self.temperature += (heat_input - heat_loss) * dt_s;
        if self.temperature < self.ambient {
            self.temperature = self.ambient;
        }
    }
}

pub struct Plant {
    plates: [PlateModel; 2],
    duty: [u8; 2],
    thermistor: ThermistorConfig,
    reads: u32,
    /// Zone 1 thermistor freezes at this time.
    stuck_at: Option<Instant>,
    frozen_raw: Option<u16>,
}

impl Plant {
    const fn empty() -> Self {
        Self {
            plates: [PlateModel {
                temperature: 25.0,
                ambient: 25.0,
                max_heating_rate: 3.0,
                heat_loss: 0.01,
            }; 2],
            duty: [0; 2],
            thermistor: ThermistorConfig {
                nominal_ohms: 120_000.0,
                nominal_temp_c: 25.0,
                beta: 3950.0,
                series_ohms: 100_000.0,
                adc_full_scale: 1023.0,
                samples: 5,
                sample_delay: Duration::from_millis(5),
                min_valid_c: -20.0,
                stuck_limit: 3,
                match_tolerance_c: 0.0,
            },
            reads: 0,
            stuck_at: None,
            frozen_raw: None,
        }
    }
}

static PLANT: Mutex<CriticalSectionRawMutex, RefCell<Plant>> =
    Mutex::new(RefCell::new(Plant::empty()));

pub fn configure(ambient: f32, thermistor: ThermistorConfig, stuck_at: Option<Instant>) {
    PLANT.lock(|plant| {
        let mut plant = plant.borrow_mut();
        plant.plates = [PlateModel::new(ambient); 2];
        plant.thermistor = thermistor;
        plant.stuck_at = stuck_at;
    });
}

pub fn temperatures() -> [f32; 2] {
    PLANT.lock(|plant| {
        let plant = plant.borrow();
        [plant.plates[0].temperature, plant.plates[1].temperature]
    })
}

#[embassy_executor::task]
pub async fn physics_task() -> ! {
    let dt_s = PHYSICS_STEP.as_millis() as f32 / 1000.0;
    loop {
        PLANT.lock(|plant| {
            let mut plant = plant.borrow_mut();
            let duty = plant.duty;
            for (plate, duty) in plant.plates.iter_mut().zip(duty) {
                plate.step(duty, dt_s);
            }
        });
        Timer::after(PHYSICS_STEP).await;
    }
}

/// ADC view of the simulated plates, with one count of read noise.
pub struct SimSensor;

impl SensorPort for SimSensor {
    async fn read_raw(&mut self, zone: Zone) -> Result<u16, SensorError> {
        let now = Instant::now();
        Ok(PLANT.lock(|plant| {
            let mut plant = plant.borrow_mut();
            let raw = plant
                .thermistor
                .raw_for_celsius(plant.plates[zone.index()].temperature);
            plant.reads = plant.reads.wrapping_add(1);
            let noisy = if plant.reads % 3 == 0 {
                raw.saturating_add(1)
            } else {
                raw
            };

            let stuck = zone == Zone::One && plant.stuck_at.is_some_and(|at| now >= at);
            if !stuck {
                return noisy;
            }
            if plant.frozen_raw.is_none() {
                warn!("simulation: zone 1 thermistor frozen at {}", noisy);
            }
            *plant.frozen_raw.get_or_insert(noisy)
        }))
    }
}

pub struct SimHeater;

impl HeaterPort for SimHeater {
    fn set_duty_cycle(&mut self, zone: Zone, duty: u8) {
        PLANT.lock(|plant| plant.borrow_mut().duty[zone.index()] = duty);
    }
}

pub const EEPROM_SIZE: usize = 256;

/// Byte-addressed EEPROM image, optionally mirrored to a file so settings
/// survive a restart of the simulator.
pub struct SimEeprom {
    bytes: [u8; EEPROM_SIZE],
    path: Option<PathBuf>,
}

impl SimEeprom {
    pub fn open(path: Option<PathBuf>) -> Self {
        let mut bytes = [0xFF; EEPROM_SIZE];
        if let Some(path) = &path {
            match fs::read(path) {
                Ok(image) => {
                    let len = image.len().min(EEPROM_SIZE);
                    bytes[..len].copy_from_slice(&image[..len]);
                    info!("EEPROM image loaded from {}", path.display());
                }
                Err(err) => info!("starting with blank EEPROM ({})", err),
            }
        }
        Self { bytes, path }
    }
}

impl PersistentStore for SimEeprom {
    async fn read_bytes(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = address as usize;
        let end = start + buf.len();
        if end > EEPROM_SIZE {
            return Err(StorageError::Read);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    async fn write_bytes(&mut self, address: u16, bytes: &[u8]) -> Result<(), StorageError> {
        let start = address as usize;
        let end = start + bytes.len();
        if end > EEPROM_SIZE {
            return Err(StorageError::Write);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        if let Some(path) = &self.path {
            if let Err(err) = fs::write(path, self.bytes) {
                error!("EEPROM image write failed: {}", err);
                return Err(StorageError::Write);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    EncoderClk,
    EncoderDt,
    /// Active low, idles high on its pull-up.
    Button,
}

impl Line {
    fn index(self) -> usize {
        self as usize
    }
}

static LEVELS: Mutex<CriticalSectionRawMutex, Cell<[bool; 3]>> =
    Mutex::new(Cell::new([false, false, true]));
static EDGES: [Signal<CriticalSectionRawMutex, ()>; 3] =
    [Signal::new(), Signal::new(), Signal::new()];

fn level(line: Line) -> bool {
    LEVELS.lock(|levels| levels.get()[line.index()])
}

fn drive(line: Line, high: bool) {
    let changed = LEVELS.lock(|levels| {
        let mut now = levels.get();
        let changed = now[line.index()] != high;
        now[line.index()] = high;
        levels.set(now);
        changed
    });
    if changed {
        EDGES[line.index()].signal(());
    }
}

/// Turn the encoder by one step. Each step is a single edge on one line.
pub fn rotate(clockwise: bool) {
    let clk = level(Line::EncoderClk);
    let dt = level(Line::EncoderDt);
    if (clk == dt) == clockwise {
        drive(Line::EncoderClk, !clk);
    } else {
        drive(Line::EncoderDt, !dt);
    }
}

/// Press and release the button. Blocks the calling thread while held.
pub fn press_button(hold: std::time::Duration) {
    drive(Line::Button, false);
    std::thread::sleep(hold);
    drive(Line::Button, true);
}

/// Input pin reading one of the simulated lines.
pub struct SimPin(pub Line);

impl SimPin {
    async fn wait_for_level(&mut self, high: bool) -> Result<(), Infallible> {
        while level(self.0) != high {
            EDGES[self.0.index()].wait().await;
        }
        Ok(())
    }

    async fn wait_for_edge_to(&mut self, high: bool) -> Result<(), Infallible> {
        loop {
            EDGES[self.0.index()].wait().await;
            if level(self.0) == high {
                return Ok(());
            }
        }
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(level(self.0))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!level(self.0))
    }
}

impl Wait for SimPin {
    async fn wait_for_high(&mut self) -> Result<(), Infallible> {
        self.wait_for_level(true).await
    }

    async fn wait_for_low(&mut self) -> Result<(), Infallible> {
        self.wait_for_level(false).await
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
        self.wait_for_edge_to(true).await
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
        self.wait_for_edge_to(false).await
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
        EDGES[self.0.index()].wait().await;
        Ok(())
    }
}
