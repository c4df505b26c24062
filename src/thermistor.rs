//! NTC thermistor acquisition and sensor fault detection.
//!
//! Each zone has one thermistor on the low side of a voltage divider with a
//! fixed series resistor. Raw ADC counts are averaged, converted to a
//! resistance and then to a temperature with the Beta equation:
//!
//! ```text
//! R   = (Vmax * Rs - avg * Rs) / avg
//! 1/T = 1/T0 + (1/B) * ln(R / R0)
//! ```
//!
//! A channel is flagged faulty when it reads below the cold limit or when it
//! has returned the same value for `stuck_limit` consecutive acquisitions
//! (a disconnected or frozen sensor would otherwise feed the PID a constant,
//! and the heater would run away).

use core::fmt;
use core::future::Future;

use embassy_time::{Duration, Timer};
use heapless::Vec;

use crate::heater::Zone;
use crate::log::*;

const KELVIN_OFFSET: f32 = 273.15;
pub const MAX_SAMPLES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// The converter did not produce a sample.
    ReadFailed,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ReadFailed => write!(f, "ADC read failed"),
        }
    }
}

bitflags::bitflags! {
    /// Zones whose thermistor is currently considered failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultFlags: u8 {
        const ZONE_1 = 0b0000_0001;
        const ZONE_2 = 0b0000_0010;
    }
}

impl FaultFlags {
    pub fn for_zone(zone: Zone) -> Self {
        match zone {
            Zone::One => FaultFlags::ZONE_1,
            Zone::Two => FaultFlags::ZONE_2,
        }
    }
}

/// Raw sample source, one ADC channel per zone.
pub trait SensorPort {
    fn read_raw(&mut self, zone: Zone) -> impl Future<Output = Result<u16, SensorError>>;
}

impl<S: SensorPort + ?Sized> SensorPort for &mut S {
    fn read_raw(&mut self, zone: Zone) -> impl Future<Output = Result<u16, SensorError>> {
        (**self).read_raw(zone)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThermistorConfig {
    /// Resistance at `nominal_temp_c`, ohms.
    pub nominal_ohms: f32,
    pub nominal_temp_c: f32,
    pub beta: f32,
    /// The fixed divider resistor, ohms.
    pub series_ohms: f32,
    /// Full-scale ADC count (1023 for a 10-bit converter).
    pub adc_full_scale: f32,
    /// Samples averaged per acquisition, at most `MAX_SAMPLES`.
    pub samples: usize,
    /// Pause between sample rounds.
    pub sample_delay: Duration,
    /// Readings below this are treated as a broken sensor.
    pub min_valid_c: f32,
    /// Consecutive identical readings that flag a stuck sensor.
    pub stuck_limit: u8,
    /// Two readings closer than this compare equal. Zero means exact equality.
    pub match_tolerance_c: f32,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        Self {
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
        }
    }
}

impl ThermistorConfig {
    /// Divider resistance for an averaged ADC count.
    pub fn resistance(&self, average: f32) -> f32 {
        (self.adc_full_scale * self.series_ohms - average * self.series_ohms) / average
    }

    /// Beta-equation conversion, result in °C.
    pub fn celsius(&self, resistance: f32) -> f32 {
        let mut inv_t = libm::logf(resistance / self.nominal_ohms) / self.beta;
        inv_t += 1.0 / (self.nominal_temp_c + KELVIN_OFFSET);
        1.0 / inv_t - KELVIN_OFFSET
    }

    pub fn celsius_from_average(&self, average: f32) -> f32 {
        self.celsius(self.resistance(average))
    }

    /// Inverse of `celsius_from_average`, rounded to the nearest ADC count.
    /// Used by simulations and tests to synthesize raw samples.
    pub fn raw_for_celsius(&self, celsius: f32) -> u16 {
        let inv_t = 1.0 / (celsius + KELVIN_OFFSET) - 1.0 / (self.nominal_temp_c + KELVIN_OFFSET);
        let resistance = self.nominal_ohms * libm::expf(self.beta * inv_t);
        let average = self.adc_full_scale * self.series_ohms / (resistance + self.series_ohms);
        let raw = libm::roundf(average);
        if raw <= 0.0 {
            0
        } else if raw >= self.adc_full_scale {
            self.adc_full_scale as u16
        } else {
            raw as u16
        }
    }
}

/// Per-channel acquisition state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelState {
    pub temperature: f32,
    pub previous: f32,
    pub matches: u8,
    pub fault: bool,
}

impl ChannelState {
    pub const fn new() -> Self {
        Self {
            temperature: 0.0,
            previous: 0.0,
            matches: 0,
            fault: false,
        }
    }

    /// Record a new converted temperature and re-evaluate the fault flag.
    pub fn update(&mut self, temperature: f32, config: &ThermistorConfig) {
        self.previous = self.temperature;
        self.temperature = temperature;

        let same = (self.temperature - self.previous).abs() <= config.match_tolerance_c;
        if same {
            self.matches = self.matches.saturating_add(1);
        } else {
            self.matches = 0;
        }

        self.fault = !temperature.is_finite()
            || temperature < config.min_valid_c
            || self.matches >= config.stuck_limit;
    }

    /// A read that produced no sample: keep the last temperature, raise the flag.
    pub fn mark_unreadable(&mut self) {
        self.matches = 0;
        self.fault = true;
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one acquisition, copied out to the rest of the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readings {
    pub temperatures: [f32; 2],
    pub faults: FaultFlags,
}

impl Readings {
    pub fn temperature(&self, zone: Zone) -> f32 {
        self.temperatures[zone.index()]
    }

    pub fn fault(&self, zone: Zone) -> bool {
        self.faults.contains(FaultFlags::for_zone(zone))
    }

    pub fn any_fault(&self) -> bool {
        !self.faults.is_empty()
    }

    pub fn average(&self) -> f32 {
        (self.temperatures[0] + self.temperatures[1]) / 2.0
    }
}

impl Default for Readings {
    fn default() -> Self {
        Self {
            temperatures: [0.0; 2],
            faults: FaultFlags::empty(),
        }
    }
}

pub struct Thermistors<S> {
    sensor: S,
    config: ThermistorConfig,
    channels: [ChannelState; 2],
}

impl<S: SensorPort> Thermistors<S> {
    pub fn new(sensor: S, config: ThermistorConfig) -> Self {
        Self {
            sensor,
            config,
            channels: [ChannelState::new(); 2],
        }
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// Most recent result without sampling again.
    pub fn last(&self) -> Readings {
        let mut faults = FaultFlags::empty();
        for zone in Zone::ALL {
            if self.channels[zone.index()].fault {
                faults |= FaultFlags::for_zone(zone);
            }
        }
        Readings {
            temperatures: [self.channels[0].temperature, self.channels[1].temperature],
            faults,
        }
    }

    /// Sample both channels, convert, and update the fault flags.
    pub async fn acquire(&mut self) -> Readings {
        let samples = self.config.samples.clamp(1, MAX_SAMPLES);
        let mut raw: [Vec<u16, MAX_SAMPLES>; 2] = [Vec::new(), Vec::new()];
        let mut failed = [false; 2];

        for round in 0..samples {
            for zone in Zone::ALL {
                if failed[zone.index()] {
                    continue;
                }
                match self.sensor.read_raw(zone).await {
                    Ok(value) => {
                        // Capacity equals the clamp above, push cannot fail.
                        let _ = raw[zone.index()].push(value);
                    }
                    Err(err) => {
                        warn!("thermistor {:?} read error: {}", zone, err);
                        failed[zone.index()] = true;
                    }
                }
            }
            if round + 1 < samples && self.config.sample_delay.as_ticks() > 0 {
                Timer::after(self.config.sample_delay).await;
            }
        }

        for zone in Zone::ALL {
            let channel = &mut self.channels[zone.index()];
            let was_faulted = channel.fault;
            if failed[zone.index()] {
                channel.mark_unreadable();
            } else {
                let values = &raw[zone.index()];
                let sum: u32 = values.iter().map(|&v| v as u32).sum();
                let average = sum as f32 / values.len() as f32;
                channel.update(self.config.celsius_from_average(average), &self.config);
            }
            if channel.fault && !was_faulted {
                warn!(
                    "thermistor {:?} fault: {} C, {} repeated readings",
                    zone, channel.temperature, channel.matches
                );
            } else if !channel.fault && was_faulted {
                info!("thermistor {:?} reading valid again", zone);
            }
        }

        self.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    fn config() -> ThermistorConfig {
        ThermistorConfig {
            sample_delay: Duration::from_ticks(0),
            ..ThermistorConfig::default()
        }
    }

    struct FixedAdc {
        values: [u16; 2],
    }

    impl SensorPort for FixedAdc {
        async fn read_raw(&mut self, zone: Zone) -> Result<u16, SensorError> {
            Ok(self.values[zone.index()])
        }
    }

    struct BrokenAdc;

    impl SensorPort for BrokenAdc {
        async fn read_raw(&mut self, zone: Zone) -> Result<u16, SensorError> {
            match zone {
                Zone::One => Ok(512),
                Zone::Two => Err(SensorError::ReadFailed),
            }
        }
    }

    #[test]
    fn nominal_resistance_is_nominal_temperature() {
        let cfg = config();
        let t = cfg.celsius(cfg.nominal_ohms);
        assert!((t - 25.0).abs() < 0.01, "got {}", t);
    }

    #[test]
    fn divider_formula_matches_hand_calculation() {
        let cfg = config();
        // Mid-scale: R = (1023 * 100k - 511.5 * 100k) / 511.5 = 100k
        let r = cfg.resistance(511.5);
        assert!((r - 100_000.0).abs() < 1.0);
        // 100k on a 120k/3950 part is a little above 25 C.
        let t = cfg.celsius(r);
        assert!(t > 28.0 && t < 30.0, "got {}", t);
    }

    #[test]
    fn raw_for_celsius_inverts_conversion() {
        let cfg = config();
        // A 10-bit converter loses resolution fast above ~200 C on this divider.
        for target in [25.0f32, 100.0, 150.0, 185.0] {
            let raw = cfg.raw_for_celsius(target);
            let t = cfg.celsius_from_average(raw as f32);
            assert!((t - target).abs() < 2.0, "target {} got {}", target, t);
        }
    }

    #[test]
    fn cold_reading_is_a_fault() {
        let cfg = config();
        let mut ch = ChannelState::new();
        ch.update(-25.0, &cfg);
        assert!(ch.fault);
        ch.update(24.0, &cfg);
        assert!(!ch.fault);
    }

    #[test]
    fn three_consecutive_matches_flag_a_stuck_sensor() {
        let cfg = config();
        let mut ch = ChannelState::new();
        ch.update(50.0, &cfg);
        ch.update(50.0, &cfg);
        assert!(!ch.fault);
        ch.update(50.0, &cfg);
        assert!(!ch.fault);
        ch.update(50.0, &cfg);
        assert_eq!(ch.matches, 3);
        assert!(ch.fault);
        // Next in-range, different reading clears it.
        ch.update(50.5, &cfg);
        assert!(!ch.fault);
        assert_eq!(ch.matches, 0);
    }

    #[test]
    fn alternating_readings_never_match() {
        let cfg = config();
        let mut ch = ChannelState::new();
        for i in 0..20 {
            ch.update(if i % 2 == 0 { 60.0 } else { 60.25 }, &cfg);
            assert!(!ch.fault);
        }
    }

    #[test]
    fn tolerance_widens_the_match_window() {
        let cfg = ThermistorConfig {
            match_tolerance_c: 0.1,
            ..config()
        };
        let mut ch = ChannelState::new();
        for t in [70.0, 70.05, 70.0, 70.02] {
            ch.update(t, &cfg);
        }
        assert!(ch.fault);
    }

    #[test]
    fn open_and_shorted_dividers_read_as_faults() {
        let cfg = config();
        let mut ch = ChannelState::new();
        // avg = 0 -> infinite resistance
        ch.update(cfg.celsius_from_average(0.0), &cfg);
        assert!(ch.fault);
        // avg = full scale -> zero resistance
        let mut ch = ChannelState::new();
        ch.update(cfg.celsius_from_average(cfg.adc_full_scale), &cfg);
        assert!(ch.fault);
    }

    #[test]
    fn acquire_converts_both_channels() {
        let cfg = config();
        let adc = FixedAdc {
            values: [cfg.raw_for_celsius(25.0), cfg.raw_for_celsius(150.0)],
        };
        let mut thermistors = Thermistors::new(adc, cfg);
        let readings = block_on(thermistors.acquire());
        assert!((readings.temperature(Zone::One) - 25.0).abs() < 1.0);
        assert!((readings.temperature(Zone::Two) - 150.0).abs() < 2.0);
        assert!(!readings.any_fault());
    }

    #[test]
    fn constant_adc_becomes_stuck_on_fourth_acquisition() {
        let cfg = config();
        let adc = FixedAdc {
            values: [cfg.raw_for_celsius(40.0); 2],
        };
        let mut thermistors = Thermistors::new(adc, cfg);
        for _ in 0..3 {
            assert!(!block_on(thermistors.acquire()).any_fault());
        }
        let readings = block_on(thermistors.acquire());
        assert_eq!(readings.faults, FaultFlags::ZONE_1 | FaultFlags::ZONE_2);
    }

    #[test]
    fn read_error_faults_only_that_zone() {
        let mut thermistors = Thermistors::new(BrokenAdc, config());
        let readings = block_on(thermistors.acquire());
        assert!(!readings.fault(Zone::One));
        assert!(readings.fault(Zone::Two));
    }
}
