//! Heater zones and the PWM actuator port.

use serde::{Deserialize, Serialize};

/// Largest duty cycle accepted by the PWM driver (8-bit compare value).
pub const MAX_DUTY: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Zone {
    One,
    Two,
}

impl Zone {
    pub const ALL: [Zone; 2] = [Zone::One, Zone::Two];

    pub fn index(self) -> usize {
        match self {
            Zone::One => 0,
            Zone::Two => 1,
        }
    }
}

/// Output stage driving one heating element per zone.
///
/// Writes are expected to be cheap register updates; the control loop calls
/// this for both zones on every tick.
pub trait HeaterPort {
    fn set_duty_cycle(&mut self, zone: Zone, duty: u8);

    fn all_off(&mut self) {
        for zone in Zone::ALL {
            self.set_duty_cycle(zone, 0);
        }
    }
}

impl<H: HeaterPort + ?Sized> HeaterPort for &mut H {
    fn set_duty_cycle(&mut self, zone: Zone, duty: u8) {
        (**self).set_duty_cycle(zone, duty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder([u8; 2]);

    impl HeaterPort for Recorder {
        fn set_duty_cycle(&mut self, zone: Zone, duty: u8) {
            self.0[zone.index()] = duty;
        }
    }

    #[test]
    fn all_off_clears_both_zones() {
        let mut heater = Recorder([200, 17]);
        heater.all_off();
        assert_eq!(heater.0, [0, 0]);
    }
}
