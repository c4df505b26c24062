//! Non-volatile storage of the operator parameters.
//!
//! Byte layout, starting at the store's base address:
//!
//! | offset | size | content                                            |
//! |--------|------|----------------------------------------------------|
//! | 0      | 1    | magic `0x5A`                                       |
//! | 1      | 1    | layout version                                     |
//! | 2      | 14   | profile, 7 x u16 big-endian, stored as-is          |
//! | 16     | 12   | gains kp/ki/kd zone 1 then zone 2, u16 hundredths  |
//! | 28     | 2    | constant-temperature setpoint, u16                 |
//! | 30     | 1    | CRC-8 (Dallas/Maxim) over bytes 0..30              |
//!
//! Gains are written as `round(value * 100)` and read back as `stored / 100.0`,
//! so anything past the second decimal is lost on a save/load cycle. The
//! editor moves gains in 0.01 steps, which keeps committed values exact.

use core::fmt;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};

use crate::log::*;
use crate::parameters::{Gains, ParameterError, Parameters, PidTuning, GAIN_SCALE};
use crate::profile::ReflowProfile;

pub const MAGIC: u8 = 0x5A;
pub const LAYOUT_VERSION: u8 = 1;
pub const RECORD_LEN: usize = 31;

/// Write cycle of a typical byte-programmed EEPROM.
pub const DEFAULT_WRITE_CYCLE: Duration = Duration::from_millis(10);

const CRC_OFFSET: usize = RECORD_LEN - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    Read,
    Write,
    /// Read-back after a save did not match what was written.
    Verify { address: u16 },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Read => write!(f, "storage read failed"),
            StorageError::Write => write!(f, "storage write failed"),
            StorageError::Verify { address } => {
                write!(f, "verify failed at address {}", address)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    Storage(StorageError),
    /// Magic byte missing: never written, or erased.
    Uninitialized,
    UnsupportedVersion(u8),
    Checksum { stored: u8, computed: u8 },
    Invalid(ParameterError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Storage(err) => write!(f, "{}", err),
            LoadError::Uninitialized => write!(f, "no saved configuration"),
            LoadError::UnsupportedVersion(v) => write!(f, "unsupported layout version {}", v),
            LoadError::Checksum { stored, computed } => write!(
                f,
                "checksum mismatch (stored {:#04x}, computed {:#04x})",
                stored, computed
            ),
            LoadError::Invalid(err) => write!(f, "stored values rejected: {}", err),
        }
    }
}

impl From<StorageError> for LoadError {
    fn from(err: StorageError) -> Self {
        LoadError::Storage(err)
    }
}

/// Byte-addressed non-volatile memory.
pub trait PersistentStore {
    fn read_bytes(
        &mut self,
        address: u16,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), StorageError>>;

    /// Program `bytes` starting at `address`. The caller paces consecutive
    /// calls by the device write cycle.
    fn write_bytes(&mut self, address: u16, bytes: &[u8])
        -> impl Future<Output = Result<(), StorageError>>;
}

/// Dallas/Maxim CRC-8, reflected polynomial 0x8C.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut data_byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ data_byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            data_byte >>= 1;
        }
    }
    crc
}

fn gain_to_fixed(value: f32) -> u16 {
    let scaled = libm::roundf(value * GAIN_SCALE);
    if scaled <= 0.0 {
        0
    } else if scaled >= u16::MAX as f32 {
        u16::MAX
    } else {
        scaled as u16
    }
}

fn fixed_to_gain(value: u16) -> f32 {
    value as f32 / GAIN_SCALE
}

pub fn encode(params: &Parameters) -> [u8; RECORD_LEN] {
    let p = &params.profile;
    let mut words = [0u16; 14];
    words[..7].copy_from_slice(&[
        p.ramp_target_temp,
        p.ramp_duration,
        p.soak_target_temp,
        p.soak_duration,
        p.reflow_target_temp,
        p.reflow_duration,
        p.hold_duration,
    ]);
    for (i, gains) in params.tuning.zones.iter().enumerate() {
        words[7 + i * 3] = gain_to_fixed(gains.kp);
        words[8 + i * 3] = gain_to_fixed(gains.ki);
        words[9 + i * 3] = gain_to_fixed(gains.kd);
    }
    words[13] = params.constant_temp;

    let mut record = [0u8; RECORD_LEN];
    record[0] = MAGIC;
    record[1] = LAYOUT_VERSION;
    for (i, word) in words.iter().enumerate() {
        record[2 + i * 2..4 + i * 2].copy_from_slice(&word.to_be_bytes());
    }
    record[CRC_OFFSET] = crc8(&record[..CRC_OFFSET]);
    record
}

pub fn decode(record: &[u8; RECORD_LEN]) -> Result<Parameters, LoadError> {
    if record[0] != MAGIC {
        return Err(LoadError::Uninitialized);
    }
    if record[1] != LAYOUT_VERSION {
        return Err(LoadError::UnsupportedVersion(record[1]));
    }
    let computed = crc8(&record[..CRC_OFFSET]);
    if computed != record[CRC_OFFSET] {
        return Err(LoadError::Checksum {
            stored: record[CRC_OFFSET],
            computed,
        });
    }

    let word = |i: usize| u16::from_be_bytes([record[2 + i * 2], record[3 + i * 2]]);
    let gains = |zone: usize| Gains {
        kp: fixed_to_gain(word(7 + zone * 3)),
        ki: fixed_to_gain(word(8 + zone * 3)),
        kd: fixed_to_gain(word(9 + zone * 3)),
    };

    let params = Parameters {
        profile: ReflowProfile {
            ramp_target_temp: word(0),
            ramp_duration: word(1),
            soak_target_temp: word(2),
            soak_duration: word(3),
            reflow_target_temp: word(4),
            reflow_duration: word(5),
            hold_duration: word(6),
        },
        tuning: PidTuning {
            zones: [gains(0), gains(1)],
        },
        constant_temp: word(13),
    };
    params.validate().map_err(LoadError::Invalid)?;
    Ok(params)
}

pub struct ConfigStore<S> {
    store: S,
    base_address: u16,
    write_cycle: Duration,
}

impl<S: PersistentStore> ConfigStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            base_address: 0,
            write_cycle: DEFAULT_WRITE_CYCLE,
        }
    }

    pub fn with_base_address(mut self, address: u16) -> Self {
        self.base_address = address;
        self
    }

    pub fn with_write_cycle(mut self, write_cycle: Duration) -> Self {
        self.write_cycle = write_cycle;
        self
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Persist `params`. Only bytes that differ from the stored image are
    /// programmed, one at a time, each followed by the write-cycle wait. The
    /// whole record is read back and compared before reporting success.
    pub async fn save(&mut self, params: &Parameters) -> Result<(), StorageError> {
        let record = encode(params);
        let mut stored = [0u8; RECORD_LEN];
        self.store.read_bytes(self.base_address, &mut stored).await?;

        let mut written = 0usize;
        for (offset, (&new, &old)) in record.iter().zip(stored.iter()).enumerate() {
            if new == old {
                continue;
            }
            let address = self.base_address + offset as u16;
            self.store.write_bytes(address, &[new]).await?;
            written += 1;
            if self.write_cycle.as_ticks() > 0 {
                Timer::after(self.write_cycle).await;
            }
        }

        self.store.read_bytes(self.base_address, &mut stored).await?;
        if let Some(offset) = record.iter().zip(stored.iter()).position(|(a, b)| a != b) {
            let address = self.base_address + offset as u16;
            error!("configuration verify failed at {}", address);
            return Err(StorageError::Verify { address });
        }

        info!("configuration saved ({} bytes programmed)", written);
        Ok(())
    }

    pub async fn load(&mut self) -> Result<Parameters, LoadError> {
        let mut record = [0u8; RECORD_LEN];
        self.store.read_bytes(self.base_address, &mut record).await?;
        decode(&record)
    }

    /// Load the stored configuration, falling back to the built-in defaults
    /// when the store is blank, corrupt, or holds implausible values.
    pub async fn load_or_default(&mut self) -> Parameters {
        match self.load().await {
            Ok(params) => {
                info!("configuration loaded from storage");
                params
            }
            Err(LoadError::Uninitialized) => {
                info!("no saved configuration, using defaults");
                Parameters::default()
            }
            Err(err) => {
                warn!("ignoring saved configuration: {}", err);
                Parameters::default()
            }
        }
    }
}

pub static SAVE_REQUESTS: Channel<CriticalSectionRawMutex, Parameters, 1> = Channel::new();
pub static SAVE_RESULT: Signal<CriticalSectionRawMutex, Result<(), StorageError>> = Signal::new();

/// Persistence worker. Runs beside the control loop so EEPROM write latency
/// never delays a control tick.
pub async fn run<S: PersistentStore>(store: &mut ConfigStore<S>) -> ! {
    let receiver = SAVE_REQUESTS.receiver();
    loop {
        let params = receiver.receive().await;
        let result = store.save(&params).await;
        if let Err(err) = result {
            error!("saving configuration failed: {}", err);
        }
        SAVE_RESULT.signal(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heater::Zone;
    use embassy_futures::block_on;

    struct MemoryEeprom {
        bytes: [u8; 64],
        writes: usize,
        fail_writes: bool,
        corrupt_on_write: bool,
    }

    impl MemoryEeprom {
        fn blank() -> Self {
            Self {
                bytes: [0xFF; 64],
                writes: 0,
                fail_writes: false,
                corrupt_on_write: false,
            }
        }
    }

    impl PersistentStore for MemoryEeprom {
        async fn read_bytes(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
            let start = address as usize;
            let end = start + buf.len();
            if end > self.bytes.len() {
                return Err(StorageError::Read);
            }
            buf.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        async fn write_bytes(&mut self, address: u16, bytes: &[u8]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(StorageError::Write);
            }
            let start = address as usize;
            for (i, b) in bytes.iter().enumerate() {
                self.bytes[start + i] = if self.corrupt_on_write { !*b } else { *b };
                self.writes += 1;
            }
            Ok(())
        }
    }

    fn store(eeprom: MemoryEeprom) -> ConfigStore<MemoryEeprom> {
        ConfigStore::new(eeprom).with_write_cycle(Duration::from_ticks(0))
    }

    #[test]
    fn crc8_known_vector() {
        // Maxim application note 27 example ROM code.
        let rom = [0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(crc8(&rom), 0xA2);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn blank_store_falls_back_to_defaults() {
        let mut cfg = store(MemoryEeprom::blank());
        assert_eq!(block_on(cfg.load()), Err(LoadError::Uninitialized));
        assert_eq!(block_on(cfg.load_or_default()), Parameters::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut params = Parameters::default();
        params.profile.reflow_target_temp = 230;
        params.profile.hold_duration = 60;
        params.tuning.zones[0] = Gains {
            kp: 12.34,
            ki: 0.07,
            kd: 101.5,
        };
        params.constant_temp = 150;

        let mut cfg = store(MemoryEeprom::blank());
        block_on(cfg.save(&params)).unwrap();
        let loaded = block_on(cfg.load()).unwrap();

        assert_eq!(loaded.profile, params.profile);
        assert_eq!(loaded.constant_temp, 150);
        for zone in Zone::ALL {
            let (a, b) = (params.tuning.gains(zone), loaded.tuning.gains(zone));
            for (x, y) in [(a.kp, b.kp), (a.ki, b.ki), (a.kd, b.kd)] {
                assert!((x - y).abs() <= 0.01, "{} vs {}", x, y);
            }
        }
    }

    #[test]
    fn gains_are_quantized_to_hundredths() {
        let mut params = Parameters::default();
        params.tuning.zones[1].kp = 1.23456;
        let decoded = decode(&encode(&params)).unwrap();
        assert!((decoded.tuning.zones[1].kp - 1.23).abs() < 1e-5);
    }

    #[test]
    fn unchanged_bytes_are_not_rewritten() {
        let mut cfg = store(MemoryEeprom::blank());
        let params = Parameters::default();
        block_on(cfg.save(&params)).unwrap();
        let first = cfg.inner().writes;
        assert!(first > 0);

        block_on(cfg.save(&params)).unwrap();
        assert_eq!(cfg.inner().writes, first);

        let mut edited = params;
        edited.constant_temp = 36;
        block_on(cfg.save(&edited)).unwrap();
        // One data byte plus the checksum.
        assert_eq!(cfg.inner().writes, first + 2);
    }

    #[test]
    fn write_failure_is_reported() {
        let mut eeprom = MemoryEeprom::blank();
        eeprom.fail_writes = true;
        let mut cfg = store(eeprom);
        assert_eq!(
            block_on(cfg.save(&Parameters::default())),
            Err(StorageError::Write)
        );
    }

    #[test]
    fn verify_catches_bad_cells() {
        let mut eeprom = MemoryEeprom::blank();
        eeprom.corrupt_on_write = true;
        let mut cfg = store(eeprom);
        assert!(matches!(
            block_on(cfg.save(&Parameters::default())),
            Err(StorageError::Verify { .. })
        ));
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut record = encode(&Parameters::default());
        record[5] ^= 0x10;
        assert!(matches!(decode(&record), Err(LoadError::Checksum { .. })));

        let mut record = encode(&Parameters::default());
        record[1] = 9;
        assert_eq!(decode(&record), Err(LoadError::UnsupportedVersion(9)));
    }

    #[test]
    fn implausible_values_with_valid_checksum_are_rejected() {
        let mut params = Parameters::default();
        params.profile.soak_duration = 10;
        let record = encode(&params);
        assert!(matches!(decode(&record), Err(LoadError::Invalid(_))));
    }

    #[test]
    fn base_address_offsets_the_record() {
        let mut cfg = store(MemoryEeprom::blank()).with_base_address(8);
        block_on(cfg.save(&Parameters::default())).unwrap();
        assert_eq!(cfg.inner().bytes[8], MAGIC);
        assert_eq!(cfg.inner().bytes[0], 0xFF);
        assert_eq!(block_on(cfg.load()), Ok(Parameters::default()));
    }
}
