//! JSON view of the controller for a serial console or host log.

use core::fmt;

use embassy_time::{Duration, Timer};
use heapless::String;
use serde_json_core::{de::from_str, ser::to_string};

use crate::log::*;
use crate::{Command, Snapshot, CONTROLLER_STATE};

pub const SNAPSHOT_JSON_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryError {
    /// Encoded snapshot did not fit the output buffer.
    BufferFull,
    Malformed,
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::BufferFull => write!(f, "snapshot too large for buffer"),
            TelemetryError::Malformed => write!(f, "malformed command"),
        }
    }
}

pub fn snapshot_to_json(snapshot: &Snapshot) -> Result<String<SNAPSHOT_JSON_LEN>, TelemetryError> {
    to_string(snapshot).map_err(|_| TelemetryError::BufferFull)
}

/// Parse one line of input, e.g. `"ConfirmYes"` or `{"Start":"Reflow"}`.
pub fn parse_command(line: &str) -> Result<Command, TelemetryError> {
    let line = line.trim();
    from_str::<Command>(line)
        .map(|(command, _)| command)
        .map_err(|_| TelemetryError::Malformed)
}

/// Log the latest snapshot as JSON every `period`.
pub async fn log_snapshots(period: Duration) -> ! {
    let Some(mut receiver) = CONTROLLER_STATE.receiver() else {
        error!("no free state receiver, telemetry disabled");
        loop {
            Timer::after(Duration::from_secs(3600)).await;
        }
    };
    loop {
        let snapshot = receiver.get().await;
        match snapshot_to_json(&snapshot) {
            Ok(json) => info!("{}", json.as_str()),
            Err(err) => warn!("{}", err),
        }
        Timer::after(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SaveStatus, Status};

    fn idle_snapshot() -> Snapshot {
        Snapshot {
            status: Status::Idle,
            run_mode: None,
            phase: None,
            temp1: 24.5,
            temp2: 25.0,
            setpoint: 0.0,
            elapsed_seconds: 0,
            fault1: false,
            fault2: false,
            pending_edit: None,
            duty1: 0,
            duty2: 0,
            plates_hot: false,
            save_status: SaveStatus::Idle,
        }
    }

    #[test]
    fn snapshot_encodes_to_json() {
        let json = snapshot_to_json(&idle_snapshot()).unwrap();
        assert!(json.starts_with("{\"status\":\"Idle\""), "{}", json);
        assert!(json.contains("\"temp1\":24.5"), "{}", json);
        assert!(json.contains("\"run_mode\":null"), "{}", json);
        assert!(json.contains("\"plates_hot\":false"), "{}", json);
    }

    #[test]
    fn parses_unit_commands() {
        assert_eq!(parse_command("\"ConfirmYes\""), Ok(Command::ConfirmYes));
        assert_eq!(parse_command("  \"Stop\"\n"), Ok(Command::Stop));
        assert_eq!(parse_command("\"Save\""), Ok(Command::Save));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_command("launch"), Err(TelemetryError::Malformed));
        assert_eq!(parse_command("\"Explode\""), Err(TelemetryError::Malformed));
    }
}
