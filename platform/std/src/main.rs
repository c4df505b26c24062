mod sim;

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use clap::Parser;
use embassy_executor::Spawner;
use embassy_time::{Duration, Instant, Timer};
use log::*;

use hotplate_controller::controller::{ControllerConfig, HotplateController};
use hotplate_controller::inputs;
use hotplate_controller::persistence::{self, ConfigStore};
use hotplate_controller::telemetry::{self, parse_command};
use hotplate_controller::{Command, RunMode, COMMAND_CHANNEL};

use crate::sim::{Line, SimEeprom, SimHeater, SimPin, SimSensor};

const BUTTON_HOLD: std::time::Duration = std::time::Duration::from_millis(30);

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StartMode {
    Constant,
    Reflow,
}

/// Hot plate controller running against a simulated plant.
///
/// Commands are read from stdin as JSON, one per line, e.g.
/// `{"Start":"Reflow"}`, `"ConfirmYes"`, `"Stop"`. The lines `+` and `-` turn
/// the encoder one step and `press` clicks its button.
#[derive(Debug, Parser)]
#[clap(version)]
struct Args {
    /// Select and confirm a run one second after boot.
    #[clap(long, value_enum)]
    auto_start: Option<StartMode>,

    /// Freeze the zone 1 thermistor this many seconds after boot.
    #[clap(long)]
    stuck_after: Option<u64>,

    #[clap(long, default_value = "25.0")]
    ambient: f32,

    /// Keep the EEPROM image in this file between runs.
    #[clap(long)]
    eeprom: Option<PathBuf>,

    /// Snapshot log interval in milliseconds.
    #[clap(long, default_value = "1000")]
    telemetry_ms: u64,
}

#[embassy_executor::task]
async fn controller_task(mut controller: HotplateController<SimSensor, SimHeater>) -> ! {
    controller.run().await
}

#[embassy_executor::task]
async fn persistence_task(mut store: ConfigStore<SimEeprom>) -> ! {
    persistence::run(&mut store).await
}

#[embassy_executor::task]
async fn telemetry_task(period: Duration) -> ! {
    telemetry::log_snapshots(period).await
}

#[embassy_executor::task]
async fn encoder_task(clk: SimPin, dt: SimPin) -> ! {
    inputs::watch_encoder(clk, dt).await
}

#[embassy_executor::task]
async fn button_task(button: SimPin) -> ! {
    inputs::watch_button(button).await
}

#[embassy_executor::task]
async fn auto_start_task(mode: RunMode) {
    Timer::after_secs(1).await;
    info!("auto start: {:?}", mode);
    let sender = COMMAND_CHANNEL.sender();
    sender.send(Command::Start(mode)).await;
    sender.send(Command::ConfirmYes).await;
}

#[embassy_executor::task]
async fn plant_log_task() -> ! {
    loop {
        let [t1, t2] = sim::temperatures();
        debug!("plant: zone 1 {:.1} C, zone 2 {:.1} C", t1, t2);
        Timer::after_secs(5).await;
    }
}

/// Blocking stdin reader on its own thread, feeding the command channel.
fn spawn_stdin_reader() {
    thread::spawn(|| {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    error!("stdin: {}", err);
                    break;
                }
            };
            match line.trim() {
                "" => continue,
                "+" => {
                    sim::rotate(true);
                    continue;
                }
                "-" => {
                    sim::rotate(false);
                    continue;
                }
                "press" => {
                    sim::press_button(BUTTON_HOLD);
                    continue;
                }
                _ => {}
            }
            match parse_command(&line) {
                Ok(command) => {
                    if COMMAND_CHANNEL.try_send(command).is_err() {
                        warn!("command queue full, dropping {:?}", command);
                    }
                }
                Err(err) => warn!("{}: {}", err, line.trim()),
            }
        }
    });
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let config = ControllerConfig::default();

    let stuck_at = args
        .stuck_after
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    sim::configure(args.ambient, config.thermistor, stuck_at);

    let mut store = ConfigStore::new(SimEeprom::open(args.eeprom.clone()));
    let params = store.load_or_default().await;

    let controller = HotplateController::new(SimSensor, SimHeater, params, config);

    spawner.spawn(sim::physics_task().unwrap());
    spawner.spawn(persistence_task(store).unwrap());
    spawner.spawn(telemetry_task(Duration::from_millis(args.telemetry_ms)).unwrap());
    spawner.spawn(plant_log_task().unwrap());
    spawner.spawn(encoder_task(SimPin(Line::EncoderClk), SimPin(Line::EncoderDt)).unwrap());
    spawner.spawn(button_task(SimPin(Line::Button)).unwrap());
    spawner.spawn(controller_task(controller).unwrap());

    if let Some(mode) = args.auto_start {
        let mode = match mode {
            StartMode::Constant => RunMode::Constant,
            StartMode::Reflow => RunMode::Reflow,
        };
        spawner.spawn(auto_start_task(mode).unwrap());
    }

    spawn_stdin_reader();
}
