//! Mode controller: owns the run session and drives both heater zones.
//!
//! ```text
//! Initializing -> Idle -> Armed(mode) -> Running(session) <-> ConfirmStop(session)
//!                  ^          |               |                     |
//!                  +----------+ ConfirmNo     +-- fault --> Faulted +-- ConfirmYes --> Idle
//!                  +--------------------- Stop -----------------+
//! ```
//!
//! Every tick ends with both actuators written. Outside of a healthy run the
//! written value is 0, and a fault detected during a run zeroes both zones in
//! the same tick it is seen.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker};

use crate::heater::{HeaterPort, Zone};
use crate::inputs::{self, InputEvent};
use crate::log::*;
use crate::parameters::{Parameter, ParameterError, ParameterStore, Parameters};
use crate::persistence::{StorageError, SAVE_REQUESTS, SAVE_RESULT};
use crate::pid::{Mode, PidController, DEFAULT_SAMPLE_PERIOD};
use crate::profile::{Phase, ProfileRun};
use crate::thermistor::{FaultFlags, Readings, SensorPort, ThermistorConfig, Thermistors};
use crate::timer::IntervalTimer;
use crate::{
    Command, RunMode, SaveStatus, Snapshot, Status, COMMAND_CHANNEL, CONTROLLER_STATE,
    CONTROL_TICK_MILLIS, VERSION,
};

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub tick_period: Duration,
    pub pid_sample_period: Duration,
    /// Sensor re-read cadence while no run is active.
    pub idle_refresh_period: Duration,
    /// Above this either plate is reported as too hot to touch.
    pub hot_warning_c: f32,
    pub max_duty: u8,
    pub thermistor: ThermistorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(CONTROL_TICK_MILLIS as u64),
            pid_sample_period: DEFAULT_SAMPLE_PERIOD,
            idle_refresh_period: Duration::from_secs(10),
            hot_warning_c: 40.0,
            max_duty: crate::heater::MAX_DUTY,
            thermistor: ThermistorConfig::default(),
        }
    }
}

/// State of one run, from confirmation until stop or fault.
#[derive(Debug, Clone, Copy)]
pub struct RunSession {
    mode: RunMode,
    profile_run: Option<ProfileRun>,
    seconds: IntervalTimer,
    elapsed_seconds: u32,
    setpoint: f32,
}

impl RunSession {
    pub fn start(mode: RunMode, initial_temp: f32, now: Instant) -> Self {
        Self {
            mode,
            profile_run: match mode {
                RunMode::Reflow => Some(ProfileRun::start(initial_temp)),
                RunMode::Constant => None,
            },
            seconds: IntervalTimer::new(Duration::from_secs(1), now),
            elapsed_seconds: 0,
            setpoint: 0.0,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn phase(&self) -> Option<Phase> {
        self.profile_run.map(|run| run.phase())
    }

    pub fn initial_temp(&self) -> Option<f32> {
        self.profile_run.map(|run| run.initial_temp())
    }

    pub fn elapsed_seconds(&self) -> u32 {
        self.elapsed_seconds
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    /// True once the reflow profile has reached its terminal phase.
    pub fn is_cooling(&self) -> bool {
        self.profile_run.is_some_and(|run| run.is_complete())
    }

    /// Count the seconds that passed since the last update and recompute the
    /// setpoint. The seconds counter stops once the profile is cooling.
    pub fn update(&mut self, now: Instant, params: &Parameters) -> f32 {
        let seconds = self.seconds.poll(now);
        match self.profile_run.as_mut() {
            Some(run) => {
                if !run.is_complete() {
                    self.elapsed_seconds = self.elapsed_seconds.saturating_add(seconds);
                }
                let before = run.phase();
                self.setpoint = run.advance(&params.profile, self.elapsed_seconds);
                if run.phase() != before {
                    info!(
                        "entering {} at {} s",
                        run.phase().to_str(),
                        self.elapsed_seconds
                    );
                }
            }
            None => {
                self.elapsed_seconds = self.elapsed_seconds.saturating_add(seconds);
                self.setpoint = params.constant_temp as f32;
            }
        }
        self.setpoint
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Initializing,
    Idle,
    Armed(RunMode),
    Running(RunSession),
    ConfirmStop(RunSession),
    Faulted(FaultFlags),
}

pub struct HotplateController<S, H> {
    config: ControllerConfig,
    thermistors: Thermistors<S>,
    heater: H,
    pids: [PidController; 2],
    params: ParameterStore,
    state: State,
    readings: Readings,
    idle_refresh: Option<IntervalTimer>,
    duty: [u8; 2],
    save_status: SaveStatus,
    pending_save: Option<Parameters>,
    save_in_flight: bool,
}

impl<S: SensorPort, H: HeaterPort> HotplateController<S, H> {
    pub fn new(sensor: S, heater: H, params: Parameters, config: ControllerConfig) -> Self {
        let mut store = ParameterStore::default();
        if let Err(err) = store.replace(params) {
            warn!("rejecting initial parameters: {}", err);
        }
        let tuning = *store.tuning();
        let make_pid = |zone: Zone| {
            PidController::from_gains(tuning.gains(zone))
                .with_output_limits(0.0, config.max_duty as f32)
                .with_sample_period(config.pid_sample_period)
        };
        Self {
            config,
            thermistors: Thermistors::new(sensor, config.thermistor),
            heater,
            pids: [make_pid(Zone::One), make_pid(Zone::Two)],
            params: store,
            state: State::Initializing,
            readings: Readings::default(),
            idle_refresh: None,
            duty: [0; 2],
            save_status: SaveStatus::Idle,
            pending_save: None,
            save_in_flight: false,
        }
    }

    pub fn status(&self) -> Status {
        match self.state {
            State::Initializing => Status::Initializing,
            State::Idle => Status::Idle,
            State::Armed(_) => Status::Armed,
            State::Running(_) => Status::Running,
            State::ConfirmStop(_) => Status::ConfirmStop,
            State::Faulted(_) => Status::Faulted,
        }
    }

    pub fn session(&self) -> Option<&RunSession> {
        match &self.state {
            State::Running(session) | State::ConfirmStop(session) => Some(session),
            _ => None,
        }
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    pub fn readings(&self) -> Readings {
        self.readings
    }

    pub fn pid(&self, zone: Zone) -> &PidController {
        &self.pids[zone.index()]
    }

    pub fn heater(&self) -> &H {
        &self.heater
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        self.thermistors.sensor_mut()
    }

    pub fn save_status(&self) -> SaveStatus {
        self.save_status
    }

    /// Apply one operator command. Commands that make no sense in the current
    /// state are ignored; only a rejected parameter commit is an error.
    pub async fn handle_command(
        &mut self,
        command: Command,
        now: Instant,
    ) -> Result<(), ParameterError> {
        match (command, self.state) {
            (Command::Start(mode), State::Idle) => {
                info!("{:?} run selected, waiting for confirmation", mode);
                self.state = State::Armed(mode);
            }
            (Command::ConfirmYes, State::Armed(mode)) => self.enter_running(mode, now).await,
            (Command::ConfirmNo, State::Armed(_)) => {
                info!("start cancelled");
                self.state = State::Idle;
            }
            (Command::Stop, State::Armed(_)) => self.state = State::Idle,
            (Command::Stop, State::Running(session)) => {
                self.state = State::ConfirmStop(session);
            }
            (Command::ConfirmYes, State::ConfirmStop(session)) => {
                info!("run stopped after {} s", session.elapsed_seconds());
                self.enter_idle(now);
            }
            (Command::ConfirmNo, State::ConfirmStop(session)) => {
                self.state = State::Running(session);
            }
            (Command::Stop, State::Faulted(flags)) => {
                info!("fault {:?} acknowledged", flags.bits());
                self.enter_idle(now);
            }
            (Command::BeginEdit(parameter), _) => self.params.begin_edit(parameter),
            (Command::Adjust(steps), _) => self.params.adjust(steps),
            (Command::CancelEdit, _) => self.params.cancel_edit(),
            (Command::CommitEdit, _) => self.commit_edit()?,
            (Command::Save, _) => self.request_save(),
            (command, _) => debug!("ignoring {:?} while {:?}", command, self.status()),
        }
        Ok(())
    }

    /// Map raw operator input onto commands: rotation moves the open edit,
    /// a press commits it, or asks to stop a running session.
    pub async fn handle_input(
        &mut self,
        event: InputEvent,
        now: Instant,
    ) -> Result<(), ParameterError> {
        let editing = self.params.pending().is_some();
        let command = match (event, self.state) {
            (InputEvent::Rotation(steps), _) if editing => Command::Adjust(steps),
            (InputEvent::ButtonPressed, _) if editing => Command::CommitEdit,
            (InputEvent::ButtonPressed, State::Running(_)) => Command::Stop,
            _ => return Ok(()),
        };
        self.handle_command(command, now).await
    }

    fn commit_edit(&mut self) -> Result<(), ParameterError> {
        let reflowing = matches!(
            self.session().map(RunSession::mode),
            Some(RunMode::Reflow)
        );
        if let Some(edit) = self.params.pending() {
            if reflowing && edit.parameter.affects_reflow() {
                warn!("{:?} cannot change during a reflow run", edit.parameter);
                return Err(ParameterError::Busy);
            }
        }
        match self.params.commit_edit() {
            Ok(parameter) => {
                info!("{:?} updated", parameter);
                if let Parameter::Gain(..) = parameter {
                    self.apply_tuning();
                }
                Ok(())
            }
            Err(err) => {
                warn!("edit rejected: {}", err);
                Err(err)
            }
        }
    }

    fn apply_tuning(&mut self) {
        for zone in Zone::ALL {
            let gains = self.params.tuning().gains(zone);
            self.pids[zone.index()].apply_gains(gains);
        }
    }

    fn request_save(&mut self) {
        self.pending_save = Some(*self.params.current());
        self.save_status = SaveStatus::InProgress;
    }

    /// Exchange work with the persistence task. One save is in flight at a
    /// time; a request made meanwhile waits here, replacing any older one that
    /// was not sent yet, and a request the queue refuses is retried on the
    /// next call. The status always describes the newest request.
    pub fn service_saves<const N: usize>(
        &mut self,
        requests: &Channel<CriticalSectionRawMutex, Parameters, N>,
        results: &Signal<CriticalSectionRawMutex, Result<(), StorageError>>,
    ) {
        if self.save_in_flight {
            if let Some(result) = results.try_take() {
                self.save_in_flight = false;
                self.on_save_complete(result);
            }
        }
        if self.save_in_flight {
            return;
        }
        if let Some(params) = self.pending_save {
            if requests.try_send(params).is_ok() {
                self.pending_save = None;
                self.save_in_flight = true;
            } else {
                debug!("persistence queue busy, save deferred");
            }
        }
    }

    fn on_save_complete(&mut self, result: Result<(), StorageError>) {
        if let Err(err) = result {
            error!("configuration not saved: {}", err);
        }
        self.save_status = match result {
            _ if self.pending_save.is_some() => SaveStatus::InProgress,
            Ok(()) => SaveStatus::Saved,
            Err(_) => SaveStatus::Failed,
        };
    }

    async fn enter_running(&mut self, mode: RunMode, now: Instant) {
        self.readings = self.thermistors.acquire().await;
        if self.readings.any_fault() {
            error!("refusing to start, sensor fault {:?}", self.readings.faults.bits());
            self.enter_faulted(self.readings.faults);
            return;
        }
        let session = RunSession::start(mode, self.readings.average(), now);
        self.apply_tuning();
        for pid in self.pids.iter_mut() {
            pid.set_mode(Mode::Automatic);
        }
        info!(
            "{:?} run started at {} C",
            mode,
            self.readings.average()
        );
        self.state = State::Running(session);
    }

    fn enter_idle(&mut self, now: Instant) {
        self.force_outputs_off();
        self.idle_refresh = Some(IntervalTimer::new(self.config.idle_refresh_period, now));
        self.state = State::Idle;
    }

    fn enter_faulted(&mut self, flags: FaultFlags) {
        self.force_outputs_off();
        self.state = State::Faulted(flags);
    }

    fn force_outputs_off(&mut self) {
        for pid in self.pids.iter_mut() {
            pid.force_off();
        }
        self.duty = [0; 2];
        self.heater.all_off();
    }

    /// One control step: acquisition, state machine, PID, actuators, in that
    /// order. Returns the snapshot for the display.
    pub async fn tick(&mut self, now: Instant) -> Snapshot {
        match self.state {
            State::Initializing => {
                info!("hot plate controller {}", VERSION);
                self.readings = self.thermistors.acquire().await;
                self.enter_idle(now);
            }
            State::Idle | State::Armed(_) => {
                let period = self.config.idle_refresh_period;
                let refresh = self
                    .idle_refresh
                    .get_or_insert_with(|| IntervalTimer::new(period, now));
                if refresh.expired(now) {
                    self.readings = self.thermistors.acquire().await;
                }
            }
            State::Faulted(latched) => {
                self.readings = self.thermistors.acquire().await;
                self.state = State::Faulted(latched | self.readings.faults);
            }
            State::Running(_) | State::ConfirmStop(_) => {
                self.readings = self.thermistors.acquire().await;
                if self.readings.any_fault() {
                    error!(
                        "sensor fault {:?} during run, heaters off",
                        self.readings.faults.bits()
                    );
                    self.enter_faulted(self.readings.faults);
                }
            }
        }

        match &mut self.state {
            State::Running(session) | State::ConfirmStop(session) => {
                let setpoint = session.update(now, self.params.current());
                let cooling = session.is_cooling();
                for zone in Zone::ALL {
                    let pid = &mut self.pids[zone.index()];
                    if cooling {
                        pid.force_off();
                    } else {
                        pid.compute(now, self.readings.temperature(zone), setpoint);
                    }
                    self.duty[zone.index()] = pid.duty();
                }
            }
            _ => {
                for pid in self.pids.iter_mut() {
                    pid.force_off();
                }
                self.duty = [0; 2];
            }
        }

        for zone in Zone::ALL {
            self.heater.set_duty_cycle(zone, self.duty[zone.index()]);
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> Snapshot {
        let session = self.session();
        let latched = match self.state {
            State::Faulted(flags) => flags,
            _ => FaultFlags::empty(),
        };
        let faults = latched | self.readings.faults;
        let hot = Zone::ALL
            .iter()
            .any(|&zone| self.readings.temperature(zone) > self.config.hot_warning_c);
        Snapshot {
            status: self.status(),
            run_mode: session.map(RunSession::mode).or(match self.state {
                State::Armed(mode) => Some(mode),
                _ => None,
            }),
            phase: session.and_then(RunSession::phase),
            temp1: self.readings.temperature(Zone::One),
            temp2: self.readings.temperature(Zone::Two),
            setpoint: session.map_or(0.0, RunSession::setpoint),
            elapsed_seconds: session.map_or(0, RunSession::elapsed_seconds),
            fault1: faults.contains(FaultFlags::ZONE_1),
            fault2: faults.contains(FaultFlags::ZONE_2),
            pending_edit: self.params.working_value(),
            duty1: self.duty[0],
            duty2: self.duty[1],
            plates_hot: hot,
            save_status: self.save_status,
        }
    }

    /// Control loop. Drains operator commands and input, exchanges work with
    /// the persistence task, ticks, and publishes the snapshot.
    pub async fn run(&mut self) -> ! {
        let mut ticker = Ticker::every(self.config.tick_period);
        let commands = COMMAND_CHANNEL.receiver();
        let state = CONTROLLER_STATE.sender();
        loop {
            let now = Instant::now();
            while let Ok(command) = commands.try_receive() {
                if let Err(err) = self.handle_command(command, now).await {
                    warn!("{:?} rejected: {}", command, err);
                }
            }
            for event in inputs::drain() {
                if let Err(err) = self.handle_input(event, now).await {
                    warn!("input rejected: {}", err);
                }
            }

            self.service_saves(&SAVE_REQUESTS, &SAVE_RESULT);

            let snapshot = self.tick(Instant::now()).await;
            state.send(snapshot);
            ticker.next().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DEFAULT_PROFILE;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn constant_session_follows_configured_temperature() {
        let mut params = Parameters::default();
        let mut session = RunSession::start(RunMode::Constant, 22.0, at(0));
        assert_eq!(session.update(at(0), &params), 35.0);
        params.constant_temp = 80;
        assert_eq!(session.update(at(2500), &params), 80.0);
        assert_eq!(session.elapsed_seconds(), 2);
        assert_eq!(session.phase(), None);
    }

    #[test]
    fn elapsed_is_frozen_once_cooling() {
        let params = Parameters::default();
        let mut session = RunSession::start(RunMode::Reflow, 25.0, at(0));
        let end = DEFAULT_PROFILE.total_duration() as u64;
        session.update(at(end * 1000), &params);
        assert!(session.is_cooling());
        assert_eq!(session.elapsed_seconds(), end as u32);
        session.update(at((end + 30) * 1000), &params);
        assert_eq!(session.elapsed_seconds(), end as u32);
        assert_eq!(session.setpoint(), 0.0);
    }

    #[test]
    fn reflow_session_snapshots_initial_temperature() {
        let params = Parameters::default();
        let mut session = RunSession::start(RunMode::Reflow, 30.0, at(0));
        assert_eq!(session.initial_temp(), Some(30.0));
        assert_eq!(session.update(at(0), &params), 30.0);
        assert_eq!(session.phase(), Some(Phase::Ramp));
    }
}
