//! Host simulator for a fotolink camera node.
//!
//! Runs the real controller, modem driver, cellular and WiFi links, camera
//! driver and upload path against the in-memory SIM7600, access point,
//! sensor and HTTP server from `fotolink_core::emulator`. Time is virtual, so
//! a day of capture cycles finishes in well under a second.
//!
//! # Environment
//!
//! | Variable            | Meaning                          | Default   |
//! |---------------------|----------------------------------|-----------|
//! | `FOTOLINK_SCENARIO` | Failure scenario, see below      | `nominal` |
//! | `FOTOLINK_CYCLES`   | Capture cycles before stopping   | `8`       |
//! | `RUST_LOG`          | Log filter                       | `info`    |
//!
//! # Scenarios
//!
//! | Name            | What goes wrong                                  |
//! |-----------------|--------------------------------------------------|
//! | `nominal`       | Nothing                                          |
//! | `cellular-down` | Registration is denied; uploads go over WiFi     |
//! | `flaky`         | Every third upload loses its connection          |
//! | `server-error`  | The server answers every upload with 500         |
//! | `offline`       | Modem dead and access point out of range         |
//! | `camera-fault`  | Every exposure fails                             |
//!
//! The device configuration comes from `device.env` (see
//! `device.env.example`) and is baked in at build time.

use std::env;
use std::process::ExitCode;

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{error, info, warn};

use fotolink_core::capture::{Camera, CaptureError, CaptureSource, ImageBuffer};
use fotolink_core::clock::{Clock, ManualClock};
use fotolink_core::config::DeviceConfig;
use fotolink_core::controller::Controller;
use fotolink_core::emulator::{
    EmulatedBoard, EmulatedPin, EmulatedSerial, EmulatedServer, EmulatedWifi, Registration,
    SensorFault, Sim7600Emulator, SyntheticSensor,
};
use fotolink_core::hardware::bring_up;
use fotolink_core::health::{HealthStatus, RecordingSink};
use fotolink_core::modem::Modem;
use fotolink_core::network::{CellularLink, NetworkSelector, WifiStation};

mod device {
    include!(concat!(env!("OUT_DIR"), "/device_config.rs"));
}

const DEFAULT_CYCLES: u32 = 8;

type StopSignal = Signal<CriticalSectionRawMutex, ()>;

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Nominal,
    CellularDown,
    Flaky,
    ServerError,
    Offline,
    CameraFault,
}

impl Scenario {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "nominal" => Some(Self::Nominal),
            "cellular-down" => Some(Self::CellularDown),
            "flaky" => Some(Self::Flaky),
            "server-error" => Some(Self::ServerError),
            "offline" => Some(Self::Offline),
            "camera-fault" => Some(Self::CameraFault),
            _ => None,
        }
    }
}

/// Handles kept for scripting faults and reading results after the run.
struct Bench {
    sim: Sim7600Emulator,
    wifi: Option<EmulatedWifi>,
    server: EmulatedServer,
    sensor: SyntheticSensor,
}

impl Bench {
    fn apply(&self, scenario: Scenario, cycles: u32) {
        match scenario {
            Scenario::Nominal => {}
            Scenario::CellularDown => self.sim.set_registration(Registration::Denied),
            Scenario::Flaky => {
                for n in 0..cycles {
                    if n % 3 == 2 {
                        self.server.push_drop();
                    } else {
                        self.server.push_status(201);
                    }
                }
            }
            Scenario::ServerError => self.server.set_default_status(500),
            Scenario::Offline => {
                self.sim.set_dead(true);
                if let Some(wifi) = &self.wifi {
                    wifi.set_in_range(false);
                }
            }
            Scenario::CameraFault => self.sensor.inject(SensorFault::Exposure),
        }
    }
}

// ---------------------------------------------------------------------------
// Capture budget
// ---------------------------------------------------------------------------

/// Wraps the camera and raises the stop signal on the last budgeted capture.
/// The controller sees the stop at that cycle's next wait, so a cycle still
/// bringing up a link or backing off is cut short there.
struct Budgeted<'s, S> {
    inner: S,
    remaining: u32,
    stop: &'s StopSignal,
}

impl<S: CaptureSource> CaptureSource for Budgeted<'_, S> {
    async fn capture(&mut self) -> Result<ImageBuffer, CaptureError> {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.stop.signal(());
        }
        self.inner.capture().await
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scenario_name = env::var("FOTOLINK_SCENARIO").unwrap_or_else(|_| "nominal".into());
    let Some(scenario) = Scenario::from_name(&scenario_name) else {
        error!("unknown scenario {scenario_name:?}");
        return ExitCode::FAILURE;
    };
    let cycles = match env::var("FOTOLINK_CYCLES") {
        Ok(value) => match value.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                error!("FOTOLINK_CYCLES must be a positive integer, got {value:?}");
                return ExitCode::FAILURE;
            }
        },
        Err(_) => DEFAULT_CYCLES,
    };

    let mut board = EmulatedBoard::new();
    let (config, peripherals) = match bring_up(&device::DEVICE, &mut board) {
        Ok(parts) => parts,
        Err(e) => {
            error!("configuration rejected: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("starting fotolink simulator: scenario {scenario_name}, {cycles} cycle(s)");
    log_config(&config);

    let clock = ManualClock::new();
    let server = EmulatedServer::new();

    let sim = Sim7600Emulator::new();
    sim.attach_server(server.clone());
    sim.wire(&peripherals.modem);
    let modem = Modem::new(sim.serial(), peripherals.modem, clock.clone(), config.timing);
    let cellular: CellularLink<'_, EmulatedSerial, EmulatedPin, ManualClock> =
        CellularLink::new(modem, &config);

    let wifi = config
        .wifi
        .map(|creds| EmulatedWifi::new(creds.ssid, creds.passphrase, server.clone()));
    let station = config.wifi.zip(wifi.clone()).map(|(creds, radio)| {
        WifiStation::new(radio, creds, clock.clone())
    });
    if station.is_none() {
        warn!("no WiFi configured, cellular only");
    }

    let sensor = SyntheticSensor::new();
    let bench = Bench {
        sim,
        wifi,
        server,
        sensor: sensor.clone(),
    };
    bench.apply(scenario, cycles);

    let stop = StopSignal::new();
    let camera = Budgeted {
        inner: Camera::new(sensor, peripherals.camera, &config, clock.clone()),
        remaining: cycles,
        stop: &stop,
    };
    let selector = NetworkSelector::new(Some(cellular), station, &config.timing, clock.clone());
    let mut controller = Controller::new(
        &config,
        camera,
        selector,
        RecordingSink::new(),
        clock.clone(),
    );

    block_on(controller.run(&stop));

    summarize(&bench, controller.sink(), &clock);
    ExitCode::SUCCESS
}

fn log_config(config: &DeviceConfig<'_>) {
    info!(
        "upload target {}://{}:{}{}",
        if config.endpoint.is_secure() { "https" } else { "http" },
        config.endpoint.host,
        config.endpoint.port,
        config.endpoint.path
    );
    info!(
        "modem PWRKEY {} RESET {}, APN {}",
        config.modem.power,
        config
            .modem
            .reset
            .map_or_else(|| "unwired".into(), |pin| pin.to_string()),
        config.apn
    );
    info!(
        "capture every {} s, {} upload retries",
        config.timing.capture_interval.as_secs(),
        config.timing.upload_retries
    );
}

fn summarize(bench: &Bench, sink: &RecordingSink, clock: &ManualClock) {
    let requests = bench.server.requests();
    let bytes: usize = requests.iter().map(|r| r.body.len()).sum();

    info!("--- summary ---");
    info!("virtual time elapsed: {} s", clock.now_ms() / 1000);
    info!("exposures: {}", bench.sensor.exposures());
    info!("requests received: {} ({bytes} bytes)", requests.len());
    info!(
        "modem power-key pulses: {}, AT commands: {}",
        bench.sim.power_key_pulses(),
        bench.sim.command_log().len()
    );
    if let Some(wifi) = &bench.wifi {
        info!("wifi joins: {}", wifi.joins());
    }
    info!(
        "health reports: {} (degraded {}, fatal {}, hardware {}, recovered {})",
        sink.reports().len(),
        sink.count(HealthStatus::Degraded),
        sink.count(HealthStatus::Fatal),
        sink.count(HealthStatus::HardwareFault),
        sink.count(HealthStatus::Recovered)
    );
    for report in sink.reports() {
        match report.to_vec() {
            Ok(frame) => info!("  {report:?} ({} byte frame)", frame.len()),
            Err(e) => warn!("  {report:?} (not encodable: {e})"),
        }
    }
}
