//! Capture/upload cycle
//!
//! One cycle captures a frame and uploads it:
//!
//! ```text
//! Idle -> Capturing -> Uploading -> Idle             (uploaded)
//! Idle -> Capturing -> Uploading -> Backoff -> Idle  (upload failed)
//! Idle -> Capturing -> Idle                          (capture fault)
//! ```
//!
//! After an uploaded or capture-faulted cycle the next one starts after the
//! regular capture interval. A failed upload waits on a capped exponential
//! backoff that grows with each consecutive failure. Sustained failure is
//! reported to the [`HealthSink`], never acted on by stopping: the
//! controller always returns to `Idle` and tries again.

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::backoff::Backoff;
use crate::capture::{CaptureSource, ImageMetadata};
use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::health::{FailureKind, HealthReport, HealthSink, HealthStatus};
use crate::network::{Link, LinkKind, NetworkSelector};
use crate::upload::{UploadFailure, UploadResult, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Idle,
    Capturing,
    Uploading,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Uploaded {
        status: u16,
        attempts: u32,
        link: LinkKind,
    },
    CaptureFault,
    UploadFailed {
        failure: FailureKind,
        attempts: u32,
    },
}

/// What one cycle did and when the next one is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u32,
    pub outcome: CycleOutcome,
    /// State the controller waits in until the next cycle.
    pub state: ControllerState,
    pub next_delay_ms: u64,
    pub image: Option<ImageMetadata>,
    /// Health status emitted during this cycle, if any.
    pub health: Option<HealthStatus>,
}

impl CycleReport {
    pub fn next_delay(&self) -> Duration {
        Duration::from_millis(self.next_delay_ms)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Uploaded { .. })
    }

    pub fn to_vec(&self) -> Result<alloc::vec::Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }
}

impl From<UploadFailure> for FailureKind {
    fn from(failure: UploadFailure) -> Self {
        match failure {
            UploadFailure::ServerRejected { status } => Self::ServerRejected(status),
            UploadFailure::TransportError(_) => Self::Transport,
            UploadFailure::NoNetworkAvailable => Self::NoNetwork,
        }
    }
}

pub struct Controller<'a, S, M, W, H, C> {
    source: S,
    selector: NetworkSelector<M, W, C>,
    uploader: Uploader<'a, C>,
    sink: H,
    clock: C,
    interval: Duration,
    backoff: Backoff,
    failure_ceiling: u32,
    capture_fault_limit: u32,
    state: ControllerState,
    cycles: u32,
    consecutive_failures: u32,
    consecutive_capture_faults: u32,
    last_failure: Option<FailureKind>,
    fatal_reported: bool,
    fault_reported: bool,
    started_ms: u64,
}

impl<'a, S, M, W, H, C> Controller<'a, S, M, W, H, C>
where
    S: CaptureSource,
    M: Link,
    W: Link,
    H: HealthSink,
    C: Clock,
{
    pub fn new(
        config: &DeviceConfig<'a>,
        source: S,
        selector: NetworkSelector<M, W, C>,
        sink: H,
        clock: C,
    ) -> Self {
        let timing = config.timing;
        Self {
            source,
            selector,
            uploader: Uploader::new(config, clock.clone()),
            sink,
            interval: timing.capture_interval,
            backoff: Backoff::new(timing.cycle_backoff),
            failure_ceiling: timing.failure_ceiling,
            capture_fault_limit: timing.capture_fault_limit,
            state: ControllerState::Idle,
            cycles: 0,
            consecutive_failures: 0,
            consecutive_capture_faults: 0,
            last_failure: None,
            fatal_reported: false,
            fault_reported: false,
            started_ms: clock.now_ms(),
            clock,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn selector(&self) -> &NetworkSelector<M, W, C> {
        &self.selector
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &H {
        &self.sink
    }

    /// Run exactly one capture/upload cycle. The controller is left in the
    /// state it should wait in; see [`Controller::settle`].
    pub async fn cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;

        self.state = ControllerState::Capturing;
        let image = match self.source.capture().await {
            Ok(image) => image,
            Err(e) => {
                let err = Error::from(e);
                warn!("cycle {cycle}: {err}");
                return self.capture_failed();
            }
        };
        self.consecutive_capture_faults = 0;
        self.fault_reported = false;
        let metadata = image.metadata();

        self.state = ControllerState::Uploading;
        let result = self.uploader.upload(&mut self.selector, &image).await;
        drop(image);

        let mut report = match result {
            UploadResult::Success {
                status,
                attempts,
                link,
            } => self.uploaded(CycleOutcome::Uploaded {
                status,
                attempts,
                link,
            }),
            UploadResult::Failure { failure, attempts } => {
                let err = Error::from(failure);
                warn!("cycle {cycle}: {err} after {attempts} attempt(s)");
                self.upload_failed(failure, attempts)
            }
        };
        report.image = Some(metadata);
        report
    }

    /// Wait out the delay of `report`, then return to `Idle`.
    pub async fn settle(&mut self, report: &CycleReport) {
        self.clock.sleep(report.next_delay()).await;
        self.state = ControllerState::Idle;
    }

    /// Cycle until `stop` is signalled. The stop signal is raced against the
    /// whole cycle, so a stop during a bring-up, transfer or backoff takes
    /// effect at once. The network link is released before returning.
    pub async fn run<R: RawMutex>(&mut self, stop: &Signal<R, ()>) {
        info!("controller running");
        loop {
            let step = async {
                let report = self.cycle().await;
                self.settle(&report).await;
            };
            if let Either::First(()) = select(stop.wait(), step).await {
                break;
            }
        }

        info!("stop requested after {} cycle(s)", self.cycles);
        self.selector.release().await;
        self.state = ControllerState::Idle;
    }

    fn capture_failed(&mut self) -> CycleReport {
        self.consecutive_capture_faults += 1;
        self.last_failure = Some(FailureKind::Capture);
        self.state = ControllerState::Idle;

        let mut health = None;
        if self.consecutive_capture_faults >= self.capture_fault_limit && !self.fault_reported {
            error!(
                "camera failed {} cycles in a row",
                self.consecutive_capture_faults
            );
            self.fault_reported = true;
            health = Some(self.emit(HealthStatus::HardwareFault));
        }

        self.report(CycleOutcome::CaptureFault, self.interval, health)
    }

    fn uploaded(&mut self, outcome: CycleOutcome) -> CycleReport {
        let mut health = None;
        if self.fatal_reported {
            self.fatal_reported = false;
            health = Some(self.emit(HealthStatus::Recovered));
        }

        self.consecutive_failures = 0;
        self.last_failure = None;
        self.backoff.reset();
        self.state = ControllerState::Idle;
        self.report(outcome, self.interval, health)
    }

    fn upload_failed(&mut self, failure: UploadFailure, attempts: u32) -> CycleReport {
        let kind = FailureKind::from(failure);
        self.consecutive_failures += 1;
        self.last_failure = Some(kind);
        self.state = ControllerState::Backoff;

        let mut health = None;
        if self.consecutive_failures > self.failure_ceiling {
            if !self.fatal_reported {
                self.fatal_reported = true;
                health = Some(self.emit(HealthStatus::Fatal));
            }
        } else if self.consecutive_failures == 1 {
            health = Some(self.emit(HealthStatus::Degraded));
        }

        let delay = self.backoff.next_delay();
        info!("backing off for {} ms", delay.as_millis());
        self.report(
            CycleOutcome::UploadFailed {
                failure: kind,
                attempts,
            },
            delay,
            health,
        )
    }

    fn emit(&mut self, status: HealthStatus) -> HealthStatus {
        let report = HealthReport {
            status,
            cycle: self.cycles,
            consecutive_failures: self.consecutive_failures,
            consecutive_capture_faults: self.consecutive_capture_faults,
            last_failure: self.last_failure,
            uptime_ms: self.clock.now_ms().saturating_sub(self.started_ms),
        };
        self.sink.report(&report);
        status
    }

    fn report(
        &self,
        outcome: CycleOutcome,
        delay: Duration,
        health: Option<HealthStatus>,
    ) -> CycleReport {
        CycleReport {
            cycle: self.cycles,
            outcome,
            state: self.state,
            next_delay_ms: delay.as_millis(),
            image: None,
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, Encoding, FrameInfo, ImageBuffer};
    use crate::clock::ManualClock;
    use crate::config::{RawConfig, Timing};
    use crate::emulator::{EmulatedServer, LinkBehavior, ScriptedLink, synthetic_jpeg};
    use crate::health::RecordingSink;
    use crate::network::LinkError;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    /// Capture source that fails a set number of times, then succeeds.
    struct TestSource<'s> {
        faults: u32,
        captures: u32,
        stop: Option<(&'s Signal<CriticalSectionRawMutex, ()>, u32)>,
    }

    impl TestSource<'_> {
        fn ok() -> Self {
            Self::faulty(0)
        }

        fn faulty(faults: u32) -> Self {
            Self {
                faults,
                captures: 0,
                stop: None,
            }
        }
    }

    impl CaptureSource for TestSource<'_> {
        async fn capture(&mut self) -> Result<ImageBuffer, CaptureError> {
            self.captures += 1;
            let n = self.captures;
            if let Some((stop, after)) = self.stop {
                if n >= after {
                    stop.signal(());
                }
            }
            if self.faults > 0 {
                self.faults -= 1;
                return Err(CaptureError::Sensor("exposure failed"));
            }
            Ok(ImageBuffer::new(
                synthetic_jpeg(640, 480, 200, n),
                Encoding::Jpeg,
                0,
                FrameInfo {
                    width: 640,
                    height: 480,
                    quality: 6,
                },
            ))
        }
    }

    type TestController<'s> =
        Controller<'static, TestSource<'s>, ScriptedLink, ScriptedLink, RecordingSink, ManualClock>;

    fn controller<'s>(
        source: TestSource<'s>,
        server: &EmulatedServer,
        clock: &ManualClock,
    ) -> TestController<'s> {
        let config = DeviceConfig::from_raw(&RawConfig::EXAMPLE).unwrap();
        let selector = NetworkSelector::new(
            Some(ScriptedLink::new(LinkKind::Cellular, LinkBehavior::Up).with_server(server.clone())),
            None,
            &config.timing,
            clock.clone(),
        );
        Controller::new(&config, source, selector, RecordingSink::new(), clock.clone())
    }

    #[test]
    fn test_successful_cycle_returns_to_idle_after_interval() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        server.push_status(201);
        let mut controller = controller(TestSource::ok(), &server, &clock);
        assert_eq!(controller.state(), ControllerState::Idle);

        let report = block_on(controller.cycle());

        assert!(report.is_success());
        assert_eq!(report.state, ControllerState::Idle);
        assert_eq!(report.next_delay(), Timing::default().capture_interval);
        assert_eq!(report.image.map(|m| m.width), Some(640));
        assert_eq!(server.requests().len(), 1);
        assert!(controller.sink().reports().is_empty());
    }

    #[test]
    fn test_server_errors_back_off_and_report_fatal_once() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        for _ in 0..3 {
            server.push_status(500);
        }
        let mut controller = controller(TestSource::ok(), &server, &clock);

        let mut delays = alloc::vec::Vec::new();
        for _ in 0..3 {
            let report = block_on(controller.cycle());
            assert_eq!(report.state, ControllerState::Backoff);
            assert_eq!(
                report.outcome,
                CycleOutcome::UploadFailed {
                    failure: FailureKind::ServerRejected(500),
                    attempts: 1
                }
            );
            delays.push(report.next_delay());
            block_on(controller.settle(&report));
            assert_eq!(controller.state(), ControllerState::Idle);
        }

        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(delays[0], Timing::default().cycle_backoff.initial);
        let sink = controller.sink();
        assert_eq!(sink.count(HealthStatus::Fatal), 1);
        assert_eq!(sink.count(HealthStatus::Degraded), 1);
        assert_eq!(sink.reports().last().map(|r| r.consecutive_failures), Some(3));
        // Rejections are not retried by the upload pipeline.
        assert_eq!(server.requests().len(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        for _ in 0..12 {
            server.push_status(503);
        }
        let mut controller = controller(TestSource::ok(), &server, &clock);

        let mut last = Duration::from_ticks(0);
        for _ in 0..12 {
            last = block_on(controller.cycle()).next_delay();
        }

        assert_eq!(last, Timing::default().cycle_backoff.max);
        assert_eq!(controller.sink().count(HealthStatus::Fatal), 1);
    }

    #[test]
    fn test_recovery_after_fatal_resets_backoff() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        for _ in 0..3 {
            server.push_status(500);
        }
        let mut controller = controller(TestSource::ok(), &server, &clock);

        for _ in 0..3 {
            block_on(controller.cycle());
        }
        let report = block_on(controller.cycle());

        assert!(report.is_success());
        assert_eq!(report.health, Some(HealthStatus::Recovered));
        assert_eq!(controller.consecutive_failures(), 0);

        server.push_status(500);
        let report = block_on(controller.cycle());
        assert_eq!(report.next_delay(), Timing::default().cycle_backoff.initial);
    }

    #[test]
    fn test_capture_faults_stay_idle_then_report_hardware_fault() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        let mut controller = controller(TestSource::faulty(4), &server, &clock);

        for cycle in 1..=4 {
            let report = block_on(controller.cycle());
            assert_eq!(report.outcome, CycleOutcome::CaptureFault);
            assert_eq!(report.state, ControllerState::Idle);
            assert_eq!(report.next_delay(), Timing::default().capture_interval);
            let expected = (cycle == 3).then_some(HealthStatus::HardwareFault);
            assert_eq!(report.health, expected);
        }

        assert!(server.requests().is_empty());
        assert!(block_on(controller.cycle()).is_success());
    }

    #[test]
    fn test_no_network_enters_backoff() {
        let clock = ManualClock::new();
        let config = DeviceConfig::from_raw(&RawConfig::EXAMPLE).unwrap();
        let selector = NetworkSelector::new(
            Some(ScriptedLink::new(
                LinkKind::Cellular,
                LinkBehavior::Fail(LinkError::Registration("denied")),
            )),
            Some(ScriptedLink::new(
                LinkKind::Wifi,
                LinkBehavior::Fail(LinkError::Association),
            )),
            &config.timing,
            clock.clone(),
        );
        let mut controller = Controller::new(
            &config,
            TestSource::ok(),
            selector,
            RecordingSink::new(),
            clock.clone(),
        );

        let report = block_on(controller.cycle());

        assert_eq!(report.state, ControllerState::Backoff);
        assert!(matches!(
            report.outcome,
            CycleOutcome::UploadFailed {
                failure: FailureKind::NoNetwork,
                ..
            }
        ));
    }

    #[test]
    fn test_run_stops_on_signal_and_releases_link() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        let stop = Signal::<CriticalSectionRawMutex, ()>::new();
        let source = TestSource {
            stop: Some((&stop, 3)),
            ..TestSource::ok()
        };
        let mut controller = controller(source, &server, &clock);

        block_on(controller.run(&stop));

        assert_eq!(controller.cycles(), 3);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.selector().active(), None);
        assert_eq!(controller.selector().cellular().unwrap().stats().shut_downs, 1);
        assert_eq!(server.requests().len(), 3);
    }

    #[test]
    fn test_stop_during_hung_bring_up_releases_link() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        let stop = Signal::<CriticalSectionRawMutex, ()>::new();
        let source = TestSource {
            stop: Some((&stop, 1)),
            ..TestSource::ok()
        };
        let config = DeviceConfig::from_raw(&RawConfig::EXAMPLE).unwrap();
        let selector = NetworkSelector::new(
            Some(ScriptedLink::new(LinkKind::Cellular, LinkBehavior::Hang).with_server(server.clone())),
            None::<ScriptedLink>,
            &config.timing,
            clock.clone(),
        );
        let mut controller =
            Controller::new(&config, source, selector, RecordingSink::new(), clock.clone());

        block_on(controller.run(&stop));

        assert_eq!(controller.cycles(), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.selector().active(), None);
        let stats = controller.selector().cellular().unwrap().stats();
        assert_eq!(stats.bring_ups, 1);
        assert_eq!(stats.shut_downs, 1);
        assert!(server.requests().is_empty());
        assert!(clock.now_ms() < config.timing.cellular_budget().as_millis());
    }

    #[test]
    fn test_stop_before_start_runs_no_cycle() {
        let clock = ManualClock::new();
        let server = EmulatedServer::new();
        let stop = Signal::<CriticalSectionRawMutex, ()>::new();
        stop.signal(());
        let mut controller = controller(TestSource::ok(), &server, &clock);

        block_on(controller.run(&stop));

        assert_eq!(controller.cycles(), 0);
        assert!(server.requests().is_empty());
    }

    #[test]
    fn test_report_encodes_with_postcard() {
        let report = CycleReport {
            cycle: 7,
            outcome: CycleOutcome::Uploaded {
                status: 201,
                attempts: 2,
                link: LinkKind::Wifi,
            },
            state: ControllerState::Idle,
            next_delay_ms: 60_000,
            image: None,
            health: Some(HealthStatus::Recovered),
        };
        let bytes = report.to_vec().unwrap();
        let decoded: CycleReport = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, report);
    }
}
