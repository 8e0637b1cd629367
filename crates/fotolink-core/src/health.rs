//! Device-health reporting
//!
//! The controller never stops on its own; sustained failure is surfaced to
//! an outer supervisor through a [`HealthSink`] instead. Reports are plain
//! serde records so a sink can forward them as compact postcard frames.

use alloc::vec::Vec;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

/// Largest encoded [`HealthReport`].
pub const MAX_REPORT_BYTES: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Cycles are failing but the ceiling has not been crossed yet.
    Degraded,
    /// More consecutive failures than the configured ceiling.
    Fatal,
    /// The capture source keeps faulting.
    HardwareFault,
    /// A successful cycle after a fatal streak.
    Recovered,
}

/// Which part of the cycle failed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Capture,
    NoNetwork,
    Transport,
    ServerRejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Cycle counter at the time of the report, starting at 1.
    pub cycle: u32,
    pub consecutive_failures: u32,
    pub consecutive_capture_faults: u32,
    pub last_failure: Option<FailureKind>,
    pub uptime_ms: u64,
}

impl HealthReport {
    /// Encode into `buf`, returning the used prefix.
    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Receiver of device-health reports, implemented by the outer supervisor.
pub trait HealthSink {
    fn report(&mut self, report: &HealthReport);
}

impl<T: HealthSink + ?Sized> HealthSink for &mut T {
    fn report(&mut self, report: &HealthReport) {
        (**self).report(report);
    }
}

/// Sink that only writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn report(&mut self, report: &HealthReport) {
        match report.status {
            HealthStatus::Fatal => error!(
                "device health FATAL: {} consecutive failed cycles (last {:?})",
                report.consecutive_failures, report.last_failure
            ),
            HealthStatus::HardwareFault => error!(
                "camera fault: {} consecutive capture failures",
                report.consecutive_capture_faults
            ),
            HealthStatus::Degraded => warn!(
                "device degraded: {} consecutive failed cycles",
                report.consecutive_failures
            ),
            HealthStatus::Recovered => info!("device recovered at cycle {}", report.cycle),
        }
    }
}

/// Sink that keeps every report, for tests and the simulator.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    reports: Vec<HealthReport>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> &[HealthReport] {
        &self.reports
    }

    pub fn count(&self, status: HealthStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }
}

impl HealthSink for RecordingSink {
    fn report(&mut self, report: &HealthReport) {
        LogHealthSink.report(report);
        self.reports.push(*report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> HealthReport {
        HealthReport {
            status: HealthStatus::Fatal,
            cycle: 12,
            consecutive_failures: 4,
            consecutive_capture_faults: 0,
            last_failure: Some(FailureKind::ServerRejected(500)),
            uptime_ms: 3_600_000,
        }
    }

    #[test]
    fn test_report_fits_fixed_buffer() {
        let mut buf = [0u8; MAX_REPORT_BYTES];
        let used = report().encode(&mut buf).unwrap().len();
        assert!(used <= MAX_REPORT_BYTES);
        assert_eq!(HealthReport::decode(&buf[..used]).unwrap(), report());
    }

    #[test]
    fn test_vec_encoding_matches_slice() {
        let mut buf = [0u8; MAX_REPORT_BYTES];
        let slice = report().encode(&mut buf).unwrap().to_vec();
        assert_eq!(report().to_vec().unwrap(), slice);
    }

    #[test]
    fn test_recording_sink_counts_by_status() {
        let mut sink = RecordingSink::new();
        sink.report(&report());
        sink.report(&HealthReport {
            status: HealthStatus::Recovered,
            ..report()
        });
        sink.report(&report());

        assert_eq!(sink.count(HealthStatus::Fatal), 2);
        assert_eq!(sink.count(HealthStatus::Recovered), 1);
        assert_eq!(sink.reports().len(), 3);
    }
}
