use thiserror_no_std::Error as ThisError;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::hardware::HardwareError;
use crate::modem::ModemError;
use crate::network::LinkError;
use crate::upload::UploadFailure;

/// Top-level failure of a fotolink operation.
///
/// Component errors convert into this with `?`; the variants follow the
/// failure classes the controller distinguishes when it decides whether to
/// retry, back off, or report a fault.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("configuration is invalid: {0}")]
    ConfigInvalid(ConfigError),
    #[error("modem did not become ready in time")]
    ModemBringupTimeout,
    #[error("no data on the modem UART before the deadline")]
    UartTimeout,
    #[error("modem failure: {0}")]
    Modem(ModemError),
    #[error("image capture failed: {0}")]
    CaptureFault(CaptureError),
    #[error("no network link could be brought up")]
    NoNetworkAvailable,
    #[error("transport failure: {0}")]
    TransportError(LinkError),
    #[error("server rejected the upload with status {0}")]
    ServerRejected(u16),
    #[error("peripheral error: {0}")]
    Peripheral(HardwareError),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::ConfigInvalid(err)
    }
}

impl From<ModemError> for Error {
    fn from(err: ModemError) -> Self {
        match err {
            ModemError::BringupTimeout => Self::ModemBringupTimeout,
            ModemError::UartTimeout { .. } => Self::UartTimeout,
            other => Self::Modem(other),
        }
    }
}

impl From<CaptureError> for Error {
    fn from(err: CaptureError) -> Self {
        Self::CaptureFault(err)
    }
}

impl From<LinkError> for Error {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NoNetworkAvailable => Self::NoNetworkAvailable,
            other => Self::TransportError(other),
        }
    }
}

impl From<HardwareError> for Error {
    fn from(err: HardwareError) -> Self {
        Self::Peripheral(err)
    }
}

impl From<UploadFailure> for Error {
    fn from(failure: UploadFailure) -> Self {
        match failure {
            UploadFailure::ServerRejected { status } => Self::ServerRejected(status),
            UploadFailure::TransportError(err) => Self::TransportError(err),
            UploadFailure::NoNetworkAvailable => Self::NoNetworkAvailable,
        }
    }
}
