//! Upload pipeline
//!
//! Sends one image as one HTTP request over a link lent by the
//! [`NetworkSelector`]. A 2xx reply is success. Any other status is an
//! application rejection and is handed back at once. Transport failures
//! (no link, connection drop, timeout, unusable reply) are retried up to the
//! configured bound with a non-decreasing backoff, acquiring a link afresh
//! before each attempt. The pipeline keeps no state between calls.

use embassy_time::Duration;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::capture::ImageBuffer;
use crate::clock::Clock;
use crate::config::{DeviceConfig, Endpoint};
use crate::http::{Credentials, post_image};
use crate::network::{Link, LinkError, LinkKind, NetworkSelector, Transport};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    #[error("server rejected the upload with status {status}")]
    ServerRejected { status: u16 },
    #[error("transport failure: {0}")]
    TransportError(LinkError),
    #[error("no network available")]
    NoNetworkAvailable,
}

impl UploadFailure {
    /// Short, stable name for telemetry.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ServerRejected { .. } => "server-rejected",
            Self::TransportError(_) => "transport",
            Self::NoNetworkAvailable => "no-network",
        }
    }
}

/// Outcome of one [`Uploader::upload`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Success {
        status: u16,
        attempts: u32,
        link: LinkKind,
    },
    Failure {
        failure: UploadFailure,
        attempts: u32,
    },
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<u16, UploadFailure> {
        match self {
            Self::Success { status, .. } => Ok(status),
            Self::Failure { failure, .. } => Err(failure),
        }
    }
}

/// Serializable summary of an upload, for cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub status: Option<u16>,
    pub attempts: u32,
    pub link: Option<LinkKind>,
}

impl From<UploadResult> for UploadSummary {
    fn from(result: UploadResult) -> Self {
        match result {
            UploadResult::Success {
                status,
                attempts,
                link,
            } => Self {
                status: Some(status),
                attempts,
                link: Some(link),
            },
            UploadResult::Failure { failure, attempts } => Self {
                status: match failure {
                    UploadFailure::ServerRejected { status } => Some(status),
                    _ => None,
                },
                attempts,
                link: None,
            },
        }
    }
}

pub struct Uploader<'a, C> {
    endpoint: Endpoint<'a>,
    credentials: Credentials<'a>,
    http_timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
    clock: C,
}

impl<'a, C: Clock> Uploader<'a, C> {
    pub fn new(config: &DeviceConfig<'a>, clock: C) -> Self {
        Self {
            endpoint: config.endpoint,
            credentials: Credentials {
                scheme: config.auth,
                api_key: config.api_key,
            },
            http_timeout: config.timing.http_timeout,
            max_retries: config.timing.upload_retries,
            backoff: config.timing.upload_backoff,
            clock,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upload `image`, retrying transport failures.
    pub async fn upload<M, W, S>(
        &self,
        selector: &mut NetworkSelector<M, W, S>,
        image: &ImageBuffer,
    ) -> UploadResult
    where
        M: Link,
        W: Link,
        S: Clock,
    {
        let mut backoff = Backoff::new(self.backoff);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let failure = match selector.acquire().await {
                Err(_) => UploadFailure::NoNetworkAvailable,
                Ok(mut handle) => {
                    let link = handle.kind();
                    match self.attempt(&mut handle, image).await {
                        Ok(status) if (200..300).contains(&status) => {
                            info!("upload accepted with {status} over {link} after {attempts} attempt(s)");
                            return UploadResult::Success {
                                status,
                                attempts,
                                link,
                            };
                        }
                        Ok(status) => {
                            warn!("upload rejected with {status}");
                            return UploadResult::Failure {
                                failure: UploadFailure::ServerRejected { status },
                                attempts,
                            };
                        }
                        Err(e) => UploadFailure::TransportError(e),
                    }
                }
            };

            if let UploadFailure::TransportError(e) = failure {
                if e.is_link_down() {
                    selector.mark_broken().await;
                }
            }

            if attempts > self.max_retries {
                warn!("upload failed after {attempts} attempts: {failure}");
                return UploadResult::Failure { failure, attempts };
            }

            let delay = backoff.next_delay();
            warn!(
                "upload attempt {attempts} failed ({failure}); retrying in {} ms",
                delay.as_millis()
            );
            self.clock.sleep(delay).await;
        }
    }

    /// One bounded HTTP exchange.
    async fn attempt<T: Transport>(&self, transport: &mut T, image: &ImageBuffer) -> Result<u16, LinkError> {
        let exchange = post_image(
            transport,
            &self.endpoint,
            &self.credentials,
            image,
            self.http_timeout,
        );

        match self.clock.timeout(self.http_timeout, exchange).await {
            Ok(result) => result.map_err(LinkError::from),
            Err(_) => {
                transport.close().await;
                Err(LinkError::Timeout("HTTP exchange"))
            }
        }
    }
}
