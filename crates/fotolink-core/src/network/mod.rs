//! Network selection
//!
//! Two transports can carry an upload: a cellular socket through the SIM7600
//! and a WiFi station. [`NetworkSelector`] owns both, brings up the preferred
//! one first (cellular by default) and falls back to the other. Each bring-up
//! runs under its own budget, so a full acquisition is bounded by the sum of
//! the per-link budgets. A link that stops answering its keep-alive probe, or
//! is marked broken after failed I/O, is shut down; the next acquisition then
//! waits on a capped exponential backoff before touching the radio again.

pub mod cellular;
pub mod wifi;

use core::fmt;
use core::future::Future;

use embassy_time::Duration;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::at::AtError;
use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::{Endpoint, Timing};
use crate::modem::ModemError;

pub use cellular::CellularLink;
pub use wifi::{WifiDriver, WifiError, WifiStation};

/// Bound on shutting a failed link down.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    Cellular,
    Wifi,
}

impl LinkKind {
    pub const fn other(self) -> Self {
        match self {
            Self::Cellular => Self::Wifi,
            Self::Wifi => Self::Cellular,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cellular => "cellular",
            Self::Wifi => "wifi",
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("no network link could be brought up")]
    NoNetworkAvailable,
    #[error("link bring-up timed out")]
    BringupTimeout,
    #[error("network registration failed: {0}")]
    Registration(&'static str),
    #[error("WiFi association failed")]
    Association,
    #[error("link is not up")]
    NotUp,
    #[error("could not connect to the server")]
    ConnectFailed,
    #[error("connection dropped during {0}")]
    Dropped(&'static str),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("unusable reply from the server: {0}")]
    BadReply(&'static str),
    #[error("modem: {0}")]
    Modem(ModemError),
    #[error("AT session: {0}")]
    At(AtError),
    #[error("WiFi driver: {0}")]
    Wifi(WifiError),
}

impl LinkError {
    /// Whether the failure means the link itself is gone, as opposed to a
    /// single connection failing.
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            Self::NotUp
                | Self::Association
                | Self::Registration(_)
                | Self::Modem(_)
                | Self::At(AtError::Modem(_))
        )
    }
}

impl From<ModemError> for LinkError {
    fn from(err: ModemError) -> Self {
        Self::Modem(err)
    }
}

impl From<AtError> for LinkError {
    fn from(err: AtError) -> Self {
        match err {
            AtError::Modem(modem) => Self::Modem(modem),
            other => Self::At(other),
        }
    }
}

impl From<WifiError> for LinkError {
    fn from(err: WifiError) -> Self {
        Self::Wifi(err)
    }
}

/// One byte-stream connection to the upload server at a time.
pub trait Transport {
    /// Open a connection to `endpoint` (TLS for `https://`).
    fn open(&mut self, endpoint: &Endpoint<'_>) -> impl Future<Output = Result<(), LinkError>>;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), LinkError>>;

    /// Read what the server sent next. `Ok(0)` means the server closed.
    fn read(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, LinkError>>;

    /// Close the connection; never fails.
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// An IP-capable link that can be brought up and torn down.
pub trait Link: Transport {
    fn kind(&self) -> LinkKind;

    fn bring_up(&mut self) -> impl Future<Output = Result<(), LinkError>>;

    /// Cheap keep-alive check of an established link.
    fn probe(&mut self) -> impl Future<Output = bool>;

    fn shut_down(&mut self) -> impl Future<Output = ()>;
}

/// Placeholder for a transport that is not fitted.
pub enum NoLink {}

impl Transport for NoLink {
    async fn open(&mut self, _: &Endpoint<'_>) -> Result<(), LinkError> {
        match *self {}
    }

    async fn write(&mut self, _: &[u8]) -> Result<(), LinkError> {
        match *self {}
    }

    async fn read(&mut self, _: &mut [u8], _: Duration) -> Result<usize, LinkError> {
        match *self {}
    }

    async fn close(&mut self) {
        match *self {}
    }
}

impl Link for NoLink {
    fn kind(&self) -> LinkKind {
        match *self {}
    }

    async fn bring_up(&mut self) -> Result<(), LinkError> {
        match *self {}
    }

    async fn probe(&mut self) -> bool {
        match *self {}
    }

    async fn shut_down(&mut self) {
        match *self {}
    }
}

/// An established link, lent out by the selector for one upload attempt.
pub enum NetworkHandle<'a, M, W> {
    Cellular(&'a mut M),
    Wifi(&'a mut W),
}

impl<M: Link, W: Link> NetworkHandle<'_, M, W> {
    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Cellular(_) => LinkKind::Cellular,
            Self::Wifi(_) => LinkKind::Wifi,
        }
    }
}

impl<M: Link, W: Link> Transport for NetworkHandle<'_, M, W> {
    async fn open(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        match self {
            Self::Cellular(link) => link.open(endpoint).await,
            Self::Wifi(link) => link.open(endpoint).await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        match self {
            Self::Cellular(link) => link.write(data).await,
            Self::Wifi(link) => link.write(data).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        match self {
            Self::Cellular(link) => link.read(buf, timeout).await,
            Self::Wifi(link) => link.read(buf, timeout).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Cellular(link) => link.close().await,
            Self::Wifi(link) => link.close().await,
        }
    }
}

pub struct NetworkSelector<M, W, C> {
    cellular: Option<M>,
    wifi: Option<W>,
    preferred: LinkKind,
    active: Option<LinkKind>,
    /// Link whose bring-up is in flight; set while `acquire` waits on it.
    starting: Option<LinkKind>,
    cellular_budget: Duration,
    wifi_budget: Duration,
    probe_timeout: Duration,
    reacquire: Backoff,
    /// The last acquisition failed or the active link was lost.
    degraded: bool,
    clock: C,
}

impl<M, W, C> NetworkSelector<M, W, C>
where
    M: Link,
    W: Link,
    C: Clock,
{
    pub fn new(cellular: Option<M>, wifi: Option<W>, timing: &Timing, clock: C) -> Self {
        Self {
            cellular,
            wifi,
            preferred: LinkKind::Cellular,
            active: None,
            starting: None,
            cellular_budget: timing.cellular_budget(),
            wifi_budget: timing.wifi_budget(),
            probe_timeout: timing.at_command_timeout,
            reacquire: Backoff::new(timing.reacquire_backoff),
            degraded: false,
            clock,
        }
    }

    pub fn with_preferred(mut self, preferred: LinkKind) -> Self {
        self.preferred = preferred;
        self
    }

    /// Combined worst-case time of one acquisition, excluding backoff.
    pub fn budget(&self) -> Duration {
        let mut total = Duration::from_ticks(0);
        if self.cellular.is_some() {
            total += self.cellular_budget + SHUTDOWN_BUDGET;
        }
        if self.wifi.is_some() {
            total += self.wifi_budget + SHUTDOWN_BUDGET;
        }
        total
    }

    pub fn active(&self) -> Option<LinkKind> {
        self.active
    }

    /// Acquire a link, preferred transport first.
    pub async fn acquire(&mut self) -> Result<NetworkHandle<'_, M, W>, LinkError> {
        self.acquire_with(self.preferred).await
    }

    pub async fn acquire_with(
        &mut self,
        preferred: LinkKind,
    ) -> Result<NetworkHandle<'_, M, W>, LinkError> {
        if let Some(kind) = self.active {
            if self.probe_link(kind).await {
                return self.handle(kind);
            }
            warn!("{kind} link lost");
            self.shut_down_link(kind).await;
            self.active = None;
            self.degraded = true;
        }

        if self.degraded {
            let delay = self.reacquire.next_delay();
            info!("waiting {} ms before re-acquiring a link", delay.as_millis());
            self.clock.sleep(delay).await;
        }

        for kind in [preferred, preferred.other()] {
            match self.bring_up_link(kind).await {
                Some(Ok(())) => {
                    info!("{kind} link up");
                    self.active = Some(kind);
                    self.degraded = false;
                    self.reacquire.reset();
                    return self.handle(kind);
                }
                Some(Err(e)) => warn!("{kind} link failed: {e}"),
                None => {}
            }
        }

        warn!("no network available");
        self.degraded = true;
        Err(LinkError::NoNetworkAvailable)
    }

    /// Declare the active link dead after failed I/O.
    pub async fn mark_broken(&mut self) {
        if let Some(kind) = self.active.take() {
            warn!("{kind} link marked broken");
            self.shut_down_link(kind).await;
            self.degraded = true;
        }
    }

    /// Shut down the active link, e.g. on stop. A link left half up by a
    /// cancelled `acquire` is shut down as well.
    pub async fn release(&mut self) {
        if let Some(kind) = self.starting.take() {
            info!("abandoning {kind} bring-up");
            self.shut_down_link(kind).await;
        }
        if let Some(kind) = self.active.take() {
            info!("releasing {kind} link");
            self.shut_down_link(kind).await;
        }
    }

    pub fn cellular(&self) -> Option<&M> {
        self.cellular.as_ref()
    }

    pub fn wifi(&self) -> Option<&W> {
        self.wifi.as_ref()
    }

    fn handle(&mut self, kind: LinkKind) -> Result<NetworkHandle<'_, M, W>, LinkError> {
        match kind {
            LinkKind::Cellular => self
                .cellular
                .as_mut()
                .map(NetworkHandle::Cellular)
                .ok_or(LinkError::NotUp),
            LinkKind::Wifi => self
                .wifi
                .as_mut()
                .map(NetworkHandle::Wifi)
                .ok_or(LinkError::NotUp),
        }
    }

    async fn bring_up_link(&mut self, kind: LinkKind) -> Option<Result<(), LinkError>> {
        self.starting = Some(kind);
        let result = match kind {
            LinkKind::Cellular => match self.cellular.as_mut() {
                Some(link) => Some(bring_up(link, &self.clock, self.cellular_budget).await),
                None => None,
            },
            LinkKind::Wifi => match self.wifi.as_mut() {
                Some(link) => Some(bring_up(link, &self.clock, self.wifi_budget).await),
                None => None,
            },
        };
        self.starting = None;
        result
    }

    async fn probe_link(&mut self, kind: LinkKind) -> bool {
        let probed = match kind {
            LinkKind::Cellular => match self.cellular.as_mut() {
                Some(link) => self.clock.timeout(self.probe_timeout, link.probe()).await,
                None => return false,
            },
            LinkKind::Wifi => match self.wifi.as_mut() {
                Some(link) => self.clock.timeout(self.probe_timeout, link.probe()).await,
                None => return false,
            },
        };
        probed.unwrap_or(false)
    }

    async fn shut_down_link(&mut self, kind: LinkKind) {
        let done = match kind {
            LinkKind::Cellular => match self.cellular.as_mut() {
                Some(link) => self.clock.timeout(SHUTDOWN_BUDGET, link.shut_down()).await,
                None => Ok(()),
            },
            LinkKind::Wifi => match self.wifi.as_mut() {
                Some(link) => self.clock.timeout(SHUTDOWN_BUDGET, link.shut_down()).await,
                None => Ok(()),
            },
        };
        if done.is_err() {
            warn!("{kind} link did not shut down in time");
        }
    }
}

async fn bring_up<L: Link, C: Clock>(
    link: &mut L,
    clock: &C,
    budget: Duration,
) -> Result<(), LinkError> {
    info!(
        "bringing up {} link (budget {} ms)",
        link.kind(),
        budget.as_millis()
    );

    let result = match clock.timeout(budget, link.bring_up()).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::BringupTimeout),
    };

    if result.is_err() && clock.timeout(SHUTDOWN_BUDGET, link.shut_down()).await.is_err() {
        warn!("{} link did not shut down in time", link.kind());
    }
    result
}
