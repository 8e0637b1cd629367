//! WiFi station link
//!
//! The radio stack (association, DHCP, sockets, TLS) lives behind
//! [`WifiDriver`]; [`WifiStation`] adds the link lifecycle and bounded I/O.

use core::future::Future;

use embassy_time::Duration;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use super::{Link, LinkError, LinkKind, Transport};
use crate::clock::Clock;
use crate::config::{Endpoint, WifiCredentials};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    #[error("access point not found")]
    NetworkNotFound,
    #[error("authentication rejected")]
    AuthFailed,
    #[error("no address from DHCP")]
    NoAddress,
    #[error("could not resolve host")]
    Dns,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TLS handshake failed")]
    Tls,
    #[error("connection reset")]
    ConnectionReset,
    #[error("socket I/O failed")]
    Io,
}

/// Station-mode WiFi stack with a single client socket.
pub trait WifiDriver {
    /// Associate with `ssid` and obtain an address. `None` joins an open
    /// network.
    fn join(
        &mut self,
        ssid: &str,
        passphrase: Option<&str>,
    ) -> impl Future<Output = Result<(), WifiError>>;

    fn is_associated(&mut self) -> impl Future<Output = bool>;

    fn connect(
        &mut self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> impl Future<Output = Result<(), WifiError>>;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), WifiError>>;

    /// `Ok(0)` when the server closed the connection.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, WifiError>>;

    fn disconnect(&mut self) -> impl Future<Output = ()>;

    fn leave(&mut self) -> impl Future<Output = ()>;
}

pub struct WifiStation<'a, D, C> {
    driver: D,
    credentials: WifiCredentials<'a>,
    clock: C,
    associated: bool,
    connected: bool,
}

impl<'a, D: WifiDriver, C: Clock> WifiStation<'a, D, C> {
    pub fn new(driver: D, credentials: WifiCredentials<'a>, clock: C) -> Self {
        Self {
            driver,
            credentials,
            clock,
            associated: false,
            connected: false,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: WifiDriver, C: Clock> Transport for WifiStation<'_, D, C> {
    async fn open(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        if !self.associated {
            return Err(LinkError::NotUp);
        }
        if self.connected {
            self.close().await;
        }

        self.driver
            .connect(endpoint.host, endpoint.port, endpoint.is_secure())
            .await
            .map_err(|e| {
                warn!("connect to {}:{} failed: {e}", endpoint.host, endpoint.port);
                LinkError::ConnectFailed
            })?;
        self.connected = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::ConnectFailed);
        }
        self.driver.send(data).await.map_err(|e| {
            warn!("WiFi send failed: {e}");
            LinkError::Dropped("send")
        })
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.connected {
            return Err(LinkError::ConnectFailed);
        }
        match self.clock.timeout(timeout, self.driver.recv(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                warn!("WiFi receive failed: {e}");
                Err(LinkError::Dropped("receive"))
            }
            Err(_) => Err(LinkError::Timeout("receive")),
        }
    }

    async fn close(&mut self) {
        if self.connected {
            self.driver.disconnect().await;
            self.connected = false;
        }
    }
}

impl<D: WifiDriver, C: Clock> Link for WifiStation<'_, D, C> {
    fn kind(&self) -> LinkKind {
        LinkKind::Wifi
    }

    async fn bring_up(&mut self) -> Result<(), LinkError> {
        if self.associated {
            return Ok(());
        }

        let WifiCredentials { ssid, passphrase } = self.credentials;
        debug!("joining {ssid}");
        self.driver.join(ssid, passphrase).await.map_err(|e| {
            warn!("joining {ssid} failed: {e}");
            LinkError::Association
        })?;

        info!("associated with {ssid}");
        self.associated = true;
        Ok(())
    }

    async fn probe(&mut self) -> bool {
        self.associated && self.driver.is_associated().await
    }

    async fn shut_down(&mut self) {
        self.close().await;
        if self.associated {
            self.driver.leave().await;
        }
        self.associated = false;
    }
}
