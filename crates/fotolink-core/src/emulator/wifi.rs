use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use log::debug;

use super::server::{Connection, EmulatedServer};
use crate::network::{WifiDriver, WifiError};

struct WifiInner {
    ssid: String,
    passphrase: Option<String>,
    in_range: bool,
    associated: bool,
    joins: u32,
    server: EmulatedServer,
    connection: Option<Connection>,
}

/// Access point plus station stack. Clones share the radio, so a test can
/// take the access point out of range under a running station.
#[derive(Clone)]
pub struct EmulatedWifi {
    inner: Rc<RefCell<WifiInner>>,
}

impl EmulatedWifi {
    pub fn new(ssid: &str, passphrase: Option<&str>, server: EmulatedServer) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WifiInner {
                ssid: String::from(ssid),
                passphrase: passphrase.map(String::from),
                in_range: true,
                associated: false,
                joins: 0,
                server,
                connection: None,
            })),
        }
    }

    pub fn set_in_range(&self, in_range: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.in_range = in_range;
        if !in_range {
            inner.associated = false;
            inner.connection = None;
        }
    }

    pub fn joins(&self) -> u32 {
        self.inner.borrow().joins
    }
}

impl WifiDriver for EmulatedWifi {
    async fn join(&mut self, ssid: &str, passphrase: Option<&str>) -> Result<(), WifiError> {
        let mut inner = self.inner.borrow_mut();
        inner.joins += 1;
        if !inner.in_range || inner.ssid != ssid {
            return Err(WifiError::NetworkNotFound);
        }
        if inner.passphrase.as_deref() != passphrase {
            return Err(WifiError::AuthFailed);
        }
        debug!("wifi: {ssid} associated");
        inner.associated = true;
        Ok(())
    }

    async fn is_associated(&mut self) -> bool {
        let inner = self.inner.borrow();
        inner.associated && inner.in_range
    }

    async fn connect(&mut self, _host: &str, _port: u16, tls: bool) -> Result<(), WifiError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.associated {
            return Err(WifiError::ConnectionRefused);
        }
        let connection = inner.server.connect(tls);
        inner.connection = Some(connection);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), WifiError> {
        let mut inner = self.inner.borrow_mut();
        match inner.connection.as_mut() {
            Some(connection) if !connection.is_closed() => {
                connection.feed(data);
                Ok(())
            }
            _ => Err(WifiError::ConnectionReset),
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, WifiError> {
        poll_fn(|_| {
            let mut inner = self.inner.borrow_mut();
            let Some(connection) = inner.connection.as_mut() else {
                return Poll::Ready(Err(WifiError::ConnectionReset));
            };
            if connection.has_output() || connection.is_closed() {
                Poll::Ready(Ok(connection.read(buf)))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    async fn disconnect(&mut self) {
        self.inner.borrow_mut().connection = None;
    }

    async fn leave(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.associated = false;
        inner.connection = None;
    }
}
