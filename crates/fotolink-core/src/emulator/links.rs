use core::cell::Cell;
use core::future::{pending, poll_fn};
use core::task::Poll;

use embassy_time::Duration;

use super::server::{Connection, EmulatedServer};
use crate::config::Endpoint;
use crate::network::{Link, LinkError, LinkKind, Transport};

/// What a [`ScriptedLink`] does when brought up or probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    Up,
    Fail(LinkError),
    /// Bring-up never completes.
    Hang,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub bring_ups: u32,
    pub probes: u32,
    pub shut_downs: u32,
    pub connections: u32,
}

/// Link whose bring-up and probe results are scripted, with connections
/// served by an [`EmulatedServer`].
pub struct ScriptedLink {
    kind: LinkKind,
    behavior: Cell<LinkBehavior>,
    stats: Cell<LinkStats>,
    up: bool,
    server: EmulatedServer,
    connection: Option<Connection>,
}

impl ScriptedLink {
    pub fn new(kind: LinkKind, behavior: LinkBehavior) -> Self {
        Self {
            kind,
            behavior: Cell::new(behavior),
            stats: Cell::new(LinkStats::default()),
            up: false,
            server: EmulatedServer::new(),
            connection: None,
        }
    }

    pub fn with_server(mut self, server: EmulatedServer) -> Self {
        self.server = server;
        self
    }

    pub fn server(&self) -> &EmulatedServer {
        &self.server
    }

    pub fn stats(&self) -> LinkStats {
        self.stats.get()
    }

    /// Change the script; takes effect at the next bring-up or probe.
    pub fn set_behavior(&self, behavior: LinkBehavior) {
        self.behavior.set(behavior);
    }

    fn count(&self, update: impl FnOnce(&mut LinkStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }
}

impl Transport for ScriptedLink {
    async fn open(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        if !self.up {
            return Err(LinkError::NotUp);
        }
        self.count(|s| s.connections += 1);
        self.connection = Some(self.server.connect(endpoint.is_secure()));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        match self.connection.as_mut() {
            Some(connection) if !connection.is_closed() => {
                connection.feed(data);
                Ok(())
            }
            Some(_) => Err(LinkError::Dropped("send")),
            None => Err(LinkError::ConnectFailed),
        }
    }

    /// Waits for the server without a bound of its own.
    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::ConnectFailed)?;
        poll_fn(|_| {
            if connection.has_output() || connection.is_closed() {
                Poll::Ready(Ok(connection.read(buf)))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

impl Link for ScriptedLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    async fn bring_up(&mut self) -> Result<(), LinkError> {
        self.count(|s| s.bring_ups += 1);
        match self.behavior.get() {
            LinkBehavior::Up => {
                self.up = true;
                Ok(())
            }
            LinkBehavior::Fail(err) => Err(err),
            LinkBehavior::Hang => pending().await,
        }
    }

    async fn probe(&mut self) -> bool {
        self.count(|s| s.probes += 1);
        self.up && self.behavior.get() == LinkBehavior::Up
    }

    async fn shut_down(&mut self) {
        self.count(|s| s.shut_downs += 1);
        self.connection = None;
        self.up = false;
    }
}
