//! Cellular link over the SIM7600 TCP/IP and SSL services
//!
//! Bring-up: power on, disable echo, check the SIM, define the PDP context,
//! wait for registration (`AT+CREG?`, home or roaming), then open the data
//! network (`AT+NETOPEN`). Plain `http://` uploads use socket 0 of the TCP/IP
//! service (`AT+CIPOPEN`/`AT+CIPSEND`); `https://` uploads use session 0 of
//! the SSL service (`AT+CCHOPEN`/`AT+CCHSEND`) so TLS stays on the modem.

use embassy_time::Duration;
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use log::{debug, info, warn};

use super::{Link, LinkError, LinkKind, Transport};
use crate::at::{AtClient, AtError, format_command};
use crate::clock::Clock;
use crate::config::{DeviceConfig, Endpoint, Timing};
use crate::modem::Modem;

/// Largest payload handed to one `AT+CIPSEND` / `AT+CCHSEND`.
const MAX_SEND_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Socket {
    Plain,
    Secure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Registered,
    Searching,
    Denied,
}

pub struct CellularLink<'a, U, P, C> {
    at: AtClient<U, P, C>,
    apn: &'a str,
    timing: Timing,
    up: bool,
    socket: Option<Socket>,
}

impl<'a, U, P, C> CellularLink<'a, U, P, C>
where
    U: Read + Write,
    P: OutputPin,
    C: Clock,
{
    pub fn new(modem: Modem<U, P, C>, config: &DeviceConfig<'a>) -> Self {
        Self {
            at: AtClient::new(modem),
            apn: config.apn,
            timing: config.timing,
            up: false,
            socket: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn at(&self) -> &AtClient<U, P, C> {
        &self.at
    }

    async fn command(&mut self, cmd: &str) -> Result<crate::at::AtResponse, AtError> {
        self.at.command(cmd, self.timing.at_command_timeout).await
    }

    async fn check_sim(&mut self) -> Result<(), LinkError> {
        let response = self.command("AT+CPIN?").await.map_err(|e| {
            warn!("SIM check failed: {e}");
            LinkError::Registration("SIM not ready")
        })?;

        match response.value("+CPIN:") {
            Some("READY") => Ok(()),
            other => {
                warn!("SIM state: {other:?}");
                Err(LinkError::Registration("SIM not ready"))
            }
        }
    }

    async fn registration(&mut self) -> Result<Registration, LinkError> {
        let response = self.command("AT+CREG?").await?;
        let stat = response
            .value("+CREG:")
            .and_then(|value| value.split(',').nth(1))
            .and_then(|stat| stat.trim().parse::<u8>().ok())
            .ok_or(LinkError::At(AtError::Unexpected("malformed +CREG")))?;

        Ok(match stat {
            1 | 5 => Registration::Registered,
            3 => Registration::Denied,
            _ => Registration::Searching,
        })
    }

    async fn wait_registered(&mut self) -> Result<(), LinkError> {
        let clock = self.at.modem().clock().clone();
        let deadline = clock
            .now_ms()
            .saturating_add(self.timing.registration_timeout.as_millis());

        loop {
            match self.registration().await? {
                Registration::Registered => return Ok(()),
                Registration::Denied => return Err(LinkError::Registration("denied")),
                Registration::Searching => {}
            }

            if clock.remaining(deadline).is_none() {
                return Err(LinkError::Registration("timed out"));
            }
            debug!("not registered yet");
            clock.sleep(self.timing.registration_poll).await;
        }
    }

    async fn open_network(&mut self) -> Result<(), LinkError> {
        match self.command("AT+NETOPEN").await {
            Ok(_) => {
                let (_, line) = self
                    .at
                    .wait_for(&["+NETOPEN:"], self.timing.at_command_timeout)
                    .await
                    .map_err(timeout_as("network open"))?;
                if line.as_str() != "+NETOPEN: 0" {
                    warn!("network open refused: {line}");
                    return Err(LinkError::Registration("data network refused"));
                }
                Ok(())
            }
            // ERROR here usually means the network is already open.
            Err(AtError::Rejected) => {
                if self.network_open().await? {
                    Ok(())
                } else {
                    Err(LinkError::Registration("data network refused"))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn network_open(&mut self) -> Result<bool, LinkError> {
        let response = self.command("AT+NETOPEN?").await?;
        Ok(response.value("+NETOPEN:") == Some("1"))
    }

    async fn open_plain(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        let cmd = format_command(format_args!(
            "AT+CIPOPEN=0,\"TCP\",\"{}\",{}",
            endpoint.host, endpoint.port
        ))?;
        self.command(&cmd).await?;

        let (idx, line) = self
            .at
            .wait_for(&["+CIPOPEN:", "+CIPERROR:"], self.timing.http_timeout)
            .await
            .map_err(timeout_as("connect"))?;
        if idx != 0 || line.as_str() != "+CIPOPEN: 0,0" {
            warn!("connect refused: {line}");
            return Err(LinkError::ConnectFailed);
        }
        Ok(())
    }

    async fn open_secure(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        self.command("AT+CCHSTART").await?;
        let (_, started) = self
            .at
            .wait_for(&["+CCHSTART:"], self.timing.at_command_timeout)
            .await
            .map_err(timeout_as("SSL start"))?;
        if started.as_str() != "+CCHSTART: 0" {
            warn!("SSL service refused: {started}");
            return Err(LinkError::ConnectFailed);
        }

        let opened = self.open_ssl_session(endpoint).await;
        if opened.is_err() {
            self.stop_ssl().await;
        }
        opened
    }

    async fn open_ssl_session(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        let cmd = format_command(format_args!(
            "AT+CCHOPEN=0,\"{}\",{},2",
            endpoint.host, endpoint.port
        ))?;
        self.command(&cmd).await?;

        let (_, line) = self
            .at
            .wait_for(&["+CCHOPEN:"], self.timing.http_timeout)
            .await
            .map_err(timeout_as("connect"))?;
        if line.as_str() != "+CCHOPEN: 0,0" {
            warn!("TLS connect refused: {line}");
            return Err(LinkError::ConnectFailed);
        }
        Ok(())
    }

    /// Stops the SSL service. It must be stopped after every session, since
    /// the modem rejects `AT+CCHSTART` while it is still running.
    async fn stop_ssl(&mut self) {
        if let Err(e) = self.command("AT+CCHSTOP").await {
            warn!("SSL service stop: {e}");
        }
    }

    async fn send_chunk(&mut self, socket: Socket, chunk: &[u8]) -> Result<(), LinkError> {
        let (cmd, confirm) = match socket {
            Socket::Plain => (
                format_command(format_args!("AT+CIPSEND=0,{}", chunk.len()))?,
                "+CIPSEND:",
            ),
            Socket::Secure => (
                format_command(format_args!("AT+CCHSEND=0,{}", chunk.len()))?,
                "+CCHSEND:",
            ),
        };

        self.at
            .send_data(&cmd, chunk, self.timing.http_timeout)
            .await
            .map_err(|e| match e {
                AtError::Rejected | AtError::Cme(_) => LinkError::Dropped("send"),
                other => timeout_as("send")(other),
            })?;

        let (idx, line) = self
            .at
            .wait_for(&[confirm, "+CIPERROR:"], self.timing.http_timeout)
            .await
            .map_err(timeout_as("send"))?;
        let accepted = idx == 0
            && match socket {
                // +CIPSEND: <link>,<requested>,<accepted>
                Socket::Plain => last_field(&line) == Some(chunk.len()),
                // +CCHSEND: <session>,<err>
                Socket::Secure => last_field(&line) == Some(0),
            };
        if !accepted {
            warn!("send not confirmed: {line}");
            return Err(LinkError::Dropped("send"));
        }
        Ok(())
    }
}

fn last_field(line: &str) -> Option<usize> {
    line.rsplit(',').next()?.trim().parse().ok()
}

fn timeout_as(operation: &'static str) -> impl Fn(AtError) -> LinkError {
    move |err| match err {
        AtError::Timeout => LinkError::Timeout(operation),
        other => other.into(),
    }
}

impl<U, P, C> Transport for CellularLink<'_, U, P, C>
where
    U: Read + Write,
    P: OutputPin,
    C: Clock,
{
    async fn open(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        if !self.up {
            return Err(LinkError::NotUp);
        }
        if self.socket.is_some() {
            self.close().await;
        }

        self.at.reset_socket();
        let socket = if endpoint.is_secure() {
            self.open_secure(endpoint).await?;
            Socket::Secure
        } else {
            self.open_plain(endpoint).await?;
            Socket::Plain
        };
        debug!("{socket:?} socket open to {}:{}", endpoint.host, endpoint.port);
        self.socket = Some(socket);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let Some(socket) = self.socket else {
            return Err(LinkError::ConnectFailed);
        };

        for chunk in data.chunks(MAX_SEND_CHUNK) {
            if self.at.peer_closed() {
                return Err(LinkError::Dropped("send"));
            }
            self.send_chunk(socket, chunk).await?;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if self.socket.is_none() {
            return Err(LinkError::ConnectFailed);
        }
        self.at
            .socket_read(buf, timeout)
            .await
            .map_err(timeout_as("receive"))
    }

    async fn close(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        match socket {
            Socket::Plain => {
                if let Err(e) = self.command("AT+CIPCLOSE=0").await {
                    debug!("socket close: peer already closed ({e})");
                }
            }
            Socket::Secure => {
                if let Err(e) = self.command("AT+CCHCLOSE=0").await {
                    debug!("SSL close: peer already closed ({e})");
                }
                self.stop_ssl().await;
            }
        }
        self.at.discard_input();
    }
}

impl<U, P, C> Link for CellularLink<'_, U, P, C>
where
    U: Read + Write,
    P: OutputPin,
    C: Clock,
{
    fn kind(&self) -> LinkKind {
        LinkKind::Cellular
    }

    async fn bring_up(&mut self) -> Result<(), LinkError> {
        if self.up {
            return Ok(());
        }

        self.at.modem_mut().power_on().await?;
        self.at.discard_input();
        self.command("ATE0").await?;
        self.check_sim().await?;

        let cmd = format_command(format_args!("AT+CGDCONT=1,\"IP\",\"{}\"", self.apn))?;
        self.command(&cmd).await?;

        self.wait_registered().await?;
        info!("registered on cellular network");

        self.open_network().await?;
        info!("cellular data network open (APN {})", self.apn);

        self.up = true;
        Ok(())
    }

    async fn probe(&mut self) -> bool {
        if !self.up {
            return false;
        }
        match self.registration().await {
            Ok(Registration::Registered) => self.network_open().await.unwrap_or(false),
            Ok(_) | Err(_) => false,
        }
    }

    async fn shut_down(&mut self) {
        self.close().await;
        if self.up {
            if let Err(e) = self.command("AT+NETCLOSE").await {
                debug!("network close: {e}");
            }
        }
        self.up = false;
        self.at.discard_input();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RawConfig;
    use crate::emulator::{EmulatedPin, EmulatedSerial, EmulatedServer, Registration as Reg, Sim7600Emulator};
    use embassy_futures::block_on;

    type TestLink = CellularLink<'static, EmulatedSerial, EmulatedPin, ManualClock>;

    fn link(sim: &Sim7600Emulator, clock: &ManualClock) -> TestLink {
        let config = DeviceConfig::from_raw(&RawConfig::EXAMPLE).unwrap();
        let modem = Modem::new(sim.serial(), sim.modem_lines(true), clock.clone(), config.timing);
        CellularLink::new(modem, &config)
    }

    #[test]
    fn test_bring_up_sequence() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let mut link = link(&sim, &clock);

        block_on(link.bring_up()).unwrap();

        assert!(link.is_up());
        let log = sim.command_log();
        let position = |cmd: &str| log.iter().position(|c| c.as_str() == cmd).unwrap();
        assert!(position("ATE0") < position("AT+CPIN?"));
        assert!(position("AT+CGDCONT=1,\"IP\",\"internet\"") < position("AT+CREG?"));
        assert!(position("AT+CREG?") < position("AT+NETOPEN"));
    }

    #[test]
    fn test_registration_denied() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        sim.set_registration(Reg::Denied);
        let mut link = link(&sim, &clock);

        assert_eq!(
            block_on(link.bring_up()),
            Err(LinkError::Registration("denied"))
        );
        assert!(!link.is_up());
    }

    #[test]
    fn test_registration_times_out() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        sim.set_registration(Reg::Searching);
        let mut link = link(&sim, &clock);

        assert_eq!(
            block_on(link.bring_up()),
            Err(LinkError::Registration("timed out"))
        );
        assert!(clock.now_ms() >= Timing::default().registration_timeout.as_millis());
    }

    #[test]
    fn test_missing_sim() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        sim.set_sim_missing(true);
        let mut link = link(&sim, &clock);

        assert_eq!(
            block_on(link.bring_up()),
            Err(LinkError::Registration("SIM not ready"))
        );
    }

    #[test]
    fn test_roaming_counts_as_registered() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        sim.set_registration(Reg::Roaming);
        let mut link = link(&sim, &clock);

        assert!(block_on(link.bring_up()).is_ok());
    }

    #[test]
    fn test_plain_exchange_through_socket() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let server = EmulatedServer::new();
        sim.attach_server(server.clone());
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("http://your-server.com/api/images").unwrap();

        block_on(async {
            link.bring_up().await?;
            link.open(&endpoint).await?;
            link.write(b"POST /api/images HTTP/1.1\r\nHost: your-server.com\r\nContent-Length: 3\r\n\r\nabc")
                .await
        })
        .unwrap();

        let mut buf = [0u8; 64];
        let n = block_on(link.read(&mut buf, Duration::from_secs(5))).unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 201"));
        block_on(link.close());

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, b"abc");
        assert!(!requests[0].secure);
    }

    #[test]
    fn test_https_uses_ssl_service() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let server = EmulatedServer::new();
        sim.attach_server(server.clone());
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("https://your-server.com/api/images").unwrap();

        block_on(async {
            link.bring_up().await?;
            link.open(&endpoint).await?;
            link.write(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await
        })
        .unwrap();
        block_on(link.close());

        let log = sim.command_log();
        assert!(log.iter().any(|c| c.starts_with("AT+CCHOPEN=0,\"your-server.com\",443")));
        assert!(log.iter().any(|c| c.as_str() == "AT+CCHSTOP"));
        assert!(server.requests()[0].secure);
    }

    #[test]
    fn test_ssl_service_restarts_after_peer_close() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let server = EmulatedServer::new();
        sim.attach_server(server.clone());
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("https://your-server.com/api/images").unwrap();

        block_on(link.bring_up()).unwrap();
        for _ in 0..2 {
            block_on(async {
                link.open(&endpoint).await?;
                link.write(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await
            })
            .unwrap();
            let mut buf = [0u8; 64];
            let n = block_on(link.read(&mut buf, Duration::from_secs(5))).unwrap();
            assert!(buf[..n].starts_with(b"HTTP/1.1 201"));
            block_on(link.close());
        }

        let log = sim.command_log();
        let count = |cmd: &str| log.iter().filter(|c| c.as_str() == cmd).count();
        assert_eq!(count("AT+CCHSTART"), 2);
        assert_eq!(count("AT+CCHSTOP"), 2);
        assert_eq!(server.requests().len(), 2);
    }

    #[test]
    fn test_failed_tls_connect_stops_ssl_service() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("https://your-server.com/").unwrap();

        block_on(link.bring_up()).unwrap();
        // Drop the data session so the TLS connect is refused.
        block_on(link.at.command("AT+NETCLOSE", Duration::from_secs(5))).unwrap();

        assert_eq!(block_on(link.open(&endpoint)), Err(LinkError::ConnectFailed));
        assert!(sim.command_log().iter().any(|c| c.as_str() == "AT+CCHSTOP"));
    }

    #[test]
    fn test_large_body_is_chunked() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let server = EmulatedServer::new();
        sim.attach_server(server.clone());
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("http://your-server.com/").unwrap();

        let body = [0x5a_u8; 3000];
        let mut request = alloc::vec::Vec::new();
        request.extend_from_slice(b"POST / HTTP/1.1\r\nContent-Length: 3000\r\n\r\n");
        request.extend_from_slice(&body);

        block_on(async {
            link.bring_up().await?;
            link.open(&endpoint).await?;
            link.write(&request).await
        })
        .unwrap();

        let sends = sim
            .command_log()
            .iter()
            .filter(|c| c.starts_with("AT+CIPSEND=0,"))
            .count();
        assert_eq!(sends, request.len().div_ceil(MAX_SEND_CHUNK));
        assert_eq!(server.requests()[0].body.len(), 3000);
    }

    #[test]
    fn test_write_after_peer_close_fails() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let server = EmulatedServer::new();
        server.push_drop();
        sim.attach_server(server.clone());
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("http://your-server.com/").unwrap();

        let result = block_on(async {
            link.bring_up().await?;
            link.open(&endpoint).await?;
            link.write(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await?;
            let mut buf = [0u8; 16];
            link.read(&mut buf, Duration::from_secs(5)).await
        });

        assert_eq!(result, Ok(0));
    }

    #[test]
    fn test_probe_after_shut_down() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let mut link = link(&sim, &clock);

        block_on(link.bring_up()).unwrap();
        assert!(block_on(link.probe()));
        block_on(link.shut_down());
        assert!(!block_on(link.probe()));
        assert!(sim.command_log().iter().any(|c| c.as_str() == "AT+NETCLOSE"));
    }

    #[test]
    fn test_open_requires_link() {
        let clock = ManualClock::new();
        let sim = Sim7600Emulator::new();
        let mut link = link(&sim, &clock);
        let endpoint = Endpoint::parse("http://your-server.com/").unwrap();

        assert_eq!(block_on(link.open(&endpoint)), Err(LinkError::NotUp));
    }
}
