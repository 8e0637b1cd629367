use alloc::collections::VecDeque;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use log::{debug, trace};

use super::gpio::EmulatedPin;
use super::serial::{EmulatedSerial, Peer};
use super::server::{Connection, EmulatedServer};
use crate::hardware::ModemLines;

/// Network registration state reported by `AT+CREG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Roaming,
    Searching,
    Denied,
}

impl Registration {
    fn stat(self) -> u8 {
        match self {
            Self::Registered => 1,
            Self::Searching => 2,
            Self::Denied => 3,
            Self::Roaming => 5,
        }
    }

    fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::Roaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Tcp,
    Ssl,
}

struct Socket {
    service: Service,
    connection: Connection,
}

struct Upload {
    service: Service,
    expected: usize,
    data: Vec<u8>,
}

struct SimState {
    powered: bool,
    dead: bool,
    echo: bool,
    boot_probes: u32,
    ignore_commands: u32,
    sim_missing: bool,
    registration: Registration,
    net_open: bool,
    ssl_started: bool,
    power_key: Option<EmulatedPin>,
    reset: Option<EmulatedPin>,
    seen_power: u32,
    seen_reset: u32,
    command: Vec<u8>,
    upload: Option<Upload>,
    socket: Option<Socket>,
    server: EmulatedServer,
    out: VecDeque<u8>,
    log: Vec<String>,
    sent: Vec<u8>,
}

/// SIM7600 speaking the subset of AT commands the cellular link uses, over
/// an [`EmulatedSerial`]. PWRKEY pulses toggle power and RESET pulses reboot
/// it; sockets are served by an [`EmulatedServer`].
#[derive(Clone)]
pub struct Sim7600Emulator {
    state: Rc<RefCell<SimState>>,
}

impl Default for Sim7600Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim7600Emulator {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                powered: false,
                dead: false,
                echo: true,
                boot_probes: 0,
                ignore_commands: 0,
                sim_missing: false,
                registration: Registration::Registered,
                net_open: false,
                ssl_started: false,
                power_key: None,
                reset: None,
                seen_power: 0,
                seen_reset: 0,
                command: Vec::new(),
                upload: None,
                socket: None,
                server: EmulatedServer::new(),
                out: VecDeque::new(),
                log: Vec::new(),
                sent: Vec::new(),
            })),
        }
    }

    pub fn serial(&self) -> EmulatedSerial {
        let peer: Rc<RefCell<dyn Peer>> = self.state.clone();
        EmulatedSerial::new(peer)
    }

    /// Control lines wired to this modem, idle high.
    pub fn modem_lines(&self, with_reset: bool) -> ModemLines<EmulatedPin> {
        let lines = ModemLines {
            power: EmulatedPin::new(true),
            reset: with_reset.then(|| EmulatedPin::new(true)),
        };
        self.wire(&lines);
        lines
    }

    /// Watch control lines claimed elsewhere, e.g. from an
    /// [`EmulatedBoard`](super::EmulatedBoard).
    pub fn wire(&self, lines: &ModemLines<EmulatedPin>) {
        let mut state = self.state.borrow_mut();
        state.power_key = Some(lines.power.clone());
        state.reset = lines.reset.clone();
        state.seen_power = lines.power.releases();
        state.seen_reset = lines.reset.as_ref().map_or(0, EmulatedPin::releases);
    }

    /// Probes the modem ignores after each boot.
    pub fn set_boot_probes(&self, probes: u32) {
        self.state.borrow_mut().boot_probes = probes;
    }

    /// Start with the modem already running.
    pub fn force_powered(&self, powered: bool) {
        let mut state = self.state.borrow_mut();
        if powered {
            state.boot();
            state.ignore_commands = 0;
        } else {
            state.shut_off();
        }
    }

    /// A dead modem never answers, powered or not.
    pub fn set_dead(&self, dead: bool) {
        let mut state = self.state.borrow_mut();
        state.dead = dead;
        state.out.clear();
    }

    pub fn set_sim_missing(&self, missing: bool) {
        self.state.borrow_mut().sim_missing = missing;
    }

    pub fn set_registration(&self, registration: Registration) {
        self.state.borrow_mut().registration = registration;
    }

    pub fn attach_server(&self, server: EmulatedServer) {
        self.state.borrow_mut().server = server;
    }

    pub fn is_powered(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.sync_lines();
        state.powered
    }

    pub fn power_key_pulses(&self) -> u32 {
        let state = self.state.borrow();
        state.power_key.as_ref().map_or(0, EmulatedPin::releases)
    }

    pub fn reset_pulses(&self) -> u32 {
        let state = self.state.borrow();
        state.reset.as_ref().map_or(0, EmulatedPin::releases)
    }

    /// Every command line received while powered, without the trailing CR.
    pub fn command_log(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    /// Payload bytes accepted through `AT+CIPSEND` / `AT+CCHSEND`.
    pub fn socket_sent(&self) -> Vec<u8> {
        self.state.borrow().sent.clone()
    }
}

impl SimState {
    fn boot(&mut self) {
        debug!("SIM7600: booting");
        self.powered = true;
        self.echo = true;
        self.ignore_commands = self.boot_probes;
        self.reset_session();
    }

    fn shut_off(&mut self) {
        debug!("SIM7600: powered off");
        self.powered = false;
        self.reset_session();
    }

    fn reset_session(&mut self) {
        self.net_open = false;
        self.ssl_started = false;
        self.socket = None;
        self.upload = None;
        self.command.clear();
        self.out.clear();
    }

    /// Apply control-line pulses seen since the last call.
    fn sync_lines(&mut self) {
        let power = self.power_key.as_ref().map_or(0, EmulatedPin::releases);
        while self.seen_power < power {
            self.seen_power += 1;
            if self.powered {
                self.shut_off();
            } else {
                self.boot();
            }
        }

        let reset = self.reset.as_ref().map_or(0, EmulatedPin::releases);
        if self.seen_reset < reset {
            self.seen_reset = reset;
            if self.powered {
                self.boot();
            }
        }
    }

    fn emit(&mut self, text: &str) {
        self.out.extend(text.as_bytes());
    }

    fn line(&mut self, text: &str) {
        self.emit("\r\n");
        self.emit(text);
        self.emit("\r\n");
    }

    fn ok(&mut self) {
        self.line("OK");
    }

    fn error(&mut self) {
        self.line("ERROR");
    }

    fn handle(&mut self, raw: Vec<u8>) {
        let Ok(cmd) = core::str::from_utf8(&raw) else {
            self.error();
            return;
        };
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return;
        }
        if self.ignore_commands > 0 {
            self.ignore_commands -= 1;
            trace!("SIM7600: still booting, ignoring {cmd}");
            return;
        }

        trace!("SIM7600 <- {cmd}");
        self.log.push(String::from(cmd));
        if self.echo {
            self.emit(cmd);
            self.emit("\r");
        }

        match cmd {
            "AT" => self.ok(),
            "ATE0" => {
                self.echo = false;
                self.ok();
            }
            "ATE1" => {
                self.echo = true;
                self.ok();
            }
            "AT+CSQ" => {
                self.line("+CSQ: 23,99");
                self.ok();
            }
            "AT+CPIN?" => {
                if self.sim_missing {
                    self.line("+CME ERROR: 10");
                } else {
                    self.line("+CPIN: READY");
                    self.ok();
                }
            }
            "AT+CREG?" => {
                let stat = self.registration.stat();
                self.line(&format!("+CREG: 0,{stat}"));
                self.ok();
            }
            "AT+NETOPEN" => self.net_open(),
            "AT+NETOPEN?" => {
                let open = u8::from(self.net_open);
                self.line(&format!("+NETOPEN: {open}"));
                self.ok();
            }
            "AT+NETCLOSE" => {
                if self.net_open {
                    self.net_open = false;
                    self.socket = None;
                    self.ok();
                    self.line("+NETCLOSE: 0");
                } else {
                    self.error();
                }
            }
            "AT+CIPCLOSE=0" => self.close_socket(Service::Tcp, "+CIPCLOSE: 0,0"),
            "AT+CCHSTART" if self.ssl_started => self.error(),
            "AT+CCHSTART" => {
                self.ssl_started = true;
                self.ok();
                self.line("+CCHSTART: 0");
            }
            "AT+CCHSTOP" if self.ssl_started => {
                self.ssl_started = false;
                self.socket = self.socket.take().filter(|s| s.service != Service::Ssl);
                self.ok();
                self.line("+CCHSTOP: 0");
            }
            "AT+CCHSTOP" => self.error(),
            "AT+CCHCLOSE=0" => self.close_socket(Service::Ssl, "+CCHCLOSE: 0,0"),
            "AT+CPOF" => {
                self.ok();
                self.powered = false;
                self.reset_session();
            }
            _ if cmd.starts_with("AT+CGDCONT=") => self.ok(),
            _ if cmd.starts_with("AT+CIPOPEN=0,") => self.open_socket(Service::Tcp),
            _ if cmd.starts_with("AT+CCHOPEN=0,") => self.open_socket(Service::Ssl),
            _ if cmd.starts_with("AT+CIPSEND=0,") => self.start_upload(Service::Tcp, cmd),
            _ if cmd.starts_with("AT+CCHSEND=0,") => self.start_upload(Service::Ssl, cmd),
            _ => self.error(),
        }
    }

    fn net_open(&mut self) {
        if self.net_open {
            self.line("+IP ERROR: Network is already opened");
            self.error();
        } else if self.registration.is_registered() {
            self.net_open = true;
            self.ok();
            self.line("+NETOPEN: 0");
        } else {
            self.ok();
            self.line("+NETOPEN: 1");
        }
    }

    fn open_socket(&mut self, service: Service) {
        let ready = self.net_open && (service == Service::Tcp || self.ssl_started);
        self.ok();
        let (prefix, code) = match service {
            Service::Tcp => ("+CIPOPEN: 0", if ready { 0 } else { 4 }),
            Service::Ssl => ("+CCHOPEN: 0", if ready { 0 } else { 4 }),
        };
        if ready {
            self.socket = Some(Socket {
                service,
                connection: self.server.connect(service == Service::Ssl),
            });
        }
        self.line(&format!("{prefix},{code}"));
    }

    fn close_socket(&mut self, service: Service, confirm: &str) {
        match self.socket.take() {
            Some(socket) if socket.service == service => {
                self.ok();
                self.line(confirm);
            }
            other => {
                self.socket = other;
                self.error();
            }
        }
    }

    fn start_upload(&mut self, service: Service, cmd: &str) {
        let expected = cmd
            .rsplit(',')
            .next()
            .and_then(|len| len.parse::<usize>().ok());
        match (expected, &self.socket) {
            (Some(expected), Some(socket)) if socket.service == service && expected > 0 => {
                self.upload = Some(Upload {
                    service,
                    expected,
                    data: Vec::new(),
                });
                self.emit("\r\n>");
            }
            _ => self.error(),
        }
    }

    fn finish_upload(&mut self, upload: Upload) {
        let len = upload.data.len();
        self.sent.extend_from_slice(&upload.data);
        self.ok();
        match upload.service {
            Service::Tcp => self.line(&format!("+CIPSEND: 0,{len},{len}")),
            Service::Ssl => self.line("+CCHSEND: 0,0"),
        }

        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        socket.connection.feed(&upload.data);
        let reply = socket.connection.take_output();
        let closed = socket.connection.is_closed();

        if !reply.is_empty() {
            let header = match upload.service {
                Service::Tcp => format!("+IPD{}", reply.len()),
                Service::Ssl => format!("+CCHRECV: DATA,0,{}", reply.len()),
            };
            self.line(&header);
            self.out.extend(&reply);
        }
        if closed {
            self.socket = None;
            match upload.service {
                Service::Tcp => self.line("+IPCLOSE: 0,1"),
                Service::Ssl => self.line("+CCH_PEER_CLOSED: 0"),
            }
        }
    }
}

impl Peer for SimState {
    fn from_device(&mut self, bytes: &[u8]) {
        self.sync_lines();
        if !self.powered || self.dead {
            return;
        }

        for &byte in bytes {
            if let Some(upload) = self.upload.as_mut() {
                upload.data.push(byte);
                if upload.data.len() == upload.expected {
                    if let Some(upload) = self.upload.take() {
                        self.finish_upload(upload);
                    }
                }
                continue;
            }

            match byte {
                b'\r' => {
                    let command = core::mem::take(&mut self.command);
                    self.handle(command);
                }
                b'\n' => {}
                other => self.command.push(other),
            }
        }
    }

    fn to_device(&mut self, buf: &mut [u8]) -> usize {
        self.sync_lines();
        if self.dead {
            return 0;
        }
        let n = buf.len().min(self.out.len());
        for (slot, byte) in buf.iter_mut().zip(self.out.drain(..n)) {
            *slot = byte;
        }
        n
    }
}
