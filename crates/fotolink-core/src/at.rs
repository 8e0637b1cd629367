//! Line-oriented AT command session on top of [`Modem`]
//!
//! The client turns the modem's byte stream into events: response lines,
//! the `>` data prompt, inbound socket data frames (`+IPD<n>` and
//! `+CCHRECV: DATA,0,<n>`) and peer-close notices. Socket data is buffered
//! separately so it can arrive interleaved with command responses.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use embassy_time::Duration;
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use heapless::String;
use log::{debug, trace, warn};
use thiserror_no_std::Error;

use crate::clock::Clock;
use crate::modem::{Modem, ModemError};

/// Longest response line kept; longer lines are a protocol error.
pub const LINE_CAPACITY: usize = 256;

pub type Line = String<LINE_CAPACITY>;
pub type CommandBuf = String<LINE_CAPACITY>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtError {
    #[error("modem: {0}")]
    Modem(ModemError),
    #[error("no complete response before the deadline")]
    Timeout,
    #[error("modem answered ERROR")]
    Rejected,
    #[error("modem reported +CME ERROR {0}")]
    Cme(u16),
    #[error("response line or command too long")]
    Overflow,
    #[error("unexpected response: {0}")]
    Unexpected(&'static str),
}

impl From<ModemError> for AtError {
    fn from(err: ModemError) -> Self {
        match err {
            ModemError::UartTimeout { .. } => Self::Timeout,
            other => Self::Modem(other),
        }
    }
}

/// Format an AT command into a bounded buffer.
pub fn format_command(args: fmt::Arguments<'_>) -> Result<CommandBuf, AtError> {
    let mut cmd = CommandBuf::new();
    cmd.write_fmt(args).map_err(|_| AtError::Overflow)?;
    Ok(cmd)
}

/// Information lines of a completed command, without echo and final result.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AtResponse {
    lines: Vec<Line>,
}

impl AtResponse {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| line.as_str())
    }

    /// Remainder of the first line starting with `prefix`, trimmed.
    pub fn value(&self, prefix: &str) -> Option<&str> {
        self.lines()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }
}

enum Event {
    Line(Line),
    Prompt,
    Data,
    Closed,
}

pub struct AtClient<U, P, C> {
    modem: Modem<U, P, C>,
    pending: VecDeque<u8>,
    socket_rx: VecDeque<u8>,
    peer_closed: bool,
}

impl<U, P, C> AtClient<U, P, C>
where
    U: Read + Write,
    P: OutputPin,
    C: Clock,
{
    pub fn new(modem: Modem<U, P, C>) -> Self {
        Self {
            modem,
            pending: VecDeque::new(),
            socket_rx: VecDeque::new(),
            peer_closed: false,
        }
    }

    pub fn modem(&self) -> &Modem<U, P, C> {
        &self.modem
    }

    pub fn modem_mut(&mut self) -> &mut Modem<U, P, C> {
        &mut self.modem
    }

    /// Send `cmd` and collect its response until `OK` or an error result.
    pub async fn command(&mut self, cmd: &str, timeout: Duration) -> Result<AtResponse, AtError> {
        let deadline = self.deadline(timeout);
        self.write_command(cmd).await?;
        self.collect(cmd, deadline).await
    }

    /// Send a data-carrying command: wait for the `>` prompt, write
    /// `payload`, then collect the final result.
    pub async fn send_data(
        &mut self,
        cmd: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<AtResponse, AtError> {
        let deadline = self.deadline(timeout);
        self.write_command(cmd).await?;
        self.prompt_until(Some(cmd), deadline).await?;
        self.modem.send(payload).await?;
        self.collect(cmd, deadline).await
    }

    /// Wait for the `>` data prompt.
    pub async fn expect_prompt(&mut self, timeout: Duration) -> Result<(), AtError> {
        let deadline = self.deadline(timeout);
        self.prompt_until(None, deadline).await
    }

    /// Read exactly `buf.len()` raw bytes from the modem, bypassing line
    /// parsing.
    pub async fn read_exact_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), AtError> {
        let deadline = self.deadline(timeout);
        self.read_raw_until(buf, deadline).await
    }

    /// Wait for a line starting with one of `prefixes`; returns which prefix
    /// matched and the full line. Other lines are skipped.
    pub async fn wait_for(
        &mut self,
        prefixes: &[&str],
        timeout: Duration,
    ) -> Result<(usize, Line), AtError> {
        let deadline = self.deadline(timeout);
        loop {
            if let Event::Line(line) = self.next_event(deadline, false).await? {
                if let Some(idx) = prefixes.iter().position(|p| line.starts_with(p)) {
                    return Ok((idx, line));
                }
                trace!("skipping: {line}");
            }
        }
    }

    /// Read buffered socket data into `buf`, waiting up to `timeout` for
    /// more. Returns `Ok(0)` once the peer has closed and the buffer is empty.
    pub async fn socket_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AtError> {
        let deadline = self.deadline(timeout);
        loop {
            if !self.socket_rx.is_empty() {
                let n = buf.len().min(self.socket_rx.len());
                for (slot, byte) in buf.iter_mut().zip(self.socket_rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self.peer_closed {
                return Ok(0);
            }
            if let Event::Line(line) = self.next_event(deadline, false).await? {
                debug!("while reading socket: {line}");
            }
        }
    }

    /// Forget socket state before a new connection.
    pub fn reset_socket(&mut self) {
        self.socket_rx.clear();
        self.peer_closed = false;
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Drop unread input, e.g. after a failed exchange.
    pub fn discard_input(&mut self) {
        self.pending.clear();
        self.reset_socket();
    }

    fn deadline(&self, timeout: Duration) -> u64 {
        self.modem
            .clock()
            .now_ms()
            .saturating_add(timeout.as_millis())
    }

    async fn write_command(&mut self, cmd: &str) -> Result<(), AtError> {
        debug!("AT> {cmd}");
        self.modem.send(cmd.as_bytes()).await?;
        self.modem.send(b"\r").await?;
        Ok(())
    }

    async fn collect(&mut self, cmd: &str, deadline: u64) -> Result<AtResponse, AtError> {
        let mut response = AtResponse::default();
        loop {
            let Event::Line(line) = self.next_event(deadline, false).await? else {
                continue;
            };

            if line.as_str() == cmd {
                continue;
            }
            if line.as_str() == "OK" {
                return Ok(response);
            }
            check_final(&line)?;

            debug!("AT< {line}");
            response.lines.push(line);
        }
    }

    async fn next_event(&mut self, deadline: u64, prompt: bool) -> Result<Event, AtError> {
        loop {
            while matches!(self.pending.front(), Some(b'\r' | b'\n')) {
                self.pending.pop_front();
            }

            if prompt && self.pending.front() == Some(&b'>') {
                self.pending.pop_front();
                if self.pending.front() == Some(&b' ') {
                    self.pending.pop_front();
                }
                return Ok(Event::Prompt);
            }

            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line = self.take_line(end)?;

                if let Some(len) = data_frame_len(&line) {
                    self.read_frame(len, deadline).await?;
                    return Ok(Event::Data);
                }
                if is_peer_closed(&line) {
                    debug!("peer closed: {line}");
                    self.peer_closed = true;
                    return Ok(Event::Closed);
                }
                return Ok(Event::Line(line));
            }

            self.fill(deadline).await?;
        }
    }

    fn take_line(&mut self, end: usize) -> Result<Line, AtError> {
        let bytes: Vec<u8> = self.pending.drain(..=end).collect();
        let text = core::str::from_utf8(&bytes)
            .map_err(|_| AtError::Unexpected("non-UTF-8 response line"))?
            .trim_end_matches(['\r', '\n']);

        let mut line = Line::new();
        line.push_str(text).map_err(|_| AtError::Overflow)?;
        Ok(line)
    }

    async fn prompt_until(&mut self, echo: Option<&str>, deadline: u64) -> Result<(), AtError> {
        loop {
            match self.next_event(deadline, true).await? {
                Event::Prompt => return Ok(()),
                Event::Line(line) => {
                    if Some(line.as_str()) == echo {
                        continue;
                    }
                    check_final(&line)?;
                    trace!("before prompt: {line}");
                }
                Event::Data | Event::Closed => {}
            }
        }
    }

    async fn read_raw_until(&mut self, buf: &mut [u8], deadline: u64) -> Result<(), AtError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending.is_empty() {
                self.fill(deadline).await?;
            }
            let n = (buf.len() - filled).min(self.pending.len());
            for (slot, byte) in buf[filled..filled + n].iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_frame(&mut self, len: usize, deadline: u64) -> Result<(), AtError> {
        let mut frame = Vec::new();
        frame
            .try_reserve_exact(len)
            .map_err(|_| AtError::Overflow)?;
        frame.resize(len, 0u8);
        self.read_raw_until(&mut frame, deadline).await?;
        self.socket_rx.extend(frame);
        trace!("socket frame of {len} bytes");
        Ok(())
    }

    async fn fill(&mut self, deadline: u64) -> Result<(), AtError> {
        let Some(wait) = self.modem.clock().remaining(deadline) else {
            return Err(AtError::Timeout);
        };

        let mut chunk = [0u8; 256];
        let n = self.modem.receive(&mut chunk, wait).await?;
        self.pending.extend(&chunk[..n]);
        Ok(())
    }
}

fn check_final(line: &str) -> Result<(), AtError> {
    if line == "ERROR" {
        warn!("modem answered ERROR");
        return Err(AtError::Rejected);
    }
    if let Some(code) = line.strip_prefix("+CME ERROR:") {
        let code = code.trim().parse().unwrap_or(0);
        warn!("modem answered +CME ERROR {code}");
        return Err(AtError::Cme(code));
    }
    Ok(())
}

fn data_frame_len(line: &str) -> Option<usize> {
    line.strip_prefix("+IPD")
        .or_else(|| line.strip_prefix("+CCHRECV: DATA,0,"))
        .and_then(|len| len.trim().parse().ok())
}

fn is_peer_closed(line: &str) -> bool {
    line.starts_with("+IPCLOSE:") || line.starts_with("+CCH_PEER_CLOSED:")
}
