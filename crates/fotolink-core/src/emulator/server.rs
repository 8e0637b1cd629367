use alloc::collections::VecDeque;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_time::Duration;
use log::{debug, info};

use crate::clock::Clock;
use crate::config::Endpoint;
use crate::network::{LinkError, Transport};

const DEFAULT_STATUS: u16 = 201;

/// How the server answers the next complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReply {
    Status(u16),
    /// Close the connection without replying.
    Drop,
    /// Keep the connection open and never reply.
    Silent,
}

/// A request as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub secure: bool,
}

impl ServerRequest {
    /// Value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Default)]
struct ServerInner {
    replies: VecDeque<ServerReply>,
    default_status: Option<u16>,
    requests: Vec<ServerRequest>,
}

/// Scripted HTTP upload target. Replies are consumed in order; once the
/// script runs out every request gets the default status (201).
#[derive(Debug, Clone, Default)]
pub struct EmulatedServer {
    inner: Rc<RefCell<ServerInner>>,
}

impl EmulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: ServerReply) {
        self.inner.borrow_mut().replies.push_back(reply);
    }

    pub fn push_status(&self, status: u16) {
        self.push_reply(ServerReply::Status(status));
    }

    pub fn push_drop(&self) {
        self.push_reply(ServerReply::Drop);
    }

    pub fn push_silent(&self) {
        self.push_reply(ServerReply::Silent);
    }

    /// Status used once the scripted replies are exhausted.
    pub fn set_default_status(&self, status: u16) {
        self.inner.borrow_mut().default_status = Some(status);
    }

    pub fn requests(&self) -> Vec<ServerRequest> {
        self.inner.borrow().requests.clone()
    }

    /// Accept one connection.
    pub fn connect(&self, secure: bool) -> Connection {
        Connection {
            server: self.clone(),
            secure,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            answered: false,
            closed: false,
        }
    }

    fn answer(&self, request: ServerRequest) -> ServerReply {
        let mut inner = self.inner.borrow_mut();
        info!(
            "server: {} {} ({} byte body{})",
            request.method,
            request.path,
            request.body.len(),
            if request.secure { ", TLS" } else { "" }
        );
        inner.requests.push(request);
        let fallback = ServerReply::Status(inner.default_status.unwrap_or(DEFAULT_STATUS));
        inner.replies.pop_front().unwrap_or(fallback)
    }
}

/// Server side of one connection.
#[derive(Debug)]
pub struct Connection {
    server: EmulatedServer,
    secure: bool,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    answered: bool,
    closed: bool,
}

impl Connection {
    /// Bytes sent by the client.
    pub fn feed(&mut self, data: &[u8]) {
        if self.answered {
            return;
        }
        self.inbound.extend_from_slice(data);

        let Some(request) = parse_request(&self.inbound, self.secure) else {
            return;
        };
        self.answered = true;

        match self.server.answer(request) {
            ServerReply::Status(status) => {
                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    reason(status)
                );
                self.outbound.extend(response.as_bytes());
                self.closed = true;
            }
            ServerReply::Drop => {
                debug!("server: dropping connection");
                self.closed = true;
            }
            ServerReply::Silent => debug!("server: not replying"),
        }
    }

    /// Move pending reply bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.outbound.drain(..).collect()
    }

    pub fn has_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// The server has closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A complete request in `raw`, if it has fully arrived.
fn parse_request(raw: &[u8], secure: bool) -> Option<ServerRequest> {
    let head_end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = core::str::from_utf8(&raw[..head_end]).ok()?;
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();
    let length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    let body = raw.get(body_start..body_start + length)?.to_vec();
    Some(ServerRequest {
        method,
        path,
        headers,
        body,
        secure,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// [`Transport`] straight into an [`EmulatedServer`], with no link in
/// between.
pub struct ServerTransport<C> {
    server: EmulatedServer,
    clock: C,
    connection: Option<Connection>,
}

impl<C: Clock> ServerTransport<C> {
    pub fn new(server: EmulatedServer, clock: C) -> Self {
        Self {
            server,
            clock,
            connection: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }
}

impl<C: Clock> Transport for ServerTransport<C> {
    async fn open(&mut self, endpoint: &Endpoint<'_>) -> Result<(), LinkError> {
        self.connection = Some(self.server.connect(endpoint.is_secure()));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::ConnectFailed)?;
        if connection.is_closed() {
            return Err(LinkError::Dropped("send"));
        }
        connection.feed(data);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::ConnectFailed)?;
        if connection.has_output() || connection.is_closed() {
            return Ok(connection.read(buf));
        }
        let _ = self
            .clock
            .timeout(timeout, core::future::pending::<()>())
            .await;
        Err(LinkError::Timeout("receive"))
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_completes_on_content_length() {
        let server = EmulatedServer::new();
        let mut connection = server.connect(false);

        connection.feed(b"POST /a HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
        assert!(server.requests().is_empty());
        connection.feed(b"cd");

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/a");
        assert_eq!(requests[0].body, b"abcd");
        assert!(connection.is_closed());
        assert!(connection.take_output().starts_with(b"HTTP/1.1 201 Created\r\n"));
    }

    #[test]
    fn test_scripted_replies_then_default() {
        let server = EmulatedServer::new();
        server.push_drop();
        let request = b"POST / HTTP/1.1\r\n\r\n";

        let mut first = server.connect(false);
        first.feed(request);
        assert!(first.is_closed());
        assert!(!first.has_output());

        let mut second = server.connect(false);
        second.feed(request);
        assert!(second.has_output());
    }
}
