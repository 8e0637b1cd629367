//! Minimal HTTP/1.1 client for one image upload per connection
//!
//! Only what an upload needs: a `POST` request head, the raw image body, and
//! the status code from the reply's status line. The connection is closed
//! after every exchange (`Connection: close`).

use core::fmt::Write as _;

use embassy_time::Duration;
use heapless::{String, Vec};
use log::{debug, warn};
use thiserror_no_std::Error;

use crate::capture::{Encoding, ImageBuffer, LABEL_CAPACITY};
use crate::config::{AuthScheme, Endpoint};
use crate::network::{LinkError, Transport};

/// Room for one request head.
pub const HEAD_CAPACITY: usize = 768;
const STATUS_LINE_CAPACITY: usize = 256;

pub const USER_AGENT: &str = concat!("fotolink/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    #[error("link failure: {0}")]
    Link(LinkError),
    #[error("request head does not fit the buffer")]
    HeadTooLarge,
    #[error("server closed the connection before replying")]
    ClosedEarly,
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
}

impl From<LinkError> for HttpError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl From<HttpError> for LinkError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Link(link) => link,
            HttpError::ClosedEarly => LinkError::Dropped("reply"),
            HttpError::HeadTooLarge => LinkError::BadReply("request head too large"),
            HttpError::Malformed(what) => LinkError::BadReply(what),
        }
    }
}

/// Credentials sent with every upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub scheme: AuthScheme<'a>,
    pub api_key: &'a str,
}

/// Render the request head for uploading `image` to `endpoint`.
pub fn request_head(
    endpoint: &Endpoint<'_>,
    credentials: &Credentials<'_>,
    image: &ImageBuffer,
) -> Result<String<HEAD_CAPACITY>, HttpError> {
    let mut head = String::new();
    write_head(&mut head, endpoint, credentials, &HeadFields::of(image))
        .map_err(|_| HttpError::HeadTooLarge)?;
    Ok(head)
}

/// Longest head [`request_head`] can render for `endpoint` and
/// `credentials`, whatever the image.
pub fn max_head_len(endpoint: &Endpoint<'_>, credentials: &Credentials<'_>) -> usize {
    let widest = [Encoding::Jpeg, Encoding::Png, Encoding::Raw]
        .into_iter()
        .map(Encoding::content_type)
        .max_by_key(|content_type| content_type.len())
        .unwrap_or_default();
    let fields = HeadFields {
        content_type: widest,
        content_length: usize::MAX,
        captured_at_ms: u64::MAX,
        label: None,
    };

    let mut measured = Measure(0);
    // Measuring never fails.
    let _ = write_head(&mut measured, endpoint, credentials, &fields);
    measured.0 + LABEL_HEADER.len() + 2 + LABEL_CAPACITY
}

const LABEL_HEADER: &str = "X-Capture-Label: ";

/// Per-image values of a request head.
struct HeadFields<'i> {
    content_type: &'i str,
    content_length: usize,
    captured_at_ms: u64,
    label: Option<&'i str>,
}

impl<'i> HeadFields<'i> {
    fn of(image: &'i ImageBuffer) -> Self {
        Self {
            content_type: image.content_type(),
            content_length: image.len(),
            captured_at_ms: image.captured_at_ms(),
            label: image.label(),
        }
    }
}

/// Byte counter standing in for a buffer.
struct Measure(usize);

impl core::fmt::Write for Measure {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

fn write_head<W: core::fmt::Write>(
    head: &mut W,
    endpoint: &Endpoint<'_>,
    credentials: &Credentials<'_>,
    fields: &HeadFields<'_>,
) -> core::fmt::Result {
    write!(head, "POST {} HTTP/1.1\r\n", endpoint.path)?;
    if endpoint.has_default_port() {
        write!(head, "Host: {}\r\n", endpoint.host)?;
    } else {
        write!(head, "Host: {}:{}\r\n", endpoint.host, endpoint.port)?;
    }

    match credentials.scheme {
        AuthScheme::Bearer => write!(head, "Authorization: Bearer {}\r\n", credentials.api_key)?,
        AuthScheme::Header(name) => write!(head, "{name}: {}\r\n", credentials.api_key)?,
    }

    write!(head, "Content-Type: {}\r\n", fields.content_type)?;
    write!(head, "Content-Length: {}\r\n", fields.content_length)?;
    write!(head, "X-Capture-Timestamp: {}\r\n", fields.captured_at_ms)?;
    if let Some(label) = fields.label {
        write!(head, "{LABEL_HEADER}{label}\r\n")?;
    }
    write!(head, "User-Agent: {USER_AGENT}\r\n")?;
    head.write_str("Connection: close\r\n\r\n")
}

/// Status code from an `HTTP/1.x NNN reason` line.
pub fn parse_status_line(line: &str) -> Result<u16, HttpError> {
    let mut parts = line.trim_end().splitn(3, ' ');

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed("not an HTTP/1.x status line"));
    }

    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(HttpError::Malformed("bad status code"))?;
    if !(100..=599).contains(&code) {
        return Err(HttpError::Malformed("status code out of range"));
    }
    Ok(code)
}

/// Read the reply's status line. Bytes after it are left unread.
pub async fn read_status<T: Transport>(transport: &mut T, timeout: Duration) -> Result<u16, HttpError> {
    let mut line: Vec<u8, STATUS_LINE_CAPACITY> = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        let n = transport.read(&mut buf, timeout).await?;
        if n == 0 {
            return Err(if line.is_empty() {
                HttpError::ClosedEarly
            } else {
                HttpError::Malformed("status line cut short")
            });
        }

        for &b in &buf[..n] {
            if b == b'\n' {
                let text = core::str::from_utf8(&line)
                    .map_err(|_| HttpError::Malformed("status line is not text"))?;
                return parse_status_line(text);
            }
            line.push(b)
                .map_err(|_| HttpError::Malformed("status line too long"))?;
        }
    }
}

/// One complete upload exchange: connect, send head and body, read status,
/// close.
pub async fn post_image<T: Transport>(
    transport: &mut T,
    endpoint: &Endpoint<'_>,
    credentials: &Credentials<'_>,
    image: &ImageBuffer,
    timeout: Duration,
) -> Result<u16, HttpError> {
    let head = request_head(endpoint, credentials, image)?;

    transport.open(endpoint).await?;
    let result = async {
        transport.write(head.as_bytes()).await?;
        transport.write(image.bytes()).await?;
        debug!("sent {} byte request body", image.len());
        read_status(transport, timeout).await
    }
    .await;
    transport.close().await;

    if let Err(e) = &result {
        warn!("HTTP exchange failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Encoding, FrameInfo};
    use crate::clock::ManualClock;
    use crate::emulator::{EmulatedServer, ServerTransport};
    use embassy_futures::block_on;

    const KEY: Credentials<'static> = Credentials {
        scheme: AuthScheme::Bearer,
        api_key: "secret",
    };

    fn image() -> ImageBuffer {
        ImageBuffer::new(
            alloc::vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9],
            Encoding::Jpeg,
            42_000,
            FrameInfo {
                width: 320,
                height: 240,
                quality: 6,
            },
        )
    }

    #[test]
    fn test_head_contains_required_headers() {
        let endpoint = Endpoint::parse("http://your-server.com/api/images").unwrap();
        let head = request_head(&endpoint, &KEY, &image()).unwrap();

        assert!(head.starts_with("POST /api/images HTTP/1.1\r\n"));
        assert!(head.contains("Host: your-server.com\r\n"));
        assert!(head.contains("Authorization: Bearer secret\r\n"));
        assert!(head.contains("Content-Type: image/jpeg\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("X-Capture-Timestamp: 42000\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_head_with_port_and_custom_header() {
        let endpoint = Endpoint::parse("https://example.org:8443/up").unwrap();
        let credentials = Credentials {
            scheme: AuthScheme::Header("X-API-Key"),
            api_key: "k",
        };
        let head = request_head(&endpoint, &credentials, &image()).unwrap();

        assert!(head.contains("Host: example.org:8443\r\n"));
        assert!(head.contains("X-API-Key: k\r\n"));
        assert!(!head.contains("Authorization"));
    }

    #[test]
    fn test_max_head_len_covers_labelled_image() {
        let endpoint = Endpoint::parse("http://your-server.com/api/images").unwrap();
        let mut label = heapless::String::<LABEL_CAPACITY>::new();
        for _ in 0..LABEL_CAPACITY {
            label.push('9').unwrap();
        }
        let image = ImageBuffer::new(
            alloc::vec![0; 112_640],
            Encoding::Raw,
            u64::MAX,
            FrameInfo {
                width: 4096,
                height: 3072,
                quality: 10,
            },
        )
        .with_label(label);

        let head = request_head(&endpoint, &KEY, &image).unwrap();
        assert!(head.len() <= max_head_len(&endpoint, &KEY));
        assert!(max_head_len(&endpoint, &KEY) <= HEAD_CAPACITY);
    }

    #[test]
    fn test_status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 201 Created\r"), Ok(201));
        assert_eq!(parse_status_line("HTTP/1.0 500"), Ok(500));
        assert!(parse_status_line("HTTP/2 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 20 OK").is_err());
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn test_post_image_round_trip() {
        let server = EmulatedServer::new();
        server.push_status(201);
        let mut transport = ServerTransport::new(server.clone(), ManualClock::new());
        let endpoint = Endpoint::parse("http://your-server.com/api/images").unwrap();

        let status = block_on(post_image(
            &mut transport,
            &endpoint,
            &KEY,
            &image(),
            Duration::from_secs(30),
        ));

        assert_eq!(status, Ok(201));
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/api/images");
        assert_eq!(requests[0].header("authorization"), Some("Bearer secret"));
        assert_eq!(requests[0].body, image().bytes());
        assert!(transport.is_closed());
    }

    #[test]
    fn test_dropped_connection_is_closed_early() {
        let server = EmulatedServer::new();
        server.push_drop();
        let mut transport = ServerTransport::new(server, ManualClock::new());
        let endpoint = Endpoint::parse("http://your-server.com/").unwrap();

        let result = block_on(post_image(
            &mut transport,
            &endpoint,
            &KEY,
            &image(),
            Duration::from_secs(30),
        ));

        assert_eq!(result, Err(HttpError::ClosedEarly));
    }
}
