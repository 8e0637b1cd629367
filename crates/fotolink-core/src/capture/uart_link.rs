//! Frame transfer from a companion camera computer over a serial line
//!
//! Handshake, as seen from this side:
//!
//! ```text
//! -> foto <width> <quality>\n
//! <- <timestamp>|<size>\n        (or ERR_CMD / ERR_WIDTH / ERR_QUALITY)
//! -> READY\n
//! <- chunk                       (repeated; each answered with ACK\n)
//! -> ACK\n
//! -> DONE\n
//! ```
//!
//! The sender re-sends a chunk once when it sees no ACK in time, so a chunk
//! that stalls is discarded and read again once before the transfer fails.

use embassy_time::Duration;
use embedded_io_async::{Read, ReadExactError, Write};
use heapless::String;
use log::{debug, error, info, warn};

use super::{
    CaptureError, CaptureSettings, CaptureSource, Encoding, FrameInfo, ImageBuffer,
    LABEL_CAPACITY, allocate_frame, jpeg_dimensions,
};
use crate::clock::Clock;
use crate::config::DeviceConfig;

pub const DEFAULT_CHUNK_SIZE: usize = 256;
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type HeaderLine = String<64>;

pub struct UartCameraLink<S, C> {
    serial: S,
    clock: C,
    settings: CaptureSettings,
    max_bytes: usize,
    chunk_size: usize,
    ack_timeout: Duration,
    response_timeout: Duration,
}

impl<S: Read + Write, C: Clock> UartCameraLink<S, C> {
    pub fn new(serial: S, config: &DeviceConfig<'_>, clock: C) -> Self {
        Self {
            serial,
            clock,
            settings: CaptureSettings::default(),
            max_bytes: config.timing.max_image_bytes,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn send_line(&mut self, line: &[u8]) -> Result<(), CaptureError> {
        let serial = &mut self.serial;
        let sent = self
            .clock
            .timeout(self.ack_timeout, async {
                serial.write_all(line).await?;
                serial.flush().await
            })
            .await;

        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("camera link write failed: {e:?}");
                Err(CaptureError::Link("write failed"))
            }
            Err(_) => Err(CaptureError::Timeout),
        }
    }

    async fn read_header(&mut self) -> Result<HeaderLine, CaptureError> {
        let serial = &mut self.serial;
        let line = self
            .clock
            .timeout(self.response_timeout, async {
                let mut line = HeaderLine::new();
                let mut byte = [0u8; 1];
                loop {
                    match serial.read(&mut byte).await {
                        Ok(0) | Err(_) => return Err(CaptureError::Link("read failed")),
                        Ok(_) => {}
                    }
                    match byte[0] {
                        b'\n' if !line.trim().is_empty() => return Ok(line),
                        b'\n' | b'\r' => {}
                        b => line
                            .push(char::from(b))
                            .map_err(|_| CaptureError::Link("header too long"))?,
                    }
                }
            })
            .await;

        line.unwrap_or(Err(CaptureError::Timeout))
    }

    /// Read one chunk, allowing the sender a single re-send.
    async fn read_chunk(&mut self, chunk: &mut [u8], offset: usize) -> Result<(), CaptureError> {
        for attempt in 0..2 {
            match self
                .clock
                .timeout(self.ack_timeout, self.serial.read_exact(chunk))
                .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(ReadExactError::UnexpectedEof)) => {
                    return Err(CaptureError::Link("stream ended mid-transfer"));
                }
                Ok(Err(ReadExactError::Other(e))) => {
                    error!("camera link read failed: {e:?}");
                    return Err(CaptureError::Link("read failed"));
                }
                Err(_) if attempt == 0 => {
                    warn!("chunk at offset {offset} stalled, waiting for re-send");
                }
                Err(_) => {}
            }
        }

        error!("chunk at offset {offset} lost twice");
        Err(CaptureError::Timeout)
    }
}

/// Parse `<timestamp>|<size>`.
fn parse_header(line: &str) -> Result<(&str, usize), CaptureError> {
    let line = line.trim();
    if line.starts_with("ERR") {
        warn!("camera rejected request: {line}");
        return Err(CaptureError::Link("camera rejected the request"));
    }

    let (stamp, size) = line
        .split_once('|')
        .ok_or(CaptureError::Link("malformed header"))?;
    let size = size
        .trim()
        .parse()
        .map_err(|_| CaptureError::Link("malformed size"))?;
    Ok((stamp.trim(), size))
}

impl<S: Read + Write, C: Clock> CaptureSource for UartCameraLink<S, C> {
    async fn capture(&mut self) -> Result<ImageBuffer, CaptureError> {
        let mut request: String<32> = String::new();
        core::fmt::write(
            &mut request,
            format_args!("foto {} {}\n", self.settings.width(), self.settings.quality()),
        )
        .map_err(|_| CaptureError::Link("request too long"))?;
        self.send_line(request.as_bytes()).await?;

        let header = self.read_header().await?;
        let (stamp, size) = parse_header(&header)?;
        debug!("camera announced {size} bytes as {stamp}");

        if size == 0 {
            return Err(CaptureError::EmptyFrame);
        }
        if size > self.max_bytes {
            return Err(CaptureError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let mut label: String<LABEL_CAPACITY> = String::new();
        for c in stamp.chars() {
            if label.push(c).is_err() {
                break;
            }
        }

        let mut data = allocate_frame(size)?;
        self.send_line(b"READY\n").await?;

        let chunk_size = self.chunk_size;
        let mut offset = 0;
        while offset < size {
            let end = (offset + chunk_size).min(size);
            self.read_chunk(&mut data[offset..end], offset).await?;
            self.send_line(b"ACK\n").await?;
            offset = end;
        }
        self.send_line(b"DONE\n").await?;

        let (width, height) =
            jpeg_dimensions(&data).unwrap_or((self.settings.width(), 0));
        info!("received {size} byte frame {label} ({width}x{height})");

        let info = FrameInfo {
            width,
            height,
            quality: self.settings.quality(),
        };
        Ok(ImageBuffer::new(data, Encoding::Jpeg, self.clock.now_ms(), info).with_label(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RawConfig;
    use crate::emulator::{CameraComputer, CameraComputerFault};
    use embassy_futures::block_on;

    fn link(pi: &CameraComputer<ManualClock>, clock: &ManualClock) -> UartCameraLink<crate::emulator::EmulatedSerial, ManualClock> {
        let config = DeviceConfig::from_raw(&RawConfig::EXAMPLE).unwrap();
        UartCameraLink::new(pi.serial(), &config, clock.clone())
    }

    #[test]
    fn test_transfer_with_acks() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 1000);
        let mut link = link(&pi, &clock);

        let image = block_on(link.capture()).unwrap();

        assert_eq!(image.len(), 1000);
        assert_eq!(image.bytes(), pi.last_frame().as_slice());
        assert_eq!(image.label(), Some("20250101_120000"));
        assert_eq!(image.info().width, 1024);
        assert_eq!(pi.requests(), ["foto 1024 6"]);
        assert_eq!(pi.acks(), 1000usize.div_ceil(DEFAULT_CHUNK_SIZE));
        assert!(pi.done());
    }

    #[test]
    fn test_stalled_chunk_is_read_again() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 700);
        pi.inject(CameraComputerFault::StallChunk { index: 1, times: 1 });
        let mut link = link(&pi, &clock);

        let image = block_on(link.capture()).unwrap();

        assert_eq!(image.bytes(), pi.last_frame().as_slice());
        assert_eq!(pi.resends(), 1);
    }

    #[test]
    fn test_chunk_lost_twice_fails() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 700);
        pi.inject(CameraComputerFault::StallChunk { index: 0, times: 2 });
        let mut link = link(&pi, &clock);

        assert_eq!(block_on(link.capture()), Err(CaptureError::Timeout));
        assert!(!pi.done());
    }

    #[test]
    fn test_rejected_request() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 700);
        pi.inject(CameraComputerFault::RejectCommand);
        let mut link = link(&pi, &clock);

        assert_eq!(
            block_on(link.capture()),
            Err(CaptureError::Link("camera rejected the request"))
        );
    }

    #[test]
    fn test_oversized_frame_is_refused_before_ready() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 150_000);
        let mut link = link(&pi, &clock);

        assert!(matches!(
            block_on(link.capture()),
            Err(CaptureError::TooLarge { size: 150_000, .. })
        ));
        assert!(!pi.ready_seen());
    }

    #[test]
    fn test_silent_camera_times_out() {
        let clock = ManualClock::new();
        let pi = CameraComputer::new(clock.clone(), 700);
        pi.inject(CameraComputerFault::Silent);
        let mut link = link(&pi, &clock);

        assert_eq!(block_on(link.capture()), Err(CaptureError::Timeout));
        assert_eq!(clock.now_ms(), DEFAULT_RESPONSE_TIMEOUT.as_millis());
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(parse_header("20250101_120000|4096\r"), Ok(("20250101_120000", 4096)));
        assert!(parse_header("ERR_WIDTH").is_err());
        assert!(parse_header("nonsense").is_err());
        assert!(parse_header("x|-4").is_err());
    }
}
