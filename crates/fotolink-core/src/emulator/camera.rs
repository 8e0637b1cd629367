use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::future::pending;

use log::{debug, trace};

use super::serial::{EmulatedSerial, Peer};
use crate::capture::uart_link::{DEFAULT_ACK_TIMEOUT, DEFAULT_CHUNK_SIZE};
use crate::capture::{CaptureSettings, Encoding, Exposure, FrameInfo, ImageSensor};
use crate::clock::Clock;

/// Bytes [`synthetic_jpeg`] adds around the payload.
pub const JPEG_OVERHEAD: usize = 23;

const CAMERA_TIMESTAMP: &str = "20250101_120000";

/// A minimal JPEG stream: SOI, a baseline SOF0 carrying the dimensions,
/// `payload_len` bytes of pseudo-random scan data and EOI. The payload never
/// contains `0xFF`, so no marker can appear inside it.
pub fn synthetic_jpeg(width: u16, height: u16, payload_len: usize, seed: u32) -> Vec<u8> {
    let [h_hi, h_lo] = height.to_be_bytes();
    let [w_hi, w_lo] = width.to_be_bytes();

    let mut data = Vec::with_capacity(payload_len + JPEG_OVERHEAD);
    data.extend_from_slice(&[0xFF, 0xD8]);
    data.extend_from_slice(&[
        0xFF, 0xC0, 0x00, 0x11, 0x08, h_hi, h_lo, w_hi, w_lo, 0x03, 0x01, 0x22, 0x00, 0x02, 0x11,
        0x01, 0x03, 0x11, 0x01,
    ]);

    let mut state = seed | 1;
    data.extend((0..payload_len).map(|_| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state % 0xFF) as u8
    }));

    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// A JPEG of exactly `size` bytes.
fn jpeg_of_size(width: u16, height: u16, size: usize, seed: u32) -> Vec<u8> {
    let mut frame = synthetic_jpeg(width, height, size.saturating_sub(JPEG_OVERHEAD), seed);
    frame.truncate(size);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFault {
    /// The exposure itself fails.
    Exposure,
    /// Exposure reports a zero-byte frame.
    Empty,
    /// Exposure never completes.
    Hang,
    /// Readout of the encoded frame fails.
    Readout,
}

#[derive(Debug, Default)]
struct SensorInner {
    fault: Option<SensorFault>,
    frame_size: Option<usize>,
    frame: Vec<u8>,
    exposures: u32,
}

/// JPEG sensor producing [`synthetic_jpeg`] frames. Injected faults persist
/// until cleared.
#[derive(Debug, Clone, Default)]
pub struct SyntheticSensor {
    inner: Rc<RefCell<SensorInner>>,
}

impl SyntheticSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: SensorFault) {
        self.inner.borrow_mut().fault = Some(fault);
    }

    pub fn clear_fault(&self) {
        self.inner.borrow_mut().fault = None;
    }

    /// Produce frames of exactly `size` bytes instead of a size derived
    /// from the settings.
    pub fn set_frame_size(&self, size: usize) {
        self.inner.borrow_mut().frame_size = Some(size);
    }

    pub fn exposures(&self) -> u32 {
        self.inner.borrow().exposures
    }
}

impl ImageSensor for SyntheticSensor {
    type Error = SensorFault;

    fn encoding(&self) -> Encoding {
        Encoding::Jpeg
    }

    async fn expose(&mut self, settings: &CaptureSettings) -> Result<Exposure, SensorFault> {
        let fault = {
            let mut inner = self.inner.borrow_mut();
            inner.exposures += 1;
            inner.fault
        };

        let width = settings.width();
        let height = width / 4 * 3;
        let size = match fault {
            Some(SensorFault::Exposure) => return Err(SensorFault::Exposure),
            Some(SensorFault::Hang) => pending().await,
            Some(SensorFault::Empty) => 0,
            _ => {
                let mut inner = self.inner.borrow_mut();
                let size = inner.frame_size.unwrap_or_else(|| {
                    usize::from(width) * usize::from(height) * usize::from(settings.quality())
                        / 160
                });
                let seed = inner.exposures;
                inner.frame = jpeg_of_size(width, height, size, seed);
                size
            }
        };

        Ok(Exposure {
            info: FrameInfo {
                width,
                height,
                quality: settings.quality(),
            },
            size,
        })
    }

    async fn read_frame(&mut self, out: &mut [u8]) -> Result<usize, SensorFault> {
        let inner = self.inner.borrow();
        if inner.fault == Some(SensorFault::Readout) {
            return Err(SensorFault::Readout);
        }
        let n = out.len().min(inner.frame.len());
        out[..n].copy_from_slice(&inner.frame[..n]);
        Ok(n)
    }
}

/// Misbehaviour of an emulated [`CameraComputer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraComputerFault {
    /// Send only half of chunk `index`, then re-send it once the ACK
    /// timeout has passed. Repeats `times` times.
    StallChunk { index: usize, times: u32 },
    /// Answer every capture request with `ERR_CMD`.
    RejectCommand,
    /// Never answer.
    Silent,
}

struct ComputerState<C> {
    clock: C,
    frame_size: usize,
    fault: Option<CameraComputerFault>,
    line: Vec<u8>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    next_chunk: usize,
    stalled_at: Option<(usize, u64)>,
    requests: Vec<String>,
    acks: usize,
    resends: u32,
    ready_seen: bool,
    done: bool,
}

impl<C: Clock> ComputerState<C> {
    fn handle(&mut self, line: &str) {
        trace!("camera computer <- {line}");
        if let Some(args) = line.strip_prefix("foto") {
            self.requests.push(String::from(line));
            if self.fault == Some(CameraComputerFault::RejectCommand) {
                self.queue(b"ERR_CMD\n");
                return;
            }
            let width = args
                .split_whitespace()
                .next()
                .and_then(|w| w.parse::<u16>().ok())
                .unwrap_or(CaptureSettings::default().width());
            self.frame = jpeg_of_size(width, width / 4 * 3, self.frame_size, 7);
            self.next_chunk = 0;
            self.done = false;
            let header = alloc::format!("{CAMERA_TIMESTAMP}|{}\n", self.frame.len());
            self.queue(header.as_bytes());
        } else if line == "READY" {
            self.ready_seen = true;
            self.send_chunk();
        } else if line == "ACK" {
            self.acks += 1;
            self.next_chunk += 1;
            self.send_chunk();
        } else if line == "DONE" {
            debug!("camera computer: transfer complete");
            self.done = true;
        }
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.out.extend(bytes);
    }

    fn send_chunk(&mut self) {
        let index = self.next_chunk;
        let start = index * DEFAULT_CHUNK_SIZE;
        if start >= self.frame.len() {
            return;
        }
        let end = (start + DEFAULT_CHUNK_SIZE).min(self.frame.len());

        if let Some(CameraComputerFault::StallChunk { index: stall, times }) = self.fault {
            if stall == index && times > 0 {
                debug!("camera computer: stalling chunk {index}");
                self.fault = Some(CameraComputerFault::StallChunk {
                    index: stall,
                    times: times - 1,
                });
                let half = start + (end - start) / 2;
                self.out.extend(&self.frame[start..half]);
                self.stalled_at = Some((index, self.clock.now_ms()));
                return;
            }
        }
        self.out.extend(&self.frame[start..end]);
    }
}

impl<C: Clock> Peer for ComputerState<C> {
    fn from_device(&mut self, bytes: &[u8]) {
        if self.fault == Some(CameraComputerFault::Silent) {
            return;
        }
        for &byte in bytes {
            if byte == b'\n' {
                let line = core::mem::take(&mut self.line);
                if let Ok(line) = core::str::from_utf8(&line) {
                    self.handle(line.trim());
                }
            } else {
                self.line.push(byte);
            }
        }
    }

    fn to_device(&mut self, buf: &mut [u8]) -> usize {
        if let Some((index, at)) = self.stalled_at {
            if self.clock.now_ms() >= at + DEFAULT_ACK_TIMEOUT.as_millis() {
                debug!("camera computer: no ACK, re-sending chunk {index}");
                self.stalled_at = None;
                self.resends += 1;
                self.next_chunk = index;
                self.send_chunk();
            }
        }

        let n = buf.len().min(self.out.len());
        for (slot, byte) in buf.iter_mut().zip(self.out.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Companion computer that captures on request and streams the frame back
/// in ACKed chunks over an [`EmulatedSerial`].
pub struct CameraComputer<C> {
    state: Rc<RefCell<ComputerState<C>>>,
}

impl<C> Clone for CameraComputer<C> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<C: Clock + 'static> CameraComputer<C> {
    /// `frame_size` is the exact size of every frame it sends.
    pub fn new(clock: C, frame_size: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(ComputerState {
                clock,
                frame_size,
                fault: None,
                line: Vec::new(),
                out: VecDeque::new(),
                frame: Vec::new(),
                next_chunk: 0,
                stalled_at: None,
                requests: Vec::new(),
                acks: 0,
                resends: 0,
                ready_seen: false,
                done: false,
            })),
        }
    }

    pub fn serial(&self) -> EmulatedSerial {
        let peer: Rc<RefCell<dyn Peer>> = self.state.clone();
        EmulatedSerial::new(peer)
    }

    pub fn inject(&self, fault: CameraComputerFault) {
        self.state.borrow_mut().fault = Some(fault);
    }

    /// The most recently captured frame.
    pub fn last_frame(&self) -> Vec<u8> {
        self.state.borrow().frame.clone()
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.borrow().requests.clone()
    }

    pub fn acks(&self) -> usize {
        self.state.borrow().acks
    }

    pub fn resends(&self) -> u32 {
        self.state.borrow().resends
    }

    pub fn done(&self) -> bool {
        self.state.borrow().done
    }

    pub fn ready_seen(&self) -> bool {
        self.state.borrow().ready_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::jpeg_dimensions;

    #[test]
    fn test_synthetic_jpeg_layout() {
        let frame = synthetic_jpeg(1024, 768, 100, 3);
        assert_eq!(frame.len(), 100 + JPEG_OVERHEAD);
        assert_eq!(frame[..2], [0xFF, 0xD8]);
        assert_eq!(frame[frame.len() - 2..], [0xFF, 0xD9]);
        assert!(!frame[21..frame.len() - 2].contains(&0xFF));
        assert_eq!(jpeg_dimensions(&frame), Some((1024, 768)));
    }

    #[test]
    fn test_frame_of_exact_size() {
        assert_eq!(jpeg_of_size(640, 480, 1000, 0).len(), 1000);
        assert_eq!(jpeg_of_size(640, 480, 10, 0).len(), 10);
    }
}
