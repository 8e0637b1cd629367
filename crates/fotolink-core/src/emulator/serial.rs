use alloc::rc::Rc;
use core::cell::RefCell;
use core::convert::Infallible;
use core::future::poll_fn;
use core::task::Poll;

use embedded_io_async::{ErrorType, Read, Write};

/// Device on the far end of an [`EmulatedSerial`] line.
pub trait Peer {
    /// Bytes written by the firmware side.
    fn from_device(&mut self, bytes: &[u8]);

    /// Fill `buf` with bytes for the firmware side; `0` when nothing is
    /// available yet.
    fn to_device(&mut self, buf: &mut [u8]) -> usize;
}

/// In-memory UART. A read with nothing to deliver stays pending, so only a
/// [`Clock`](crate::clock::Clock) timeout ends a wait on a silent peer.
#[derive(Clone)]
pub struct EmulatedSerial {
    peer: Rc<RefCell<dyn Peer>>,
}

impl EmulatedSerial {
    pub fn new(peer: Rc<RefCell<dyn Peer>>) -> Self {
        Self { peer }
    }
}

impl ErrorType for EmulatedSerial {
    type Error = Infallible;
}

impl Read for EmulatedSerial {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        poll_fn(|_| match self.peer.borrow_mut().to_device(buf) {
            0 => Poll::Pending,
            n => Poll::Ready(Ok(n)),
        })
        .await
    }
}

impl Write for EmulatedSerial {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.peer.borrow_mut().from_device(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
