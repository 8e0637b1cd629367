use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, OutputPin, PinState};

use crate::config::GpioNum;
use crate::hardware::GpioBank;

#[derive(Debug, Default)]
struct PinInner {
    initial: bool,
    high: bool,
    history: Vec<bool>,
    releases: u32,
}

/// Output line whose clones share one level, so a test can watch a pin
/// after it has been moved into a driver.
#[derive(Debug, Clone, Default)]
pub struct EmulatedPin {
    inner: Rc<RefCell<PinInner>>,
}

impl EmulatedPin {
    pub fn new(high: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PinInner {
                initial: high,
                high,
                ..PinInner::default()
            })),
        }
    }

    pub fn is_high(&self) -> bool {
        self.inner.borrow().high
    }

    /// Every level driven since the pin was claimed, `true` for high.
    pub fn history(&self) -> Vec<bool> {
        self.inner.borrow().history.clone()
    }

    /// Low-to-high transitions, i.e. completed active-low pulses.
    pub fn releases(&self) -> u32 {
        self.inner.borrow().releases
    }

    fn drive(&mut self, high: bool) {
        let mut inner = self.inner.borrow_mut();
        if high && !inner.high {
            inner.releases += 1;
        }
        inner.high = high;
        inner.history.push(high);
    }
}

impl ErrorType for EmulatedPin {
    type Error = Infallible;
}

impl OutputPin for EmulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinUnavailable(pub u8);

/// GPIO bank that hands out [`EmulatedPin`]s and remembers every claim.
#[derive(Debug, Default)]
pub struct EmulatedBoard {
    pins: Vec<(u8, EmulatedPin)>,
    refused: Vec<u8>,
}

impl EmulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make claims of `pin` fail.
    pub fn refuse(&mut self, pin: u8) {
        self.refused.push(pin);
    }

    /// Claimed pins in claim order, with the level each one started at.
    pub fn claimed(&self) -> Vec<(u8, bool)> {
        self.pins
            .iter()
            .map(|(n, pin)| (*n, pin.inner.borrow().initial))
            .collect()
    }

    pub fn pin(&self, pin: u8) -> Option<EmulatedPin> {
        self.pins
            .iter()
            .find(|(n, _)| *n == pin)
            .map(|(_, pin)| pin.clone())
    }
}

impl GpioBank for EmulatedBoard {
    type Output = EmulatedPin;
    type Error = PinUnavailable;

    fn output(&mut self, pin: GpioNum, initial: PinState) -> Result<EmulatedPin, PinUnavailable> {
        let n = pin.get();
        if self.refused.contains(&n) {
            return Err(PinUnavailable(n));
        }
        let out = EmulatedPin::new(initial == PinState::High);
        self.pins.push((n, out.clone()));
        Ok(out)
    }
}
