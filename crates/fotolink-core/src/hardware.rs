//! GPIO ownership
//!
//! Control lines are claimed exactly once from a [`GpioBank`] and then moved
//! into the component that drives them. Only pins present in a validated
//! [`DeviceConfig`] are ever requested, so "not wired" pins never reach the
//! bank.

use core::fmt::Debug;

use embassy_time::Duration;
use embedded_hal::digital::{OutputPin, PinState};
use log::{debug, error};
use thiserror_no_std::Error;

use crate::clock::Clock;
use crate::config::{DeviceConfig, GpioNum, RawConfig};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    #[error("could not claim GPIO{pin} for {role}")]
    ClaimFailed { role: &'static str, pin: u8 },
    #[error("could not drive the {line} line")]
    Drive { line: &'static str },
}

/// Source of output pins, implemented by the board support layer.
pub trait GpioBank {
    type Output: OutputPin;
    type Error: Debug;

    /// Configure `pin` as a push-pull output starting at `initial`.
    fn output(&mut self, pin: GpioNum, initial: PinState) -> Result<Self::Output, Self::Error>;
}

/// SIM7600 control lines. PWRKEY and RESET are active low: both idle high
/// and are pulled low for a pulse.
pub struct ModemLines<P> {
    pub power: P,
    pub reset: Option<P>,
}

/// Camera control lines. PWDN high keeps the sensor powered down; RESET is
/// active low.
pub struct CameraLines<P> {
    pub power_down: Option<P>,
    pub reset: Option<P>,
}

pub struct Peripherals<P> {
    pub modem: ModemLines<P>,
    pub camera: CameraLines<P>,
}

impl<P: OutputPin> Peripherals<P> {
    /// Claim every configured control line, in its idle state.
    pub fn claim<B>(config: &DeviceConfig<'_>, bank: &mut B) -> Result<Self, HardwareError>
    where
        B: GpioBank<Output = P>,
    {
        let modem = ModemLines {
            power: claim(bank, "modem PWRKEY", config.modem.power, PinState::High)?,
            reset: claim_optional(bank, "modem RESET", config.modem.reset, PinState::High)?,
        };
        let camera = CameraLines {
            power_down: claim_optional(
                bank,
                "camera PWDN",
                config.camera.power_down,
                PinState::High,
            )?,
            reset: claim_optional(bank, "camera RESET", config.camera.reset, PinState::High)?,
        };

        Ok(Self { modem, camera })
    }
}

/// Validate `raw` and claim its pins. Nothing is touched unless the whole
/// configuration is valid.
pub fn bring_up<'a, B: GpioBank>(
    raw: &RawConfig<'a>,
    bank: &mut B,
) -> Result<(DeviceConfig<'a>, Peripherals<B::Output>), crate::Error> {
    let config = DeviceConfig::from_raw(raw)?;
    let peripherals = Peripherals::claim(&config, bank)?;
    Ok((config, peripherals))
}

fn claim<B: GpioBank>(
    bank: &mut B,
    role: &'static str,
    pin: GpioNum,
    initial: PinState,
) -> Result<B::Output, HardwareError> {
    debug!("claiming {pin} for {role}");
    bank.output(pin, initial).map_err(|e| {
        error!("failed to claim {pin} for {role}: {e:?}");
        HardwareError::ClaimFailed {
            role,
            pin: pin.get(),
        }
    })
}

fn claim_optional<B: GpioBank>(
    bank: &mut B,
    role: &'static str,
    pin: Option<GpioNum>,
    initial: PinState,
) -> Result<Option<B::Output>, HardwareError> {
    pin.map(|pin| claim(bank, role, pin, initial)).transpose()
}

/// Drive `pin` to `state`, mapping the HAL error to the named line.
pub fn drive<P: OutputPin>(
    pin: &mut P,
    line: &'static str,
    state: PinState,
) -> Result<(), HardwareError> {
    pin.set_state(state).map_err(|e| {
        error!("{line} line: {e:?}");
        HardwareError::Drive { line }
    })
}

/// Hold an active-low `pin` asserted for `width`, then release it.
pub async fn pulse<P: OutputPin, C: Clock>(
    pin: &mut P,
    line: &'static str,
    clock: &C,
    width: Duration,
) -> Result<(), HardwareError> {
    drive(pin, line, PinState::Low)?;
    clock.sleep(width).await;
    drive(pin, line, PinState::High)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PIN_UNUSED;
    use crate::emulator::EmulatedBoard;
    use embassy_futures::block_on;

    #[test]
    fn test_claims_only_configured_pins() {
        let mut board = EmulatedBoard::new();
        let raw = RawConfig::EXAMPLE;
        let (_, peripherals) = bring_up(&raw, &mut board).unwrap();

        assert!(peripherals.modem.reset.is_some());
        assert!(peripherals.camera.power_down.is_some());
        assert!(peripherals.camera.reset.is_none());
        assert_eq!(board.claimed(), [(4, true), (5, true), (32, true)]);
    }

    #[test]
    fn test_invalid_config_touches_no_pin() {
        let mut board = EmulatedBoard::new();
        let raw = RawConfig {
            camera_pin_reset: -7,
            ..RawConfig::EXAMPLE
        };

        assert!(matches!(
            bring_up(&raw, &mut board),
            Err(crate::Error::ConfigInvalid(_))
        ));
        assert!(board.claimed().is_empty());
    }

    #[test]
    fn test_claim_failure_names_role_and_pin() {
        let mut board = EmulatedBoard::new();
        board.refuse(5);
        let raw = RawConfig::EXAMPLE;

        assert!(matches!(
            bring_up(&raw, &mut board),
            Err(crate::Error::Peripheral(HardwareError::ClaimFailed {
                role: "modem RESET",
                pin: 5
            }))
        ));
    }

    #[test]
    fn test_unwired_reset_is_not_requested() {
        let mut board = EmulatedBoard::new();
        let raw = RawConfig {
            modem_rst_pin: PIN_UNUSED,
            ..RawConfig::EXAMPLE
        };
        let (_, peripherals) = bring_up(&raw, &mut board).unwrap();

        assert!(peripherals.modem.reset.is_none());
        assert_eq!(board.claimed(), [(4, true), (32, true)]);
    }

    #[test]
    fn test_pulse_releases_line_high() {
        let mut board = EmulatedBoard::new();
        let (_, mut peripherals) = bring_up(&RawConfig::EXAMPLE, &mut board).unwrap();
        let clock = ManualClock::new();

        block_on(pulse(
            &mut peripherals.modem.power,
            "PWRKEY",
            &clock,
            Duration::from_millis(500),
        ))
        .unwrap();

        assert_eq!(peripherals.modem.power.history(), [false, true]);
        assert_eq!(clock.sleeps(), [Duration::from_millis(500)]);
    }
}
