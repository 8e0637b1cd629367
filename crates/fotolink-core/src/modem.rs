//! SIM7600 power sequencing and bounded UART access
//!
//! The modem is switched with PWRKEY pulses and answers on a UART once it has
//! booted. [`Modem::power_on`] first checks whether the modem is already up
//! (a PWRKEY pulse would switch a running modem off), then pulses and probes
//! with `AT` until the modem answers or the bring-up timeout expires.

use embassy_time::Duration;
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use heapless::Vec;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::clock::Clock;
use crate::config::Timing;
use crate::hardware::{HardwareError, ModemLines, pulse};

/// Replies that mean the modem firmware is accepting commands.
const READY_TOKENS: [&[u8]; 3] = [b"OK", b"RDY", b"PB DONE"];

const PROBE: &[u8] = b"AT\r";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    #[error("modem did not answer within the bring-up timeout")]
    BringupTimeout,
    #[error("no UART data within {waited_ms} ms")]
    UartTimeout { waited_ms: u64 },
    #[error("UART {operation} failed")]
    Uart { operation: &'static str },
    #[error("control line failure: {0}")]
    Gpio(HardwareError),
}

impl From<HardwareError> for ModemError {
    fn from(err: HardwareError) -> Self {
        Self::Gpio(err)
    }
}

pub struct Modem<U, P, C> {
    uart: U,
    power_key: P,
    reset: Option<P>,
    clock: C,
    timing: Timing,
    powered: bool,
}

impl<U, P, C> Modem<U, P, C>
where
    U: Read + Write,
    P: OutputPin,
    C: Clock,
{
    pub fn new(uart: U, lines: ModemLines<P>, clock: C, timing: Timing) -> Self {
        Self {
            uart,
            power_key: lines.power,
            reset: lines.reset,
            clock,
            timing,
            powered: false,
        }
    }

    /// Power the modem up and wait until it answers `AT`.
    pub async fn power_on(&mut self) -> Result<(), ModemError> {
        if self.powered {
            return Ok(());
        }

        if self.probe_once().await? {
            info!("modem already running");
            self.powered = true;
            return Ok(());
        }

        info!("pulsing modem PWRKEY");
        pulse(
            &mut self.power_key,
            "PWRKEY",
            &self.clock,
            self.timing.modem_power_pulse,
        )
        .await?;

        self.wait_ready().await
    }

    /// Ask the modem to switch itself off. Best effort: the modem is
    /// considered off afterwards whether or not it acknowledged.
    pub async fn power_off(&mut self) -> Result<(), ModemError> {
        if !self.powered {
            return Ok(());
        }

        self.send(b"AT+CPOF\r").await?;
        let mut buf = [0u8; 64];
        if let Err(e) = self.receive(&mut buf, self.timing.at_command_timeout).await {
            warn!("no reply to power-off request: {e}");
        }
        self.powered = false;
        Ok(())
    }

    /// Restart the modem and wait until it answers again.
    ///
    /// Uses the RESET line when one is wired; otherwise the modem is
    /// power-cycled through PWRKEY.
    pub async fn reset(&mut self) -> Result<(), ModemError> {
        match self.reset.as_mut() {
            Some(reset) => {
                info!("pulsing modem RESET");
                pulse(reset, "RESET", &self.clock, self.timing.modem_reset_pulse).await?;
            }
            None => {
                info!("no RESET line; power-cycling modem");
                if self.powered {
                    pulse(
                        &mut self.power_key,
                        "PWRKEY",
                        &self.clock,
                        self.timing.modem_power_pulse,
                    )
                    .await?;
                    self.clock.sleep(self.timing.modem_power_cycle_gap).await;
                }
                pulse(
                    &mut self.power_key,
                    "PWRKEY",
                    &self.clock,
                    self.timing.modem_power_pulse,
                )
                .await?;
            }
        }

        self.powered = false;
        self.wait_ready().await
    }

    /// Write all of `bytes` to the modem within the UART timeout.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        let timeout = self.timing.uart_timeout;
        let uart = &mut self.uart;
        let written = self
            .clock
            .timeout(timeout, async {
                uart.write_all(bytes).await?;
                uart.flush().await
            })
            .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("modem UART write failed: {e:?}");
                Err(ModemError::Uart { operation: "write" })
            }
            Err(_) => Err(ModemError::UartTimeout {
                waited_ms: timeout.as_millis(),
            }),
        }
    }

    /// Read whatever the modem sends next, waiting at most `timeout`.
    pub async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ModemError> {
        match self.clock.timeout(timeout, self.uart.read(buf)).await {
            Ok(Ok(0)) => {
                error!("modem UART closed");
                Err(ModemError::Uart { operation: "read" })
            }
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                error!("modem UART read failed: {e:?}");
                Err(ModemError::Uart { operation: "read" })
            }
            Err(_) => Err(ModemError::UartTimeout {
                waited_ms: timeout.as_millis(),
            }),
        }
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    async fn wait_ready(&mut self) -> Result<(), ModemError> {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(self.timing.modem_bringup_timeout.as_millis());

        let mut attempts = 0u32;
        while self.clock.remaining(deadline).is_some() {
            attempts += 1;
            if self.probe_once().await? {
                info!("modem ready after {attempts} probe(s)");
                self.powered = true;
                return Ok(());
            }
        }

        error!("modem silent after {attempts} probes");
        Err(ModemError::BringupTimeout)
    }

    /// Send one `AT` probe and listen for a ready token during one probe
    /// interval.
    async fn probe_once(&mut self) -> Result<bool, ModemError> {
        self.send(PROBE).await?;

        let interval = self.timing.modem_probe_interval;
        let uart = &mut self.uart;
        let heard = self
            .clock
            .timeout(interval, async {
                let mut seen: Vec<u8, 128> = Vec::new();
                let mut chunk = [0u8; 32];
                loop {
                    let n = match uart.read(&mut chunk).await {
                        Ok(0) | Err(_) => return false,
                        Ok(n) => n,
                    };
                    for &b in &chunk[..n] {
                        if seen.push(b).is_err() {
                            let keep = seen.len() / 2;
                            seen.rotate_left(keep);
                            seen.truncate(seen.len() - keep);
                            let _ = seen.push(b);
                        }
                    }
                    if READY_TOKENS.iter().any(|token| contains(&seen, token)) {
                        return true;
                    }
                }
            })
            .await;

        match heard {
            Ok(ready) => Ok(ready),
            Err(_) => {
                debug!("no answer to AT probe");
                Ok(false)
            }
        }
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
