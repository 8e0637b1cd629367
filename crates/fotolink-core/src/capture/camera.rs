use core::fmt::Debug;
use core::future::Future;

use embassy_time::Duration;
use embedded_hal::digital::{OutputPin, PinState};
use log::{debug, error, info, warn};

use super::{
    CaptureError, CaptureSettings, CaptureSource, Encoding, FrameInfo, ImageBuffer, allocate_frame,
};
use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::hardware::{CameraLines, drive, pulse};

/// Settle time after releasing PWDN before the first register access.
const POWER_UP_SETTLE: Duration = Duration::from_millis(20);
const RESET_PULSE: Duration = Duration::from_millis(10);

/// Result of starting an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exposure {
    pub info: FrameInfo,
    /// Encoded size of the frame waiting in the sensor.
    pub size: usize,
}

/// Camera sensor with on-chip encoding.
pub trait ImageSensor {
    type Error: Debug;

    fn encoding(&self) -> Encoding;

    /// Take one exposure at `settings` and encode it.
    fn expose(
        &mut self,
        settings: &CaptureSettings,
    ) -> impl Future<Output = Result<Exposure, Self::Error>>;

    /// Copy the encoded frame into `out`; returns the number of bytes written.
    fn read_frame(&mut self, out: &mut [u8]) -> impl Future<Output = Result<usize, Self::Error>>;
}

pub struct Camera<S, P, C> {
    sensor: S,
    lines: CameraLines<P>,
    clock: C,
    settings: CaptureSettings,
    max_bytes: usize,
    timeout: Duration,
    reset_done: bool,
}

impl<S, P, C> Camera<S, P, C>
where
    S: ImageSensor,
    P: OutputPin,
    C: Clock,
{
    pub fn new(sensor: S, lines: CameraLines<P>, config: &DeviceConfig<'_>, clock: C) -> Self {
        Self {
            sensor,
            lines,
            clock,
            settings: CaptureSettings::default(),
            max_bytes: config.timing.max_image_bytes,
            timeout: config.timing.capture_timeout,
            reset_done: false,
        }
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}

/// PWDN held low for an exposure. Dropping the guard parks the sensor again,
/// so a cancelled capture never leaves the camera powered.
struct PoweredSensor<'l, P: OutputPin> {
    pwdn: Option<&'l mut P>,
}

impl<'l, P: OutputPin> PoweredSensor<'l, P> {
    fn release(pwdn: Option<&'l mut P>) -> Result<Self, CaptureError> {
        let Some(pin) = pwdn else {
            return Ok(Self { pwdn: None });
        };
        drive(&mut *pin, "camera PWDN", PinState::Low)?;
        Ok(Self { pwdn: Some(pin) })
    }

    fn is_switched(&self) -> bool {
        self.pwdn.is_some()
    }

    fn park(mut self) -> Result<(), CaptureError> {
        match self.pwdn.take() {
            Some(pin) => Ok(drive(pin, "camera PWDN", PinState::High)?),
            None => Ok(()),
        }
    }
}

impl<P: OutputPin> Drop for PoweredSensor<'_, P> {
    fn drop(&mut self) {
        if let Some(pin) = self.pwdn.take() {
            debug!("capture abandoned, parking camera");
            let _ = drive(pin, "camera PWDN", PinState::High);
        }
    }
}

async fn grab<S: ImageSensor, C: Clock>(
    sensor: &mut S,
    settings: CaptureSettings,
    max_bytes: usize,
    clock: &C,
) -> Result<ImageBuffer, CaptureError> {
    let exposure = sensor.expose(&settings).await.map_err(|e| {
        error!("exposure failed: {e:?}");
        CaptureError::Sensor("exposure failed")
    })?;

    if exposure.size == 0 {
        return Err(CaptureError::EmptyFrame);
    }
    if exposure.size > max_bytes {
        warn!("frame of {} bytes over the {max_bytes} byte limit", exposure.size);
        return Err(CaptureError::TooLarge {
            size: exposure.size,
            limit: max_bytes,
        });
    }

    let mut data = allocate_frame(exposure.size)?;
    let read = sensor.read_frame(&mut data).await.map_err(|e| {
        error!("frame readout failed: {e:?}");
        CaptureError::Sensor("readout failed")
    })?;
    if read == 0 {
        return Err(CaptureError::EmptyFrame);
    }
    data.truncate(read);

    Ok(ImageBuffer::new(
        data,
        sensor.encoding(),
        clock.now_ms(),
        exposure.info,
    ))
}

impl<S, P, C> CaptureSource for Camera<S, P, C>
where
    S: ImageSensor,
    P: OutputPin,
    C: Clock,
{
    async fn capture(&mut self) -> Result<ImageBuffer, CaptureError> {
        let powered = PoweredSensor::release(self.lines.power_down.as_mut())?;
        if powered.is_switched() {
            self.clock.sleep(POWER_UP_SETTLE).await;
        }
        if !self.reset_done {
            if let Some(reset) = self.lines.reset.as_mut() {
                debug!("resetting camera sensor");
                pulse(reset, "camera RESET", &self.clock, RESET_PULSE).await?;
            }
            self.reset_done = true;
        }

        let exposure = grab(&mut self.sensor, self.settings, self.max_bytes, &self.clock);
        let result = match self.clock.timeout(self.timeout, exposure).await {
            Ok(result) => result,
            Err(_) => {
                error!("capture timed out");
                Err(CaptureError::Timeout)
            }
        };

        let parked = powered.park();
        let image = result?;
        parked?;

        info!(
            "captured {}x{} frame, {} bytes",
            image.info().width,
            image.info().height,
            image.len()
        );
        Ok(image)
    }
}
