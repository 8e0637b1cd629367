//! Device configuration
//!
//! [`RawConfig`] mirrors the build-time constants of a camera node one to one
//! (`UART_BAUDRATE`, `SIM7600_PWR_PIN`, `SERVER_URL`, ...). It is validated
//! exactly once at startup by [`DeviceConfig::from_raw`]; every component then
//! receives the resulting immutable [`DeviceConfig`] by reference in its
//! constructor. A pin value of [`PIN_UNUSED`] (`-1`) means "not wired" and
//! becomes `None`, never GPIO 0.

use core::fmt;

use embassy_time::Duration;
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::backoff::BackoffPolicy;
use crate::capture::Encoding;
use crate::http::{self, Credentials};

/// Pin value meaning "not wired / not used".
pub const PIN_UNUSED: i32 = -1;

/// Default APN when the configuration does not name one.
pub const DEFAULT_APN: &str = "internet";

/// Largest encoded frame accepted for upload, in bytes.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 112_640;

/// Configuration exactly as provided at build time (or decoded from an
/// override blob), before any validation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct RawConfig<'a> {
    pub uart_baudrate: u32,
    pub uart_rx_pin: i32,
    pub uart_tx_pin: i32,
    pub modem_pwr_pin: i32,
    pub modem_rst_pin: i32,
    pub camera_model: &'a str,
    pub camera_pin_pwdn: i32,
    pub camera_pin_reset: i32,
    pub wifi_ssid: Option<&'a str>,
    pub wifi_password: Option<&'a str>,
    pub server_url: &'a str,
    pub api_key: &'a str,
    pub cellular_apn: Option<&'a str>,
    /// Header carrying the API key; `None` sends `Authorization: Bearer`.
    pub auth_header: Option<&'a str>,
    pub capture_interval_secs: u32,
}

impl RawConfig<'static> {
    /// Values of the stock `config.example.h` template.
    pub const EXAMPLE: Self = Self {
        uart_baudrate: 115_200,
        uart_rx_pin: 16,
        uart_tx_pin: 17,
        modem_pwr_pin: 4,
        modem_rst_pin: 5,
        camera_model: "AI_THINKER",
        camera_pin_pwdn: 32,
        camera_pin_reset: PIN_UNUSED,
        wifi_ssid: Some("your_wifi_ssid"),
        wifi_password: Some("your_wifi_password"),
        server_url: "http://your-server.com/api/images",
        api_key: "your_api_key",
        cellular_apn: None,
        auth_header: None,
        capture_interval_secs: 60,
    };
}

impl<'a> RawConfig<'a> {
    /// Decode a configuration blob written with `postcard`.
    pub fn from_postcard(bytes: &'a [u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} has invalid pin number {value}")]
    InvalidPin { field: &'static str, value: i32 },
    #[error("{field} uses GPIO{pin}, which is reserved on this board")]
    ReservedPin { field: &'static str, pin: u8 },
    #[error("{field} must drive an output but GPIO{pin} is input-only")]
    InputOnlyPin { field: &'static str, pin: u8 },
    #[error("{field} is required but marked as not wired")]
    MissingPin { field: &'static str },
    #[error("{first} and {second} both use GPIO{pin}")]
    DuplicatePin {
        first: &'static str,
        second: &'static str,
        pin: u8,
    },
    #[error("UART baud rate {0} is out of range")]
    InvalidBaudRate(u32),
    #[error("unknown camera model {0}")]
    UnknownCameraModel(String<32>),
    #[error("server URL is malformed: {0}")]
    MalformedUrl(&'static str),
    #[error("API key is empty")]
    MissingApiKey,
    #[error("API key contains characters not allowed in an HTTP header")]
    InvalidApiKey,
    #[error("authentication header name is not a valid HTTP token")]
    InvalidAuthHeader,
    #[error("WiFi password given without an SSID")]
    IncompleteWifiCredentials,
    #[error("WiFi SSID must be at most 32 bytes")]
    InvalidSsid,
    #[error("WiFi passphrase must be 8 to 63 bytes")]
    InvalidPassphrase,
    #[error("cellular APN must not contain quotes or control characters")]
    InvalidApn,
    #[error("capture interval must be at least one second")]
    InvalidInterval,
    #[error("upload request head would need {needed} bytes, at most {limit} fit")]
    RequestTooLarge { needed: usize, limit: usize },
}

/// GPIO number that has been checked against a [`BoardProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpioNum(u8);

impl GpioNum {
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for GpioNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// How a pin will be driven; input-only pads cannot take output roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinRole {
    Input,
    Output,
}

/// GPIO layout rules of the target chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardProfile {
    pub name: &'static str,
    pub max_gpio: u8,
    /// Pads that do not exist or are wired to flash/PSRAM.
    pub reserved: &'static [u8],
    /// Pads without an output driver.
    pub input_only: &'static [u8],
}

impl BoardProfile {
    /// Classic ESP32 (WROOM/WROVER modules, AI-Thinker ESP32-CAM).
    pub const ESP32: Self = Self {
        name: "esp32",
        max_gpio: 39,
        reserved: &[6, 7, 8, 9, 10, 11, 20, 24, 28, 29, 30, 31],
        input_only: &[34, 35, 36, 37, 38, 39],
    };

    /// ESP32-S3 with octal flash/PSRAM.
    pub const ESP32_S3: Self = Self {
        name: "esp32s3",
        max_gpio: 48,
        reserved: &[22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32],
        input_only: &[],
    };

    fn pin(&self, field: &'static str, value: i32, role: PinRole) -> Result<Option<GpioNum>, ConfigError> {
        if value == PIN_UNUSED {
            return Ok(None);
        }
        if value < 0 || value > i32::from(self.max_gpio) {
            return Err(ConfigError::InvalidPin { field, value });
        }

        let pin = value as u8;
        if self.reserved.contains(&pin) {
            return Err(ConfigError::ReservedPin { field, pin });
        }
        if role == PinRole::Output && self.input_only.contains(&pin) {
            return Err(ConfigError::InputOnlyPin { field, pin });
        }

        Ok(Some(GpioNum(pin)))
    }

    fn required_pin(
        &self,
        field: &'static str,
        value: i32,
        role: PinRole,
    ) -> Result<GpioNum, ConfigError> {
        self.pin(field, value, role)?
            .ok_or(ConfigError::MissingPin { field })
    }
}

/// Camera board variants with a known pin-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModel {
    AiThinker,
    WroverKit,
    EspEye,
    M5StackPsram,
    TtgoTCamera,
    XiaoEsp32S3,
}

impl CameraModel {
    const ALL: [Self; 6] = [
        Self::AiThinker,
        Self::WroverKit,
        Self::EspEye,
        Self::M5StackPsram,
        Self::TtgoTCamera,
        Self::XiaoEsp32S3,
    ];

    /// Parse a `CAMERA_MODEL` tag; the `CAMERA_MODEL_` prefix is optional.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        let tag = tag
            .get(..13)
            .filter(|prefix| prefix.eq_ignore_ascii_case("CAMERA_MODEL_"))
            .map_or(tag, |_| &tag[13..]);

        Self::ALL
            .into_iter()
            .find(|model| model.tag().eq_ignore_ascii_case(tag))
    }

    pub const fn tag(self) -> &'static str {
        match self {
            Self::AiThinker => "AI_THINKER",
            Self::WroverKit => "WROVER_KIT",
            Self::EspEye => "ESP_EYE",
            Self::M5StackPsram => "M5STACK_PSRAM",
            Self::TtgoTCamera => "TTGO_T_CAMERA",
            Self::XiaoEsp32S3 => "XIAO_ESP32S3",
        }
    }

    /// Every supported module ships an OV2640 with on-chip JPEG.
    pub const fn encoding(self) -> Encoding {
        Encoding::Jpeg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Parsed `SERVER_URL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
    /// Path plus optional query, always starting with `/`.
    pub path: &'a str,
}

impl<'a> Endpoint<'a> {
    pub fn parse(url: &'a str) -> Result<Self, ConfigError> {
        if url.is_empty() {
            return Err(ConfigError::MalformedUrl("empty"));
        }
        if url
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(ConfigError::MalformedUrl(
                "contains whitespace or control characters",
            ));
        }

        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(url, "https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(url, "http://") {
            (Scheme::Http, rest)
        } else {
            return Err(ConfigError::MalformedUrl("scheme must be http or https"));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        if authority.contains(['?', '#']) {
            return Err(ConfigError::MalformedUrl("query without a path"));
        }
        if path.contains('#') {
            return Err(ConfigError::MalformedUrl("fragments are not allowed"));
        }
        if authority.contains('@') {
            return Err(ConfigError::MalformedUrl(
                "credentials in the URL are not supported",
            ));
        }
        if authority.starts_with('[') {
            return Err(ConfigError::MalformedUrl(
                "IPv6 literals are not supported",
            ));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or(ConfigError::MalformedUrl("invalid port"))?;
                (host, port)
            }
            None => (authority, scheme.default_port()),
        };

        if !is_valid_host(host) {
            return Err(ConfigError::MalformedUrl("invalid host name"));
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    pub const fn is_secure(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    pub const fn has_default_port(&self) -> bool {
        self.port == self.scheme.default_port()
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &value[prefix.len()..])
}

fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiCredentials<'a> {
    pub ssid: &'a str,
    /// `None` joins an open network.
    pub passphrase: Option<&'a str>,
}

/// How the API key travels with each upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme<'a> {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `<name>: <key>`
    Header(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub baudrate: u32,
    pub rx: GpioNum,
    pub tx: GpioNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemPins {
    /// PWRKEY line; required.
    pub power: GpioNum,
    /// RESET line; without it a reset power-cycles through PWRKEY.
    pub reset: Option<GpioNum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConfig {
    pub model: CameraModel,
    pub power_down: Option<GpioNum>,
    pub reset: Option<GpioNum>,
}

/// Timeouts, retry bounds and delays of every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long PWRKEY is held to toggle modem power.
    pub modem_power_pulse: Duration,
    /// How long RESET is held.
    pub modem_reset_pulse: Duration,
    /// Pause between power-off and power-on when no RESET line is wired.
    pub modem_power_cycle_gap: Duration,
    pub modem_bringup_timeout: Duration,
    /// Spacing of `AT` probes while waiting for the modem to boot.
    pub modem_probe_interval: Duration,
    pub uart_timeout: Duration,
    pub at_command_timeout: Duration,
    pub registration_timeout: Duration,
    pub registration_poll: Duration,
    pub wifi_join_timeout: Duration,
    /// Bound on one HTTP exchange (connect, send, status line).
    pub http_timeout: Duration,
    pub upload_retries: u32,
    pub upload_backoff: BackoffPolicy,
    pub reacquire_backoff: BackoffPolicy,
    pub capture_timeout: Duration,
    pub capture_interval: Duration,
    pub cycle_backoff: BackoffPolicy,
    /// Consecutive failed cycles tolerated before a fatal health report.
    pub failure_ceiling: u32,
    /// Consecutive capture faults before the camera is reported broken.
    pub capture_fault_limit: u32,
    pub max_image_bytes: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            modem_power_pulse: Duration::from_millis(500),
            modem_reset_pulse: Duration::from_millis(300),
            modem_power_cycle_gap: Duration::from_secs(3),
            modem_bringup_timeout: Duration::from_secs(30),
            modem_probe_interval: Duration::from_secs(1),
            uart_timeout: Duration::from_secs(10),
            at_command_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(60),
            registration_poll: Duration::from_secs(2),
            wifi_join_timeout: Duration::from_secs(15),
            http_timeout: Duration::from_secs(30),
            upload_retries: 3,
            upload_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(16), 2),
            reacquire_backoff: BackoffPolicy::new(
                Duration::from_secs(2),
                Duration::from_secs(60),
                2,
            ),
            capture_timeout: Duration::from_secs(10),
            capture_interval: Duration::from_secs(60),
            cycle_backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300), 2),
            failure_ceiling: 2,
            capture_fault_limit: 3,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl Timing {
    /// Worst-case time to bring the cellular link up from power-off.
    pub fn cellular_budget(&self) -> Duration {
        self.modem_bringup_timeout + self.registration_timeout + self.at_command_timeout
    }

    pub fn wifi_budget(&self) -> Duration {
        self.wifi_join_timeout
    }
}

/// Validated, immutable device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig<'a> {
    pub board: BoardProfile,
    pub uart: UartConfig,
    pub modem: ModemPins,
    pub camera: CameraConfig,
    pub wifi: Option<WifiCredentials<'a>>,
    pub endpoint: Endpoint<'a>,
    pub api_key: &'a str,
    pub auth: AuthScheme<'a>,
    pub apn: &'a str,
    pub timing: Timing,
}

impl<'a> DeviceConfig<'a> {
    /// Validate `raw` for a classic ESP32 board.
    pub fn from_raw(raw: &RawConfig<'a>) -> Result<Self, ConfigError> {
        Self::from_raw_for(raw, BoardProfile::ESP32)
    }

    pub fn from_raw_for(raw: &RawConfig<'a>, board: BoardProfile) -> Result<Self, ConfigError> {
        if !(300..=4_000_000).contains(&raw.uart_baudrate) {
            return Err(ConfigError::InvalidBaudRate(raw.uart_baudrate));
        }

        let uart = UartConfig {
            baudrate: raw.uart_baudrate,
            rx: board.required_pin("UART_RX_PIN", raw.uart_rx_pin, PinRole::Input)?,
            tx: board.required_pin("UART_TX_PIN", raw.uart_tx_pin, PinRole::Output)?,
        };
        let modem = ModemPins {
            power: board.required_pin("SIM7600_PWR_PIN", raw.modem_pwr_pin, PinRole::Output)?,
            reset: board.pin("SIM7600_RST_PIN", raw.modem_rst_pin, PinRole::Output)?,
        };

        let model = CameraModel::from_tag(raw.camera_model).ok_or_else(|| {
            let mut name = String::new();
            for c in raw.camera_model.chars() {
                if name.push(c).is_err() {
                    break;
                }
            }
            ConfigError::UnknownCameraModel(name)
        })?;
        let camera = CameraConfig {
            model,
            power_down: board.pin("CAMERA_PIN_PWDN", raw.camera_pin_pwdn, PinRole::Output)?,
            reset: board.pin("CAMERA_PIN_RESET", raw.camera_pin_reset, PinRole::Output)?,
        };

        check_distinct(&[
            ("UART_RX_PIN", Some(uart.rx)),
            ("UART_TX_PIN", Some(uart.tx)),
            ("SIM7600_PWR_PIN", Some(modem.power)),
            ("SIM7600_RST_PIN", modem.reset),
            ("CAMERA_PIN_PWDN", camera.power_down),
            ("CAMERA_PIN_RESET", camera.reset),
        ])?;

        let wifi = wifi_credentials(raw.wifi_ssid, raw.wifi_password)?;
        let endpoint = Endpoint::parse(raw.server_url.trim())?;

        let api_key = raw.api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if api_key.bytes().any(|b| b.is_ascii_control()) {
            return Err(ConfigError::InvalidApiKey);
        }

        let auth = match raw.auth_header.map(str::trim) {
            None | Some("") => AuthScheme::Bearer,
            Some(name) if is_http_token(name) => AuthScheme::Header(name),
            Some(_) => return Err(ConfigError::InvalidAuthHeader),
        };

        let needed = http::max_head_len(&endpoint, &Credentials { scheme: auth, api_key });
        if needed > http::HEAD_CAPACITY {
            return Err(ConfigError::RequestTooLarge {
                needed,
                limit: http::HEAD_CAPACITY,
            });
        }

        let apn = match raw.cellular_apn.map(str::trim) {
            None | Some("") => DEFAULT_APN,
            Some(apn) if apn.bytes().any(|b| b == b'"' || b.is_ascii_control()) => {
                return Err(ConfigError::InvalidApn);
            }
            Some(apn) => apn,
        };

        if raw.capture_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        let timing = Timing {
            capture_interval: Duration::from_secs(u64::from(raw.capture_interval_secs)),
            ..Timing::default()
        };

        Ok(Self {
            board,
            uart,
            modem,
            camera,
            wifi,
            endpoint,
            api_key,
            auth,
            apn,
            timing,
        })
    }

    /// Replace the timing policy, keeping everything else.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

fn check_distinct(pins: &[(&'static str, Option<GpioNum>)]) -> Result<(), ConfigError> {
    let assigned: Vec<(&'static str, GpioNum), 8> = pins
        .iter()
        .filter_map(|(field, pin)| pin.map(|pin| (*field, pin)))
        .collect();

    for (idx, (first, pin)) in assigned.iter().enumerate() {
        if let Some((second, _)) = assigned[idx + 1..].iter().find(|(_, other)| other == pin) {
            return Err(ConfigError::DuplicatePin {
                first,
                second,
                pin: pin.get(),
            });
        }
    }

    Ok(())
}

fn wifi_credentials<'a>(
    ssid: Option<&'a str>,
    password: Option<&'a str>,
) -> Result<Option<WifiCredentials<'a>>, ConfigError> {
    let ssid = ssid.filter(|ssid| !ssid.is_empty());
    let passphrase = password.filter(|password| !password.is_empty());

    let Some(ssid) = ssid else {
        return match passphrase {
            Some(_) => Err(ConfigError::IncompleteWifiCredentials),
            None => Ok(None),
        };
    };

    if ssid.len() > 32 {
        return Err(ConfigError::InvalidSsid);
    }
    if let Some(passphrase) = passphrase {
        if !(8..=63).contains(&passphrase.len()) {
            return Err(ConfigError::InvalidPassphrase);
        }
    }

    Ok(Some(WifiCredentials { ssid, passphrase }))
}

fn is_http_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> RawConfig<'static> {
        RawConfig::EXAMPLE
    }

    #[test]
    fn test_example_template_is_valid() {
        let config = DeviceConfig::from_raw(&example()).unwrap();

        assert_eq!(config.uart.baudrate, 115_200);
        assert_eq!(config.uart.rx.get(), 16);
        assert_eq!(config.modem.power.get(), 4);
        assert_eq!(config.modem.reset.map(GpioNum::get), Some(5));
        assert_eq!(config.camera.model, CameraModel::AiThinker);
        assert_eq!(config.camera.power_down.map(GpioNum::get), Some(32));
        assert_eq!(config.endpoint.host, "your-server.com");
        assert_eq!(config.endpoint.path, "/api/images");
        assert_eq!(config.auth, AuthScheme::Bearer);
        assert_eq!(config.apn, DEFAULT_APN);
        assert_eq!(config.timing.capture_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_unused_pin_is_absent_not_gpio_zero() {
        let config = DeviceConfig::from_raw(&example()).unwrap();
        assert_eq!(config.camera.reset, None);
    }

    #[test]
    fn test_gpio_zero_is_a_real_pin() {
        let raw = RawConfig {
            camera_pin_reset: 0,
            ..example()
        };
        let config = DeviceConfig::from_raw(&raw).unwrap();
        assert_eq!(config.camera.reset.map(GpioNum::get), Some(0));
    }

    #[test]
    fn test_negative_pin_other_than_unused_is_rejected() {
        let raw = RawConfig {
            camera_pin_pwdn: -2,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InvalidPin {
                field: "CAMERA_PIN_PWDN",
                value: -2
            })
        );
    }

    #[test]
    fn test_pin_out_of_range_is_rejected() {
        let raw = RawConfig {
            uart_tx_pin: 40,
            ..example()
        };
        assert!(matches!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InvalidPin { field: "UART_TX_PIN", value: 40 })
        ));
    }

    #[test]
    fn test_flash_pins_are_reserved() {
        let raw = RawConfig {
            modem_rst_pin: 6,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::ReservedPin {
                field: "SIM7600_RST_PIN",
                pin: 6
            })
        );
    }

    #[test]
    fn test_input_only_pin_cannot_drive_modem() {
        let raw = RawConfig {
            modem_pwr_pin: 35,
            ..example()
        };
        assert!(matches!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InputOnlyPin { pin: 35, .. })
        ));

        // RX only reads, so an input-only pad is fine there.
        let raw = RawConfig {
            uart_rx_pin: 35,
            ..example()
        };
        assert!(DeviceConfig::from_raw(&raw).is_ok());
    }

    #[test]
    fn test_modem_power_pin_is_required() {
        let raw = RawConfig {
            modem_pwr_pin: PIN_UNUSED,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::MissingPin {
                field: "SIM7600_PWR_PIN"
            })
        );
    }

    #[test]
    fn test_duplicate_pins_are_rejected() {
        let raw = RawConfig {
            camera_pin_pwdn: 4,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::DuplicatePin {
                first: "SIM7600_PWR_PIN",
                second: "CAMERA_PIN_PWDN",
                pin: 4
            })
        );
    }

    #[test]
    fn test_two_unused_pins_do_not_collide() {
        let raw = RawConfig {
            modem_rst_pin: PIN_UNUSED,
            camera_pin_pwdn: PIN_UNUSED,
            ..example()
        };
        assert!(DeviceConfig::from_raw(&raw).is_ok());
    }

    #[test]
    fn test_empty_api_key_is_rejected() {
        let raw = RawConfig {
            api_key: "  ",
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw), Err(ConfigError::MissingApiKey));
    }

    #[test]
    fn test_api_key_with_line_break_is_rejected() {
        let raw = RawConfig {
            api_key: "abc\r\nX-Evil: 1",
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw), Err(ConfigError::InvalidApiKey));
    }

    #[test]
    fn test_unknown_camera_model() {
        let raw = RawConfig {
            camera_model: "OV7670_BREADBOARD",
            ..example()
        };
        assert!(matches!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::UnknownCameraModel(name)) if name.as_str() == "OV7670_BREADBOARD"
        ));
    }

    #[test]
    fn test_camera_tag_accepts_prefix_and_case() {
        assert_eq!(
            CameraModel::from_tag("CAMERA_MODEL_AI_THINKER"),
            Some(CameraModel::AiThinker)
        );
        assert_eq!(CameraModel::from_tag("esp_eye"), Some(CameraModel::EspEye));
        assert_eq!(CameraModel::from_tag(""), None);
    }

    #[test]
    fn test_wifi_is_optional() {
        let raw = RawConfig {
            wifi_ssid: None,
            wifi_password: None,
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw).unwrap().wifi, None);

        let raw = RawConfig {
            wifi_ssid: Some(""),
            wifi_password: Some(""),
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw).unwrap().wifi, None);
    }

    #[test]
    fn test_open_wifi_network() {
        let raw = RawConfig {
            wifi_ssid: Some("field-ap"),
            wifi_password: None,
            ..example()
        };
        let wifi = DeviceConfig::from_raw(&raw).unwrap().wifi.unwrap();
        assert_eq!(wifi.ssid, "field-ap");
        assert_eq!(wifi.passphrase, None);
    }

    #[test]
    fn test_wifi_password_without_ssid() {
        let raw = RawConfig {
            wifi_ssid: None,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::IncompleteWifiCredentials)
        );
    }

    #[test]
    fn test_short_passphrase_is_rejected() {
        let raw = RawConfig {
            wifi_password: Some("1234"),
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InvalidPassphrase)
        );
    }

    #[test]
    fn test_custom_auth_header() {
        let raw = RawConfig {
            auth_header: Some("X-API-Key"),
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw).unwrap().auth,
            AuthScheme::Header("X-API-Key")
        );

        let raw = RawConfig {
            auth_header: Some("X API Key"),
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InvalidAuthHeader)
        );
    }

    #[test]
    fn test_baud_rate_bounds() {
        let raw = RawConfig {
            uart_baudrate: 0,
            ..example()
        };
        assert_eq!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::InvalidBaudRate(0))
        );
    }

    #[test]
    fn test_zero_capture_interval_is_rejected() {
        let raw = RawConfig {
            capture_interval_secs: 0,
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw), Err(ConfigError::InvalidInterval));
    }

    #[test]
    fn test_apn_with_quote_is_rejected() {
        let raw = RawConfig {
            cellular_apn: Some("inter\"net"),
            ..example()
        };
        assert_eq!(DeviceConfig::from_raw(&raw), Err(ConfigError::InvalidApn));
    }

    #[test]
    fn test_request_head_must_fit() {
        let url = alloc::format!("http://your-server.com/{}", "a".repeat(800));
        let raw = RawConfig {
            server_url: &url,
            ..example()
        };
        assert!(matches!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::RequestTooLarge { limit: 768, .. })
        ));

        let key = "k".repeat(700);
        let raw = RawConfig {
            api_key: &key,
            ..example()
        };
        assert!(matches!(
            DeviceConfig::from_raw(&raw),
            Err(ConfigError::RequestTooLarge { .. })
        ));

        let url = alloc::format!("http://your-server.com/{}", "a".repeat(200));
        let raw = RawConfig {
            server_url: &url,
            ..example()
        };
        assert!(DeviceConfig::from_raw(&raw).is_ok());
    }

    #[test]
    fn test_esp32_s3_profile_allows_high_pins() {
        let raw = RawConfig {
            camera_pin_pwdn: 45,
            ..example()
        };
        assert!(DeviceConfig::from_raw(&raw).is_err());
        assert!(DeviceConfig::from_raw_for(&raw, BoardProfile::ESP32_S3).is_ok());
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = Endpoint::parse("https://upload.example.org").unwrap();
        assert_eq!(endpoint.scheme, Scheme::Https);
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.path, "/");
        assert!(endpoint.is_secure());
        assert!(endpoint.has_default_port());
    }

    #[test]
    fn test_endpoint_with_port_and_query() {
        let endpoint = Endpoint::parse("HTTP://10.0.0.7:8080/api/images?node=3").unwrap();
        assert_eq!(endpoint.scheme, Scheme::Http);
        assert_eq!(endpoint.host, "10.0.0.7");
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.path, "/api/images?node=3");
        assert!(!endpoint.has_default_port());
    }

    #[test]
    fn test_malformed_urls() {
        for url in [
            "",
            "ftp://example.com/",
            "http://",
            "http://exa mple.com/",
            "http://example.com:0/",
            "http://example.com:99999/",
            "http://user:pw@example.com/",
            "http://[::1]/",
            "http://-bad-.com/",
            "http://example.com/#frag",
            "example.com/api",
        ] {
            assert!(
                matches!(Endpoint::parse(url), Err(ConfigError::MalformedUrl(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_postcard_blob_round_trip() {
        let raw = RawConfig {
            cellular_apn: Some("iot.1nce.net"),
            ..example()
        };
        let bytes = postcard::to_allocvec(&raw).unwrap();
        let decoded = RawConfig::from_postcard(&bytes).unwrap();
        assert_eq!(decoded, raw);
        assert!(DeviceConfig::from_raw(&decoded).is_ok());
    }
}
