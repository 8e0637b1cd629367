//! Turns `device.env` (or `device.env.example`) into a `RawConfig` constant.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::{env, fs};

const NUMERIC: [(&str, &str); 8] = [
    ("uart_baudrate", "UART_BAUDRATE"),
    ("uart_rx_pin", "UART_RX_PIN"),
    ("uart_tx_pin", "UART_TX_PIN"),
    ("modem_pwr_pin", "SIM7600_PWR_PIN"),
    ("modem_rst_pin", "SIM7600_RST_PIN"),
    ("camera_pin_pwdn", "CAMERA_PIN_PWDN"),
    ("camera_pin_reset", "CAMERA_PIN_RESET"),
    ("capture_interval_secs", "CAPTURE_INTERVAL_SECS"),
];

const REQUIRED: [(&str, &str); 3] = [
    ("camera_model", "CAMERA_MODEL"),
    ("server_url", "SERVER_URL"),
    ("api_key", "API_KEY"),
];

const OPTIONAL: [(&str, &str); 4] = [
    ("wifi_ssid", "WIFI_SSID"),
    ("wifi_password", "WIFI_PASSWORD"),
    ("cellular_apn", "CELLULAR_APN"),
    ("auth_header", "UPLOAD_AUTH_HEADER"),
];

fn main() -> Result<(), Box<dyn Error>> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let local = manifest_dir.join("device.env");
    let example = manifest_dir.join("device.env.example");
    println!("cargo:rerun-if-changed={}", local.display());
    println!("cargo:rerun-if-changed={}", example.display());

    let source = if local.exists() { local } else { example };
    let mut vars = HashMap::new();
    for item in dotenvy::from_path_iter(&source)? {
        let (key, value) = item?;
        vars.insert(key, value);
    }

    let mut code = String::from(
        "pub const DEVICE: fotolink_core::config::RawConfig<'static> = \
         fotolink_core::config::RawConfig {\n",
    );
    for (field, key) in NUMERIC {
        let value = vars
            .get(key)
            .ok_or_else(|| format!("{key} missing from {}", source.display()))?;
        let value: i64 = value
            .trim()
            .parse()
            .map_err(|e| format!("{key}={value}: {e}"))?;
        writeln!(code, "    {field}: {value},")?;
    }
    for (field, key) in REQUIRED {
        let value = vars
            .get(key)
            .ok_or_else(|| format!("{key} missing from {}", source.display()))?;
        writeln!(code, "    {field}: {value:?},")?;
    }
    for (field, key) in OPTIONAL {
        match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(value) => writeln!(code, "    {field}: Some({value:?}),")?,
            None => writeln!(code, "    {field}: None,")?,
        }
    }
    code.push_str("};\n");

    let out = PathBuf::from(env::var("OUT_DIR")?).join("device_config.rs");
    fs::write(out, code)?;
    Ok(())
}
