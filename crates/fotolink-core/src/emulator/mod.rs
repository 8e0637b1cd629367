//! In-memory stand-ins for the node's hardware and the upload server
//!
//! Everything here runs on the host: a SIM7600 answering AT commands over an
//! [`EmulatedSerial`], a WiFi station, a scripted HTTP server, a JPEG sensor
//! and a companion camera computer, plus GPIO that records every level it is
//! driven to. The simulator wires the real drivers to these; unit tests use
//! them to script failures.
//!
//! Clones of an emulated device share its state, so a test keeps one handle
//! for inspection after moving another into a driver.

mod camera;
mod gpio;
mod links;
mod serial;
mod server;
mod sim7600;
mod wifi;

pub use camera::{
    CameraComputer, CameraComputerFault, JPEG_OVERHEAD, SensorFault, SyntheticSensor,
    synthetic_jpeg,
};
pub use gpio::{EmulatedBoard, EmulatedPin, PinUnavailable};
pub use links::{LinkBehavior, LinkStats, ScriptedLink};
pub use serial::{EmulatedSerial, Peer};
pub use server::{Connection, EmulatedServer, ServerReply, ServerRequest, ServerTransport};
pub use sim7600::{Registration, Sim7600Emulator};
pub use wifi::EmulatedWifi;
