//! Hardware-independent core library for fotolink
//!
//! This crate contains all platform-agnostic logic for a fotolink camera node:
//! configuration validation, SIM7600 bring-up and AT session handling, network
//! selection between cellular and WiFi, image capture, HTTP upload with retry,
//! and the capture/upload controller that ties them together.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests). Every
//! peripheral is reached through `embedded-hal` / `embedded-io-async` traits or
//! one of the small driver traits defined here, and every wait goes through a
//! [`clock::Clock`].

#![no_std]

extern crate alloc;

pub mod at;
pub mod backoff;
pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod health;
pub mod http;
pub mod modem;
pub mod network;
pub mod upload;

#[cfg(any(test, feature = "emulator"))]
pub mod emulator;

pub use error::Error;
