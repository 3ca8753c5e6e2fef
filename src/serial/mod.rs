//! Serial port access for the telemetry and reset links
//!
//! This module provides functionality for:
//! - Listing available serial ports (USB-to-serial adapters)
//! - Opening a port with a bounded read timeout
//! - Line-oriented reads and raw byte writes

pub mod port;

pub use port::{PortConfig, SerialConnection};
