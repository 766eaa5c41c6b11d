//! XBee WiFi transport.
//!
//! The module's application service (command port) accepts remote AT commands; the serial
//! service (serial port) is a transparent bridge to the attached board's UART. Both are plain
//! UDP.

pub(crate) mod io;
pub(crate) mod protocol;
pub(crate) mod types;

pub use types::{DEFAULT_COMMAND_PORT, DEFAULT_SERIAL_PORT};
