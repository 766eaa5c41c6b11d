//! Propeller image loader over XBee WiFi.
//!
//! A load resets the board through the XBee's IO line, performs the boot handshake over the
//! serial service, streams the image in acknowledged chunks and checks the checksum the board
//! reports. A failed cycle is retried from the reset, up to the caller's attempt limit.

mod checksum;
mod client;
mod error;
mod handle;
pub(crate) mod protocol;
mod session;
pub(crate) mod types;

#[cfg(test)]
mod tests;

// Re-export public API
pub use checksum::{Checksum, PropellerChecksum};
pub use client::Loader;
pub use error::{LoaderError, Result};
pub use handle::{CancelToken, LoadHandle};
pub use types::Destination;
