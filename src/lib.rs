pub mod buffer;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod loader;
pub mod xbee;

pub use error::{AppError, Result};
