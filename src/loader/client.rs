//! Loader struct and public API.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

use super::checksum::{Checksum, PropellerChecksum};
use super::error::{LoaderError, Result};
use super::handle::{CancelToken, LoadHandle};
use super::session::{ActiveDevices, BusyGuard, SessionParams, SessionRunner};
use super::types::Destination;
use crate::config::LoaderConfig;
use crate::device::DeviceRecord;
use crate::events::EventSink;

/// Loads binary images onto boards behind XBee WiFi modules.
///
/// Each [`load`](Self::load) runs as its own task. Loads to different devices may run at the
/// same time; a second load to a device that is still loading is rejected. Clones share the
/// same set of busy devices.
#[derive(Clone)]
pub struct Loader {
    command_port: u16,
    config: LoaderConfig,
    checksum: Arc<dyn Checksum>,
    active: ActiveDevices,
}

impl Loader {
    /// Create a loader talking to the XBee application service on `command_port`.
    pub fn new(command_port: u16, config: LoaderConfig) -> Self {
        Self {
            command_port,
            config,
            checksum: Arc::new(PropellerChecksum),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use a different checksum for verification.
    pub fn with_checksum<C: Checksum + 'static>(mut self, checksum: C) -> Self {
        self.checksum = Arc::new(checksum);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Whether a load to `device` is currently running.
    pub fn is_loading(&self, device: &DeviceRecord) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&device.key())
    }

    /// Start loading `image` onto `device`.
    ///
    /// Returns immediately; progress and the outcome arrive on the returned handle. At most
    /// `max_attempts` full reset cycles are made. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `InvalidRequest` for an empty image or `max_attempts == 0`, `DeviceBusy` if the device is
    /// already loading. Load failures themselves are reported as events, not here.
    pub fn load(
        &self,
        image: Vec<u8>,
        destination: Destination,
        device: DeviceRecord,
        max_attempts: u32,
    ) -> Result<LoadHandle> {
        if image.is_empty() {
            return Err(LoaderError::invalid("image is empty"));
        }
        if u32::try_from(image.len()).is_err() {
            return Err(LoaderError::invalid(format!("image too large: {} bytes", image.len())));
        }
        if max_attempts < 1 {
            return Err(LoaderError::invalid("at least one attempt is required"));
        }
        if self.config.chunk_size == 0 {
            return Err(LoaderError::invalid("chunk size must be greater than 0"));
        }

        let busy = BusyGuard::acquire(&self.active, device.key()).ok_or(LoaderError::DeviceBusy)?;

        info!(
            "Loading {} bytes into {destination} of {device} (max {max_attempts} attempts)",
            image.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();

        let runner = SessionRunner::new(SessionParams {
            image,
            destination,
            target: device,
            max_attempts,
            command_port: self.command_port,
            config: self.config.clone(),
            checksum: Arc::clone(&self.checksum),
            events: EventSink::new(tx),
            cancel: cancel.clone(),
        });
        tokio::spawn(runner.run(busy));

        Ok(LoadHandle::new(rx, cancel))
    }
}
