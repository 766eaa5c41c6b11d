//! Discovered device descriptor.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// Value used for a firmware version or checksum the device did not report.
pub const UNKNOWN: i32 = -1;

/// An XBee WiFi module found by a scan.
///
/// Records are never mutated after discovery. A device answering again with different values
/// produces a new record that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Node identifier (the XBee `NI` string).
    pub name: String,
    /// Device IP address.
    pub ip_address: Ipv4Addr,
    /// Serial service port used to talk to the attached board.
    pub port: u16,
    /// Firmware version, or [`UNKNOWN`].
    pub firmware_version: i32,
    /// Last-known configuration checksum, or [`UNKNOWN`].
    pub config_checksum: i32,
}

impl DeviceRecord {
    /// Record for a device known only by address, e.g. one typed in by the user.
    pub fn from_address(ip_address: Ipv4Addr, port: u16) -> Self {
        Self {
            name: String::new(),
            ip_address,
            port,
            firmware_version: UNKNOWN,
            config_checksum: UNKNOWN,
        }
    }

    /// Identity of the device.
    pub fn key(&self) -> (Ipv4Addr, u16) {
        (self.ip_address, self.port)
    }

    /// Address of the serial service.
    pub fn serial_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_address, self.port))
    }

    /// Address of the command (application) service on `command_port`.
    pub fn command_addr(&self, command_port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_address, command_port))
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() { "(unnamed)" } else { &self.name };
        write!(f, "{name} @ {}:{}", self.ip_address, self.port)?;
        if self.firmware_version != UNKNOWN {
            write!(f, " fw {:#06x}", self.firmware_version)?;
        }
        Ok(())
    }
}
