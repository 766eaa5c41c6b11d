//! Device discovery over UDP broadcast.
//!
//! A scan sends one `ND` probe to the subnet's broadcast address and collects whatever
//! answers arrive before the collection window closes.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::device::{DeviceRecord, UNKNOWN};
use crate::xbee::io::Link;
use crate::xbee::protocol::{build_at_command, parse_at_response};
use crate::xbee::types::{AT_NODE_DISCOVER, AT_NODE_IDENTIFIER, STATUS_OK};

/// Prefix length assumed when a subnet is given without one.
const DEFAULT_PREFIX: u8 = 24;

/// Checksum value a device reports when it has none.
const NO_CHECKSUM: u32 = 0xFFFF_FFFF;

/// Discovery and device query errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// Subnet string could not be parsed
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    /// Socket could not be bound, or a send or receive failed
    #[error("Network error: {0}")]
    Transport(#[from] io::Error),

    /// Device did not answer a query in time
    #[error("No response from {0}")]
    NoResponse(SocketAddr),

    /// Device answered with a non-zero status
    #[error("{addr} rejected AT {command} with status {status}")]
    CommandFailed {
        addr: SocketAddr,
        command: String,
        status: u8,
    },
}

/// Finds XBee modules on a subnet and queries them.
#[derive(Debug, Clone)]
pub struct Scanner {
    window: Duration,
    query_timeout: Duration,
}

impl Scanner {
    /// `window` bounds how long a scan collects replies; `query_timeout` bounds unicast
    /// queries.
    pub fn new(window: Duration, query_timeout: Duration) -> Self {
        Self { window, query_timeout }
    }

    /// Broadcast a probe on `subnet` and return every device that answered.
    ///
    /// Results are in first-seen order with one record per `(ip, port)`; a later reply from the
    /// same device replaces the earlier record. No replies is an empty list, not an error.
    pub async fn scan(
        &self,
        subnet: &str,
        command_port: u16,
        serial_port: u16,
    ) -> Result<Vec<DeviceRecord>, ScanError> {
        let broadcast = broadcast_address(subnet)?;
        let target = SocketAddr::from((broadcast, command_port));

        let link = Link::bind(SocketAddr::from(([0, 0, 0, 0], 0)), true).await?;
        info!(
            "Scanning {subnet} via {target} from {} for {} ms",
            link.local_addr()?,
            self.window.as_millis()
        );
        link.send_to(&build_at_command(AT_NODE_DISCOVER, &[]), target).await?;

        let deadline = Instant::now() + self.window;
        let devices = collect_replies(&link, deadline, serial_port)
            .await
            .inspect_err(|e| warn!("Scan of {subnet} aborted: {e}"))?;
        link.close().await;

        info!("Scan of {subnet} found {} device(s)", devices.len());
        Ok(devices)
    }

    /// Read the node identifier of `device`.
    pub async fn device_name(&self, device: &DeviceRecord, command_port: u16) -> Result<String, ScanError> {
        let target = device.command_addr(command_port);
        let link = Link::bind(SocketAddr::from(([0, 0, 0, 0], 0)), false).await?;
        link.send_to(&build_at_command(AT_NODE_IDENTIFIER, &[]), target).await?;

        let deadline = Instant::now() + self.query_timeout;
        while let Some(packet) = link.next_packet(deadline).await? {
            if packet.sender.ip() != IpAddr::V4(device.ip_address) {
                continue;
            }
            let Some(response) = parse_at_response(&packet.payload) else {
                continue;
            };
            if response.command != AT_NODE_IDENTIFIER {
                continue;
            }
            if response.status != STATUS_OK {
                return Err(ScanError::CommandFailed {
                    addr: target,
                    command: at_name(AT_NODE_IDENTIFIER),
                    status: response.status,
                });
            }
            return Ok(decode_name(&response.data));
        }

        warn!("No name reply from {target}");
        Err(ScanError::NoResponse(target))
    }
}

impl From<&NetworkConfig> for Scanner {
    fn from(config: &NetworkConfig) -> Self {
        Self::new(config.scan_window(), config.query_timeout())
    }
}

/// Drain discovery replies from `link` until `deadline`.
///
/// A receive failure aborts the collection; nothing gathered so far is returned.
async fn collect_replies(link: &Link, deadline: Instant, serial_port: u16) -> Result<Vec<DeviceRecord>, ScanError> {
    let mut devices: Vec<DeviceRecord> = Vec::new();

    while let Some(packet) = link.next_packet(deadline).await? {
        let IpAddr::V4(ip) = packet.sender.ip() else {
            continue;
        };
        let Some(response) = parse_at_response(&packet.payload) else {
            debug!("Ignoring {}-byte datagram from {}", packet.payload.len(), packet.sender);
            continue;
        };
        if response.command != AT_NODE_DISCOVER {
            debug!("Ignoring AT {} reply from {}", at_name(response.command), packet.sender);
            continue;
        }
        if response.status != STATUS_OK {
            debug!("{} answered discovery with status {}", packet.sender, response.status);
            continue;
        }
        let Some(record) = parse_device_info(&response.data, ip, serial_port) else {
            debug!("Malformed discovery reply from {}", packet.sender);
            continue;
        };

        match devices.iter_mut().find(|d| d.key() == record.key()) {
            Some(existing) => {
                debug!("Updated {record}");
                *existing = record;
            }
            None => {
                debug!("Found {record}");
                devices.push(record);
            }
        }
    }

    Ok(devices)
}

/// Broadcast address of `subnet`.
///
/// Accepts `a.b.c.d/nn`, a plain address (taken as /24) or a three-octet network `a.b.c`
/// (also /24). A /32 subnet broadcasts to the address itself.
pub fn broadcast_address(subnet: &str) -> Result<Ipv4Addr, ScanError> {
    let invalid = || ScanError::InvalidSubnet(subnet.to_string());
    let subnet_trimmed = subnet.trim();

    let (addr, prefix) = match subnet_trimmed.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            if prefix > 32 {
                return Err(invalid());
            }
            (addr, prefix)
        }
        None => (subnet_trimmed, DEFAULT_PREFIX),
    };

    let ip = match addr.parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(_) if addr.split('.').count() == 3 => format!("{addr}.0").parse().map_err(|_| invalid())?,
        Err(_) => return Err(invalid()),
    };

    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ok(Ipv4Addr::from(u32::from(ip) | !mask))
}

/// Build a record from discovery reply data.
///
/// Layout (big-endian): firmware version u16, config checksum u32, serial port u16, name.
/// Only the version is required; a missing or zero port means `default_port`.
pub fn parse_device_info(data: &[u8], ip: Ipv4Addr, default_port: u16) -> Option<DeviceRecord> {
    let version = data.get(0..2)?;
    let firmware_version = i32::from(u16::from_be_bytes([version[0], version[1]]));

    let config_checksum = match data.get(2..6) {
        Some(b) => match u32::from_be_bytes([b[0], b[1], b[2], b[3]]) {
            NO_CHECKSUM => UNKNOWN,
            sum => sum as i32,
        },
        None => UNKNOWN,
    };

    let port = match data.get(6..8) {
        Some(b) => match u16::from_be_bytes([b[0], b[1]]) {
            0 => default_port,
            port => port,
        },
        None => default_port,
    };

    let name = data.get(8..).map(decode_name).unwrap_or_default();

    Some(DeviceRecord {
        name,
        ip_address: ip,
        port,
        firmware_version,
        config_checksum,
    })
}

fn decode_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\0', '\r', '\n', ' '])
        .to_string()
}

fn at_name(command: [u8; 2]) -> String {
    String::from_utf8_lossy(&command).into_owned()
}
