//! Time-stamped FIFO of inbound UDP datagrams.
//!
//! The socket receive task pushes into the buffer as datagrams arrive; the scanner and the
//! load session pull from it in discrete steps. It is the only structure shared between the
//! two contexts.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// A datagram as delivered by the socket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Datagram payload.
    pub payload: Vec<u8>,
    /// Address the datagram came from.
    pub sender: SocketAddr,
    /// Arrival time.
    pub received_at: Instant,
}

impl InboundPacket {
    /// Sender address as raw bytes: IP octets followed by the big-endian port.
    pub fn sender_bytes(&self) -> Vec<u8> {
        let mut bytes = match self.sender.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        bytes.extend_from_slice(&self.sender.port().to_be_bytes());
        bytes
    }
}

/// Unbounded, thread-safe FIFO of [`InboundPacket`]s.
///
/// `push`, `peek` and `pull` are mutually exclusive. Consumers never block waiting for data:
/// an empty buffer yields `None`.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    packets: Mutex<VecDeque<InboundPacket>>,
}

impl PacketBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a datagram to the tail.
    pub fn push(&self, payload: Vec<u8>, sender: SocketAddr, received_at: Instant) {
        self.lock().push_back(InboundPacket {
            payload,
            sender,
            received_at,
        });
    }

    /// Oldest datagram, left in place.
    pub fn peek(&self) -> Option<InboundPacket> {
        self.lock().front().cloned()
    }

    /// Remove and return the oldest datagram.
    pub fn pull(&self) -> Option<InboundPacket> {
        self.lock().pop_front()
    }

    /// Number of queued datagrams.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything queued, returning how many datagrams were discarded.
    pub fn clear(&self) -> usize {
        let mut packets = self.lock();
        let dropped = packets.len();
        packets.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InboundPacket>> {
        // No queue operation can panic halfway, so poisoning is ignored.
        self.packets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
