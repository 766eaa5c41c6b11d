//! Boot protocol packet building and parsing for the serial service.

use super::types::{
    CHUNK_HEADER_SIZE, Destination, HANDSHAKE_BITS, LFSR_SEED, OP_ACK, OP_CHECKSUM, OP_CHUNK, OP_HANDSHAKE,
    OP_TRANSFER, OP_VERIFY,
};

/// Linear feedback shift register shared by host and board for the handshake.
struct Lfsr(u8);

impl Iterator for Lfsr {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let bit = self.0 & 1;
        let feedback = ((self.0 >> 7) ^ (self.0 >> 5) ^ (self.0 >> 4) ^ (self.0 >> 1)) & 1;
        self.0 = (self.0 << 1) | feedback;
        Some(bit)
    }
}

/// `count` LFSR bits after skipping `skip`, each encoded as `0xFE | bit`.
fn lfsr_bytes(skip: usize, count: usize) -> impl Iterator<Item = u8> {
    Lfsr(LFSR_SEED).skip(skip).take(count).map(|bit| 0xFE | bit)
}

/// Handshake sent right after reset.
pub(crate) fn handshake_packet() -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + HANDSHAKE_BITS);
    packet.push(OP_HANDSHAKE);
    packet.extend(lfsr_bytes(0, HANDSHAKE_BITS));
    packet
}

/// Validate the board's handshake reply and return its chip version.
///
/// The reply continues the LFSR sequence where the host's handshake stopped.
pub(crate) fn parse_handshake_reply(payload: &[u8]) -> Option<u8> {
    if payload.len() != 1 + HANDSHAKE_BITS + 1 || payload[0] != OP_HANDSHAKE {
        return None;
    }
    let echoed = &payload[1..1 + HANDSHAKE_BITS];
    if !echoed.iter().copied().eq(lfsr_bytes(HANDSHAKE_BITS, HANDSHAKE_BITS)) {
        return None;
    }
    Some(payload[1 + HANDSHAKE_BITS])
}

/// Transfer header: boot command and image length.
pub(crate) fn transfer_header(destination: Destination, total_len: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(6);
    packet.push(OP_TRANSFER);
    packet.push(destination.boot_command());
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet
}

/// One chunk of the image.
pub(crate) fn chunk_packet(seq: u16, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(CHUNK_HEADER_SIZE + data.len());
    packet.push(OP_CHUNK);
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&offset.to_be_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Sequence number of a chunk acknowledgement.
pub(crate) fn parse_ack(payload: &[u8]) -> Option<u16> {
    match payload {
        [OP_ACK, hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

pub(crate) fn verify_packet() -> Vec<u8> {
    vec![OP_VERIFY]
}

/// Checksum the board computed over what it received.
pub(crate) fn parse_checksum_reply(payload: &[u8]) -> Option<u32> {
    match payload {
        [OP_CHECKSUM, b0, b1, b2, b3] => Some(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => None,
    }
}

// Board side of the protocol, for the simulated devices in tests.

#[cfg(test)]
pub(crate) fn handshake_reply(version: u8) -> Vec<u8> {
    let mut packet = vec![OP_HANDSHAKE];
    packet.extend(lfsr_bytes(HANDSHAKE_BITS, HANDSHAKE_BITS));
    packet.push(version);
    packet
}

#[cfg(test)]
pub(crate) fn is_valid_handshake(payload: &[u8]) -> bool {
    payload.len() == 1 + HANDSHAKE_BITS
        && payload[0] == OP_HANDSHAKE
        && payload[1..].iter().copied().eq(lfsr_bytes(0, HANDSHAKE_BITS))
}

#[cfg(test)]
pub(crate) fn parse_transfer_header(payload: &[u8]) -> Option<(u8, u32)> {
    match payload {
        [OP_TRANSFER, command, b0, b1, b2, b3] => Some((*command, u32::from_be_bytes([*b0, *b1, *b2, *b3]))),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn parse_chunk(payload: &[u8]) -> Option<(u16, u32, &[u8])> {
    if payload.len() < CHUNK_HEADER_SIZE || payload[0] != OP_CHUNK {
        return None;
    }
    let seq = u16::from_be_bytes([payload[1], payload[2]]);
    let offset = u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]);
    Some((seq, offset, &payload[CHUNK_HEADER_SIZE..]))
}

#[cfg(test)]
pub(crate) fn ack_packet(seq: u16) -> Vec<u8> {
    let [hi, lo] = seq.to_be_bytes();
    vec![OP_ACK, hi, lo]
}

#[cfg(test)]
pub(crate) fn checksum_reply(checksum: u32) -> Vec<u8> {
    let mut packet = vec![OP_CHECKSUM];
    packet.extend_from_slice(&checksum.to_be_bytes());
    packet
}

#[cfg(test)]
pub(crate) fn is_verify(payload: &[u8]) -> bool {
    payload == [OP_VERIFY]
}
