//! Loader types and boot protocol constants.

use std::fmt;

use serde::{Deserialize, Serialize};

// Serial service opcodes (first byte of every datagram)
pub(crate) const OP_HANDSHAKE: u8 = 0xF9;
pub(crate) const OP_TRANSFER: u8 = 0xA5;
pub(crate) const OP_CHUNK: u8 = 0xA6;
pub(crate) const OP_VERIFY: u8 = 0xA7;
pub(crate) const OP_ACK: u8 = 0xAC;
pub(crate) const OP_CHECKSUM: u8 = 0xAD;

// Boot ROM commands sent in the transfer header
pub(crate) const BOOT_RUN_RAM: u8 = 1;
pub(crate) const BOOT_PROGRAM_EEPROM_RUN: u8 = 3;

/// LFSR bits the host sends, and the board echoes, during the handshake.
pub(crate) const HANDSHAKE_BITS: usize = 250;
/// LFSR seed, ASCII 'P'.
pub(crate) const LFSR_SEED: u8 = b'P';

// XBee IO output values driving the reset line
pub(crate) const RESET_ASSERT: [u8; 2] = [0x00, 0x00];
pub(crate) const RESET_RELEASE: [u8; 2] = [0x00, 0x10];

pub(crate) const CHUNK_HEADER_SIZE: usize = 7; // op + seq(2) + offset(4)

/// Where the board keeps the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Destination {
    /// Load into RAM and run. Lost on power cycle.
    #[default]
    Ram,
    /// Program the boot EEPROM, then run.
    Eeprom,
}

impl Destination {
    pub(crate) fn boot_command(self) -> u8 {
        match self {
            Self::Ram => BOOT_RUN_RAM,
            Self::Eeprom => BOOT_PROGRAM_EEPROM_RUN,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram => f.write_str("RAM"),
            Self::Eeprom => f.write_str("EEPROM"),
        }
    }
}

/// Load session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SessionState {
    #[default]
    Idle,
    Resetting,
    AwaitingHandshake,
    Transferring,
    Verifying,
    Complete,
    FatalError,
    Cancelled,
}

impl SessionState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::FatalError | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "Idle",
            Self::Resetting => "Resetting device",
            Self::AwaitingHandshake => "Waiting for handshake",
            Self::Transferring => "Sending image",
            Self::Verifying => "Verifying checksum",
            Self::Complete => "Load complete",
            Self::FatalError => "Load failed",
            Self::Cancelled => "Load cancelled",
        };
        f.write_str(text)
    }
}
