//! XBee WiFi application service types and constants.

/// Default UDP port of the XBee application (command) service, 0xBEE.
pub const DEFAULT_COMMAND_PORT: u16 = 0x0BEE;
/// Default UDP port of the XBee serial service, 0x2616.
pub const DEFAULT_SERIAL_PORT: u16 = 0x2616;

// Application service header
pub(crate) const NUMBER1: u16 = 0x0000;
pub(crate) const NUMBER_XOR: u16 = 0x4242;
pub(crate) const HEADER_SIZE: usize = 8; // number1(2) + number2(2) + packet_id + pad + command_id + options

// Command ids
pub(crate) const CMD_REMOTE_AT: u8 = 0x02;
pub(crate) const CMD_REMOTE_AT_RESPONSE: u8 = 0x82;

// Command options
pub(crate) const OPT_APPLY_CHANGES: u8 = 0x02;

// AT commands
pub(crate) const AT_NODE_DISCOVER: [u8; 2] = *b"ND";
pub(crate) const AT_NODE_IDENTIFIER: [u8; 2] = *b"NI";
pub(crate) const AT_IO_OUTPUT: [u8; 2] = *b"IO";

// Response status
pub(crate) const STATUS_OK: u8 = 0;

/// Largest datagram accepted from a device.
pub(crate) const MAX_DATAGRAM: usize = 2048;

/// Remote AT command response decoded from the application service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AtResponse {
    /// Two-character AT command this answers.
    pub command: [u8; 2],
    /// Status byte (0 = OK).
    pub status: u8,
    /// Response data following the status byte.
    pub data: Vec<u8>,
}
