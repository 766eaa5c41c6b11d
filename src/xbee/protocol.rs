//! XBee application service packet building and parsing.

use super::types::{
    AtResponse, CMD_REMOTE_AT, CMD_REMOTE_AT_RESPONSE, HEADER_SIZE, NUMBER_XOR, NUMBER1, OPT_APPLY_CHANGES,
};

/// Build a remote AT command packet.
///
/// Layout (big-endian): number1, number2 (number1 ^ 0x4242), packet id, encryption pad,
/// command id, options, two AT characters, parameters.
pub(crate) fn build_at_command(command: [u8; 2], params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + 2 + params.len());

    packet.extend_from_slice(&NUMBER1.to_be_bytes());
    packet.extend_from_slice(&(NUMBER1 ^ NUMBER_XOR).to_be_bytes());

    // Packet id and encryption pad are always zero
    packet.push(0);
    packet.push(0);

    packet.push(CMD_REMOTE_AT);
    packet.push(OPT_APPLY_CHANGES);
    packet.extend_from_slice(&command);
    packet.extend_from_slice(params);

    packet
}

/// Parse a remote AT command response. Returns `None` for anything else.
pub(crate) fn parse_at_response(datagram: &[u8]) -> Option<AtResponse> {
    // Header + AT command + status
    if datagram.len() < HEADER_SIZE + 3 {
        return None;
    }

    let number1 = u16::from_be_bytes([datagram[0], datagram[1]]);
    let number2 = u16::from_be_bytes([datagram[2], datagram[3]]);
    if number1 ^ number2 != NUMBER_XOR {
        return None;
    }

    if datagram[6] != CMD_REMOTE_AT_RESPONSE {
        return None;
    }

    Some(AtResponse {
        command: [datagram[8], datagram[9]],
        status: datagram[10],
        data: datagram[11..].to_vec(),
    })
}

/// Encode an AT response the way a module sends it. Used by the simulated devices in tests.
#[cfg(test)]
pub(crate) fn build_at_response(command: [u8; 2], status: u8, data: &[u8]) -> Vec<u8> {
    let mut packet = build_at_command(command, &[]);
    packet[6] = CMD_REMOTE_AT_RESPONSE;
    packet.push(status);
    packet.extend_from_slice(data);
    packet
}

/// Decode a remote AT command request. Used by the simulated devices in tests.
#[cfg(test)]
pub(crate) fn parse_at_command(datagram: &[u8]) -> Option<([u8; 2], Vec<u8>)> {
    if datagram.len() < HEADER_SIZE + 2 || datagram[6] != CMD_REMOTE_AT {
        return None;
    }
    Some(([datagram[8], datagram[9]], datagram[10..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xbee::types::{AT_NODE_DISCOVER, AT_NODE_IDENTIFIER, STATUS_OK};

    #[test]
    fn test_build_at_command_layout() {
        let packet = build_at_command(AT_NODE_IDENTIFIER, &[]);
        assert_eq!(packet, vec![0x00, 0x00, 0x42, 0x42, 0x00, 0x00, 0x02, 0x02, b'N', b'I']);
    }

    #[test]
    fn test_build_at_command_with_params() {
        let packet = build_at_command(*b"IO", &[0x00, 0x10]);
        assert_eq!(&packet[8..], &[b'I', b'O', 0x00, 0x10]);
    }

    #[test]
    fn test_parse_at_response() {
        let datagram = build_at_response(AT_NODE_DISCOVER, STATUS_OK, &[0x20, 0x2d]);
        let response = parse_at_response(&datagram).unwrap();
        assert_eq!(response.command, AT_NODE_DISCOVER);
        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.data, vec![0x20, 0x2d]);
    }

    #[test]
    fn test_parse_rejects_requests_and_garbage() {
        // A request is not a response
        assert!(parse_at_response(&build_at_command(AT_NODE_DISCOVER, &[0])).is_none());
        // Bad number2
        let mut datagram = build_at_response(AT_NODE_DISCOVER, STATUS_OK, &[]);
        datagram[3] = 0;
        assert!(parse_at_response(&datagram).is_none());
        // Too short
        assert!(parse_at_response(&[0x00, 0x00, 0x42]).is_none());
    }
}
