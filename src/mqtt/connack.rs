/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::{BasaltError, BasaltResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;
use std::fmt;

const CONNACK_SESSION_PRESENT_FLAG_MASK: u8 = 0x01;

pub(crate) fn write_connack_packet(packet: &ConnackPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    dest.push(CONNACK_FIRST_BYTE);
    encode_vli(2, dest)?;
    dest.push(if packet.session_present { CONNACK_SESSION_PRESENT_FLAG_MASK } else { 0 });
    dest.push(packet.return_code as u8);

    Ok(())
}

pub(crate) fn decode_connack_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    if first_byte != CONNACK_FIRST_BYTE {
        let message = "decode_connack_packet - invalid first byte";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    if packet_body.len() != 2 {
        let message = "decode_connack_packet - invalid remaining length";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    if (packet_body[0] & !CONNACK_SESSION_PRESENT_FLAG_MASK) != 0 {
        let message = "decode_connack_packet - connect acknowledge flags reserved bits set";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut packet = ConnackPacket {
        session_present: (packet_body[0] & CONNACK_SESSION_PRESENT_FLAG_MASK) != 0,
        ..Default::default()
    };

    decode_u8_as_enum(&packet_body[1..], &mut packet.return_code, convert_u8_to_connect_return_code)?;

    Ok(Box::new(MqttPacket::Connack(packet)))
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        write!(f, " return_code:{}", self.return_code)?;
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use std::collections::VecDeque;

    #[test]
    fn connack_round_trip_encode_decode_default() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
    }

    #[test]
    fn connack_round_trip_encode_decode_all_return_codes() {
        let return_codes = vec![
            ConnectReturnCode::Accepted,
            ConnectReturnCode::UnacceptableProtocolVersion,
            ConnectReturnCode::IdentifierRejected,
            ConnectReturnCode::ServerUnavailable,
            ConnectReturnCode::BadUsernameOrPassword,
            ConnectReturnCode::NotAuthorized,
        ];

        for return_code in return_codes {
            let packet = ConnackPacket {
                session_present: false,
                return_code,
            };

            assert!(do_round_trip_encode_decode_test(&MqttPacket::Connack(packet)));
        }
    }

    #[test]
    fn connack_decode_accepted_with_session_present() {
        let mut decoder = Decoder::new();
        decoder.reset_for_new_connection();

        let mut decoded_packets: VecDeque<Box<MqttPacket>> = VecDeque::new();
        let mut decoding_context = DecodingContext {
            decoded_packets: &mut decoded_packets
        };

        let bytes: Vec<u8> = vec![0x20, 0x02, 0x01, 0x00];
        assert!(decoder.decode_bytes(bytes.as_slice(), &mut decoding_context).is_ok());
        assert_eq!(1, decoded_packets.len());

        let expected = MqttPacket::Connack(ConnackPacket {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        });

        assert_eq!(expected, *decoded_packets[0]);
    }

    #[test]
    fn connack_decode_failure_bad_fixed_header() {
        let packet = ConnackPacket {
            session_present: true,
            ..Default::default()
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Connack(packet), 0x05);
    }

    #[test]
    fn connack_decode_failure_reserved_acknowledge_flags() {
        let packet = ConnackPacket {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        };

        let set_reserved_flags = |bytes: &[u8]| -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[2] |= 0xF0;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connack(packet), set_reserved_flags);
    }

    #[test]
    fn connack_decode_failure_invalid_return_code() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        let corrupt_return_code = |bytes: &[u8]| -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[3] = 113;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connack(packet), corrupt_return_code);
    }

    #[test]
    fn connack_decode_failure_bad_remaining_length() {
        let packet = ConnackPacket {
            ..Default::default()
        };

        let stretch_remaining_length = |bytes: &[u8]| -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] = 3;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Connack(packet), stretch_remaining_length);
    }
}
