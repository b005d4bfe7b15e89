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

fn compute_suback_packet_remaining_length(packet: &SubackPacket) -> BasaltResult<u32> {
    let total_remaining_length: usize = 2 + packet.return_codes.len();

    if total_remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        let message = "compute_suback_packet_remaining_length - vli value exceeds the protocol maximum (2 ^ 28 - 1)";
        error!("{}", message);
        return Err(BasaltError::new_encoding_failure(message));
    }

    Ok(total_remaining_length as u32)
}

pub(crate) fn write_suback_packet(packet: &SubackPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    if packet.return_codes.is_empty() {
        let message = "write_suback_packet - return code list may not be empty";
        error!("{}", message);
        return Err(BasaltError::new_packet_validation(PacketType::Suback, message));
    }

    let total_remaining_length = compute_suback_packet_remaining_length(packet)?;

    dest.push(SUBACK_FIRST_BYTE);
    encode_vli(total_remaining_length, dest)?;
    encode_u16(packet.packet_id, dest);

    for return_code in &packet.return_codes {
        dest.push(*return_code as u8);
    }

    Ok(())
}

pub(crate) fn decode_suback_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    if first_byte != SUBACK_FIRST_BYTE {
        let message = "decode_suback_packet - invalid first byte";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut packet = SubackPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    if mutable_body.is_empty() {
        let message = "decode_suback_packet - at least one return code is required";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    packet.return_codes.reserve(mutable_body.len());
    for byte in mutable_body {
        packet.return_codes.push(SubackReturnCode::try_from(*byte)?);
    }

    Ok(Box::new(MqttPacket::Suback(packet)))
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " return_codes: {:?}", self.return_codes)?;
        write!(f, " }}")
    }
}
