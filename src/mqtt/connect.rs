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

static MQTT311_CONNECT_PROTOCOL_BYTES: [u8; 7] = [0, 4, 77, 81, 84, 84, 4];

const CONNECT_HEADER_PROTOCOL_LENGTH: usize = 7;

fn compute_connect_flags(packet: &ConnectPacket) -> u8 {
    let mut flags: u8 = 0;
    if packet.clean_session {
        flags |= CONNECT_PACKET_CLEAN_SESSION_FLAG_MASK;
    }

    if let Some(will) = &packet.will {
        flags |= CONNECT_PACKET_HAS_WILL_FLAG_MASK;
        flags |= (will.qos as u8) << CONNECT_PACKET_WILL_QOS_FLAG_SHIFT;

        if will.retain {
            flags |= CONNECT_PACKET_WILL_RETAIN_FLAG_MASK;
        }
    }

    if packet.username.is_some() {
        flags |= CONNECT_PACKET_HAS_USERNAME_FLAG_MASK;
    }

    if packet.password.is_some() {
        flags |= CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK;
    }

    flags
}

fn compute_connect_packet_remaining_length(packet: &ConnectPacket) -> BasaltResult<u32> {

    /* variable header = 6 byte protocol name + 1 protocol level + 1 flags + 2 keep alive */
    let variable_header_length = 10;

    let mut payload_length: usize = 2 + packet.client_id.len();

    if let Some(will) = &packet.will {
        payload_length += 2 + will.topic.len();
        payload_length += 2 + will.payload.len();
    }

    if let Some(username) = &packet.username {
        payload_length += 2 + username.len();
    }

    if let Some(password) = &packet.password {
        payload_length += 2 + password.len();
    }

    let total_remaining_length: usize = payload_length + variable_header_length;

    if total_remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        let message = "compute_connect_packet_remaining_length - vli value exceeds the protocol maximum (2 ^ 28 - 1)";
        error!("{}", message);
        return Err(BasaltError::new_encoding_failure(message));
    }

    Ok(total_remaining_length as u32)
}

pub(crate) fn validate_connect_packet_outbound(packet: &ConnectPacket) -> BasaltResult<()> {
    if packet.client_id.is_empty() && !packet.clean_session {
        let message = "validate_connect_packet_outbound - empty client id requires a clean session";
        error!("{}", message);
        return Err(BasaltError::new_invalid_connect(message));
    }

    validate_string_length(packet.client_id.as_str(), PacketType::Connect, "validate_connect_packet_outbound", "client_id")?;

    if let Some(username) = &packet.username {
        validate_string_length(username.as_str(), PacketType::Connect, "validate_connect_packet_outbound", "username")?;
    }

    if let Some(password) = &packet.password {
        validate_binary_length(password.as_slice(), PacketType::Connect, "validate_connect_packet_outbound", "password")?;
    }

    if let Some(will) = &packet.will {
        if !is_valid_topic(will.topic.as_str()) {
            let message = "validate_connect_packet_outbound - will topic is not a valid topic";
            error!("{}", message);
            return Err(BasaltError::new_invalid_connect(message));
        }

        validate_binary_length(will.payload.as_slice(), PacketType::Connect, "validate_connect_packet_outbound", "will_payload")?;
    }

    Ok(())
}

pub(crate) fn write_connect_packet(packet: &ConnectPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    validate_connect_packet_outbound(packet)?;

    let total_remaining_length = compute_connect_packet_remaining_length(packet)?;

    dest.push(CONNECT_FIRST_BYTE);
    encode_vli(total_remaining_length, dest)?;
    dest.extend_from_slice(&MQTT311_CONNECT_PROTOCOL_BYTES);
    dest.push(compute_connect_flags(packet));
    encode_u16(packet.keep_alive_seconds, dest);

    encode_length_prefixed_string(packet.client_id.as_str(), dest);

    if let Some(will) = &packet.will {
        encode_length_prefixed_string(will.topic.as_str(), dest);
        encode_length_prefixed_bytes(will.payload.as_slice(), dest);
    }

    if let Some(username) = &packet.username {
        encode_length_prefixed_string(username.as_str(), dest);
    }

    if let Some(password) = &packet.password {
        encode_length_prefixed_bytes(password.as_slice(), dest);
    }

    Ok(())
}

pub(crate) fn decode_connect_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    if first_byte != CONNECT_FIRST_BYTE {
        let message = "decode_connect_packet - invalid first byte";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut packet = ConnectPacket { ..Default::default() };
    let mut mutable_body = packet_body;
    if mutable_body.len() < CONNECT_HEADER_PROTOCOL_LENGTH {
        let message = "decode_connect_packet - packet too short";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let protocol_bytes = &mutable_body[..CONNECT_HEADER_PROTOCOL_LENGTH];
    mutable_body = &mutable_body[CONNECT_HEADER_PROTOCOL_LENGTH..];

    if protocol_bytes != MQTT311_CONNECT_PROTOCOL_BYTES {
        let message = "decode_connect_packet - invalid protocol name or level";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut connect_flags: u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut connect_flags)?;

    // if the reserved bit is set, that's fatal
    if (connect_flags & 0x01) != 0 {
        let message = "decode_connect_packet - connect flags reserved bit set";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    packet.clean_session = (connect_flags & CONNECT_PACKET_CLEAN_SESSION_FLAG_MASK) != 0;
    let has_will = (connect_flags & CONNECT_PACKET_HAS_WILL_FLAG_MASK) != 0;
    let will_retain = (connect_flags & CONNECT_PACKET_WILL_RETAIN_FLAG_MASK) != 0;
    let will_qos = QualityOfService::try_from((connect_flags >> CONNECT_PACKET_WILL_QOS_FLAG_SHIFT) & QOS_MASK)?;

    if !has_will {
        /* indirectly check bits of connect flags vs. spec */
        if will_retain || will_qos != QualityOfService::AtMostOnce {
            let message = "decode_connect_packet - no will but has will flags set";
            error!("{}", message);
            return Err(BasaltError::new_malformed_packet(message));
        }
    }

    let has_username = (connect_flags & CONNECT_PACKET_HAS_USERNAME_FLAG_MASK) != 0;
    let has_password = (connect_flags & CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK) != 0;

    mutable_body = decode_u16(mutable_body, &mut packet.keep_alive_seconds)?;
    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.client_id)?;

    if has_will {
        let mut will = LastWill {
            qos: will_qos,
            retain: will_retain,
            ..Default::default()
        };

        mutable_body = decode_length_prefixed_string(mutable_body, &mut will.topic)?;
        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut will.payload)?;

        packet.will = Some(will);
    }

    if has_username {
        mutable_body = decode_optional_length_prefixed_string(mutable_body, &mut packet.username)?;
    }

    if has_password {
        mutable_body = decode_optional_length_prefixed_bytes(mutable_body, &mut packet.password)?;
    }

    if !mutable_body.is_empty() {
        let message = "decode_connect_packet - body length does not match expected overall packet length";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Connect(packet)))
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_primitive_value!(self.keep_alive_seconds, f, "keep_alive_seconds");
        log_primitive_value!(self.clean_session, f, "clean_session");
        log_string!(self.client_id, f, "client_id");
        log_optional_string_sensitive!(self.username, f, "username");
        log_optional_binary_data_sensitive!(self.password, f, "password");
        if let Some(will) = &self.will {
            write!(f, " will: {{")?;
            log_string!(will.topic, f, "topic");
            log_binary_data!(will.payload, f, "payload");
            log_enum!(will.qos, f, "qos", quality_of_service_to_str);
            log_primitive_value!(will.retain, f, "retain");
            write!(f, " }}")?;
        }
        write!(f, " }}")
    }
}
