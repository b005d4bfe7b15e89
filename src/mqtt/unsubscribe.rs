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

fn compute_unsubscribe_packet_remaining_length(packet: &UnsubscribePacket) -> BasaltResult<u32> {
    let mut total_remaining_length: usize = 2;

    for topic_filter in &packet.topic_filters {
        total_remaining_length += 2 + topic_filter.len();
    }

    if total_remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        let message = "compute_unsubscribe_packet_remaining_length - vli value exceeds the protocol maximum (2 ^ 28 - 1)";
        error!("{}", message);
        return Err(BasaltError::new_encoding_failure(message));
    }

    Ok(total_remaining_length as u32)
}

pub(crate) fn validate_unsubscribe_packet_outbound(packet: &UnsubscribePacket) -> BasaltResult<()> {
    if packet.topic_filters.is_empty() {
        let message = "validate_unsubscribe_packet_outbound - topic filter list may not be empty";
        error!("{}", message);
        return Err(BasaltError::new_packet_validation(PacketType::Unsubscribe, message));
    }

    for topic_filter in &packet.topic_filters {
        if !is_valid_topic_filter(topic_filter.as_str()) {
            let message = "validate_unsubscribe_packet_outbound - invalid topic filter";
            error!("{}", message);
            return Err(BasaltError::new_packet_validation(PacketType::Unsubscribe, message));
        }
    }

    Ok(())
}

pub(crate) fn write_unsubscribe_packet(packet: &UnsubscribePacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    validate_unsubscribe_packet_outbound(packet)?;

    let total_remaining_length = compute_unsubscribe_packet_remaining_length(packet)?;

    dest.push(UNSUBSCRIBE_FIRST_BYTE);
    encode_vli(total_remaining_length, dest)?;
    encode_u16(packet.packet_id, dest);

    for topic_filter in &packet.topic_filters {
        encode_length_prefixed_string(topic_filter.as_str(), dest);
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    if first_byte != UNSUBSCRIBE_FIRST_BYTE {
        let message = "decode_unsubscribe_packet - invalid first byte";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut packet = UnsubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    while !mutable_body.is_empty() {
        let mut topic_filter = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut topic_filter)?;
        packet.topic_filters.push(topic_filter);
    }

    if packet.topic_filters.is_empty() {
        let message = "decode_unsubscribe_packet - at least one topic filter is required";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Unsubscribe(packet)))
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " topic_filters: {:?}", self.topic_filters)?;
        write!(f, " }}")
    }
}
