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

const SUBSCRIPTION_OPTIONS_RESERVED_BITS_MASK: u8 = 0xFC;

fn compute_subscribe_packet_remaining_length(packet: &SubscribePacket) -> BasaltResult<u32> {
    let mut total_remaining_length: usize = 2;

    for subscription in &packet.subscriptions {
        total_remaining_length += 2 + subscription.topic_filter.len() + 1;
    }

    if total_remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        let message = "compute_subscribe_packet_remaining_length - vli value exceeds the protocol maximum (2 ^ 28 - 1)";
        error!("{}", message);
        return Err(BasaltError::new_encoding_failure(message));
    }

    Ok(total_remaining_length as u32)
}

pub(crate) fn validate_subscribe_packet_outbound(packet: &SubscribePacket) -> BasaltResult<()> {
    if packet.subscriptions.is_empty() {
        let message = "validate_subscribe_packet_outbound - subscription list may not be empty";
        error!("{}", message);
        return Err(BasaltError::new_packet_validation(PacketType::Subscribe, message));
    }

    for subscription in &packet.subscriptions {
        if !is_valid_topic_filter(subscription.topic_filter.as_str()) {
            let message = "validate_subscribe_packet_outbound - invalid topic filter";
            error!("{}", message);
            return Err(BasaltError::new_packet_validation(PacketType::Subscribe, message));
        }
    }

    Ok(())
}

pub(crate) fn write_subscribe_packet(packet: &SubscribePacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    validate_subscribe_packet_outbound(packet)?;

    let total_remaining_length = compute_subscribe_packet_remaining_length(packet)?;

    dest.push(SUBSCRIBE_FIRST_BYTE);
    encode_vli(total_remaining_length, dest)?;
    encode_u16(packet.packet_id, dest);

    for subscription in &packet.subscriptions {
        encode_length_prefixed_string(subscription.topic_filter.as_str(), dest);
        dest.push(subscription.qos as u8);
    }

    Ok(())
}

pub(crate) fn decode_subscribe_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    if first_byte != SUBSCRIBE_FIRST_BYTE {
        let message = "decode_subscribe_packet - invalid first byte";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut packet = SubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    while !mutable_body.is_empty() {
        let mut subscription = Subscription { ..Default::default() };
        mutable_body = decode_length_prefixed_string(mutable_body, &mut subscription.topic_filter)?;

        let mut subscription_options: u8 = 0;
        mutable_body = decode_u8(mutable_body, &mut subscription_options)?;

        if (subscription_options & SUBSCRIPTION_OPTIONS_RESERVED_BITS_MASK) != 0 {
            let message = "decode_subscribe_packet - reserved subscription option bits set";
            error!("{}", message);
            return Err(BasaltError::new_malformed_packet(message));
        }

        subscription.qos = QualityOfService::try_from(subscription_options & QOS_MASK)?;
        packet.subscriptions.push(subscription);
    }

    if packet.subscriptions.is_empty() {
        let message = "decode_subscribe_packet - at least one subscription is required";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Subscribe(packet)))
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " subscriptions: [")?;
        for subscription in &self.subscriptions {
            write!(f, " (\"{}\", {})", subscription.topic_filter, quality_of_service_to_str(subscription.qos))?;
        }
        write!(f, " ] }}")
    }
}
