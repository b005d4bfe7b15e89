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

fn compute_publish_packet_remaining_length(packet: &PublishPacket) -> BasaltResult<u32> {
    let mut total_remaining_length: usize = 2 + packet.topic.len();

    if packet.qos != QualityOfService::AtMostOnce {
        total_remaining_length += 2;
    }

    total_remaining_length += packet.payload.len();

    if total_remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        let message = "compute_publish_packet_remaining_length - vli value exceeds the protocol maximum (2 ^ 28 - 1)";
        error!("{}", message);
        return Err(BasaltError::new_encoding_failure(message));
    }

    Ok(total_remaining_length as u32)
}

pub(crate) fn validate_publish_packet_outbound(packet: &PublishPacket) -> BasaltResult<()> {
    if !is_valid_topic(packet.topic.as_str()) {
        let message = "validate_publish_packet_outbound - topic is empty or contains wildcards";
        error!("{}", message);
        return Err(BasaltError::new_packet_validation(PacketType::Publish, message));
    }

    if packet.duplicate && packet.qos == QualityOfService::AtMostOnce {
        let message = "validate_publish_packet_outbound - duplicate flag set on a QoS 0 publish";
        error!("{}", message);
        return Err(BasaltError::new_packet_validation(PacketType::Publish, message));
    }

    Ok(())
}

pub(crate) fn write_publish_packet(packet: &PublishPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
    validate_publish_packet_outbound(packet)?;

    let total_remaining_length = compute_publish_packet_remaining_length(packet)?;

    let mut first_byte = (PACKET_TYPE_PUBLISH << 4) | ((packet.qos as u8) << PUBLISH_HEADER_QOS_FLAG_SHIFT);
    if packet.duplicate {
        first_byte |= PUBLISH_HEADER_DUPLICATE_FLAG_MASK;
    }

    if packet.retain {
        first_byte |= PUBLISH_HEADER_RETAIN_FLAG_MASK;
    }

    dest.push(first_byte);
    encode_vli(total_remaining_length, dest)?;
    encode_length_prefixed_string(packet.topic.as_str(), dest);

    if packet.qos != QualityOfService::AtMostOnce {
        encode_u16(packet.packet_id, dest);
    }

    dest.extend_from_slice(packet.payload.as_slice());

    Ok(())
}

pub(crate) fn decode_publish_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    let mut packet = PublishPacket { ..Default::default() };

    packet.duplicate = (first_byte & PUBLISH_HEADER_DUPLICATE_FLAG_MASK) != 0;
    packet.retain = (first_byte & PUBLISH_HEADER_RETAIN_FLAG_MASK) != 0;
    packet.qos = QualityOfService::try_from((first_byte >> PUBLISH_HEADER_QOS_FLAG_SHIFT) & QOS_MASK)?;

    if packet.duplicate && packet.qos == QualityOfService::AtMostOnce {
        let message = "decode_publish_packet - duplicate flag set on a QoS 0 publish";
        error!("{}", message);
        return Err(BasaltError::new_protocol_violation(message));
    }

    let mut mutable_body = packet_body;
    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.topic)?;

    if packet.qos != QualityOfService::AtMostOnce {
        mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

        if packet.packet_id == 0 {
            let message = "decode_publish_packet - packet id may not be zero on a QoS 1+ publish";
            error!("{}", message);
            return Err(BasaltError::new_protocol_violation(message));
        }
    }

    packet.payload = mutable_body.to_vec();

    Ok(Box::new(MqttPacket::Publish(packet)))
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_string!(self.topic, f, "topic");
        log_binary_data!(self.payload, f, "payload");
        log_enum!(self.qos, f, "qos", quality_of_service_to_str);
        log_primitive_value!(self.retain, f, "retain");
        log_primitive_value!(self.duplicate, f, "duplicate");
        write!(f, " }}")
    }
}
