/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Miscellaneous utilities for the MQTT 3.1.1 data model: wire constants, conversion functions,
and topic filter evaluation.
 */

use crate::error::{BasaltError, BasaltResult};
use crate::mqtt::*;

use log::*;

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;

pub(crate) const CONNECT_FIRST_BYTE: u8 = PACKET_TYPE_CONNECT << 4;
pub(crate) const CONNACK_FIRST_BYTE: u8 = PACKET_TYPE_CONNACK << 4;
pub(crate) const PUBACK_FIRST_BYTE: u8 = PACKET_TYPE_PUBACK << 4;
pub(crate) const PUBREC_FIRST_BYTE: u8 = PACKET_TYPE_PUBREC << 4;

/* PUBREL, SUBSCRIBE and UNSUBSCRIBE carry the reserved flag nibble 0010 */
pub(crate) const PUBREL_FIRST_BYTE: u8 = (PACKET_TYPE_PUBREL << 4) | 0x02;
pub(crate) const PUBCOMP_FIRST_BYTE: u8 = PACKET_TYPE_PUBCOMP << 4;
pub(crate) const SUBSCRIBE_FIRST_BYTE: u8 = (PACKET_TYPE_SUBSCRIBE << 4) | 0x02;
pub(crate) const SUBACK_FIRST_BYTE: u8 = PACKET_TYPE_SUBACK << 4;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE: u8 = (PACKET_TYPE_UNSUBSCRIBE << 4) | 0x02;
pub(crate) const UNSUBACK_FIRST_BYTE: u8 = PACKET_TYPE_UNSUBACK << 4;
pub(crate) const PINGREQ_FIRST_BYTE: u8 = PACKET_TYPE_PINGREQ << 4;
pub(crate) const PINGRESP_FIRST_BYTE: u8 = PACKET_TYPE_PINGRESP << 4;
pub(crate) const DISCONNECT_FIRST_BYTE: u8 = PACKET_TYPE_DISCONNECT << 4;

pub(crate) const QOS_MASK: u8 = 0x03;

pub(crate) const PUBLISH_HEADER_RETAIN_FLAG_MASK: u8 = 0x01;
pub(crate) const PUBLISH_HEADER_QOS_FLAG_SHIFT: u8 = 1;
pub(crate) const PUBLISH_HEADER_DUPLICATE_FLAG_MASK: u8 = 0x08;

pub(crate) const CONNECT_PACKET_CLEAN_SESSION_FLAG_MASK: u8 = 1 << 1;
pub(crate) const CONNECT_PACKET_HAS_WILL_FLAG_MASK: u8 = 1 << 2;
pub(crate) const CONNECT_PACKET_WILL_QOS_FLAG_SHIFT: u8 = 3;
pub(crate) const CONNECT_PACKET_WILL_RETAIN_FLAG_MASK: u8 = 1 << 5;
pub(crate) const CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK: u8 = 1 << 6;
pub(crate) const CONNECT_PACKET_HAS_USERNAME_FLAG_MASK: u8 = 1 << 7;

/// Maximum encodable length of a topic, topic filter, or any other length-prefixed field
pub(crate) const MAXIMUM_STRING_PROPERTY_LENGTH: usize = 65535;

/// Converts a u8 to a quality of service enum value, failing on values outside `[0, 2]`
pub fn convert_u8_to_quality_of_service(value: u8) -> BasaltResult<QualityOfService> {
    match value {
        0 => { Ok(QualityOfService::AtMostOnce) }
        1 => { Ok(QualityOfService::AtLeastOnce) }
        2 => { Ok(QualityOfService::ExactlyOnce) }
        _ => {
            error!("convert_u8_to_quality_of_service - invalid value ({})", value);
            Err(BasaltError::new_malformed_packet("invalid quality of service value"))
        }
    }
}

/// Converts a u8 to a CONNACK return code, failing on values outside `[0, 5]`
pub fn convert_u8_to_connect_return_code(value: u8) -> BasaltResult<ConnectReturnCode> {
    match value {
        0 => { Ok(ConnectReturnCode::Accepted) }
        1 => { Ok(ConnectReturnCode::UnacceptableProtocolVersion) }
        2 => { Ok(ConnectReturnCode::IdentifierRejected) }
        3 => { Ok(ConnectReturnCode::ServerUnavailable) }
        4 => { Ok(ConnectReturnCode::BadUsernameOrPassword) }
        5 => { Ok(ConnectReturnCode::NotAuthorized) }
        _ => {
            error!("convert_u8_to_connect_return_code - invalid value ({})", value);
            Err(BasaltError::new_malformed_packet("invalid connect return code value"))
        }
    }
}

/// Converts a u8 to a SUBACK return code, failing on anything that is not a granted QoS or 0x80
pub fn convert_u8_to_suback_return_code(value: u8) -> BasaltResult<SubackReturnCode> {
    match value {
        0 => { Ok(SubackReturnCode::GrantedQos0) }
        1 => { Ok(SubackReturnCode::GrantedQos1) }
        2 => { Ok(SubackReturnCode::GrantedQos2) }
        128 => { Ok(SubackReturnCode::Failure) }
        _ => {
            error!("convert_u8_to_suback_return_code - invalid value ({})", value);
            Err(BasaltError::new_malformed_packet("invalid suback return code value"))
        }
    }
}

pub(crate) fn quality_of_service_to_str(qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce (0)" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce (1)" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce (2)" }
    }
}

pub(crate) fn packet_type_to_str(packet_type: u8) -> &'static str {
    match packet_type {
        PACKET_TYPE_CONNECT => { "Connect" }
        PACKET_TYPE_CONNACK => { "Connack" }
        PACKET_TYPE_PUBLISH => { "Publish" }
        PACKET_TYPE_PUBACK => { "Puback" }
        PACKET_TYPE_PUBREC => { "Pubrec" }
        PACKET_TYPE_PUBREL => { "Pubrel" }
        PACKET_TYPE_PUBCOMP => { "Pubcomp" }
        PACKET_TYPE_SUBSCRIBE => { "Subscribe" }
        PACKET_TYPE_SUBACK => { "Suback" }
        PACKET_TYPE_UNSUBSCRIBE => { "Unsubscribe" }
        PACKET_TYPE_UNSUBACK => { "Unsuback" }
        PACKET_TYPE_PINGREQ => { "Pingreq" }
        PACKET_TYPE_PINGRESP => { "Pingresp" }
        PACKET_TYPE_DISCONNECT => { "Disconnect" }
        _ => { "Unknown" }
    }
}

pub(crate) fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish }
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Pingreq(_) => { PacketType::Pingreq }
        MqttPacket::Pingresp(_) => { PacketType::Pingresp }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
    }
}

pub(crate) fn mqtt_packet_to_str(packet: &MqttPacket) -> &'static str {
    packet_type_to_str(match packet {
        MqttPacket::Connect(_) => { PACKET_TYPE_CONNECT }
        MqttPacket::Connack(_) => { PACKET_TYPE_CONNACK }
        MqttPacket::Publish(_) => { PACKET_TYPE_PUBLISH }
        MqttPacket::Puback(_) => { PACKET_TYPE_PUBACK }
        MqttPacket::Pubrec(_) => { PACKET_TYPE_PUBREC }
        MqttPacket::Pubrel(_) => { PACKET_TYPE_PUBREL }
        MqttPacket::Pubcomp(_) => { PACKET_TYPE_PUBCOMP }
        MqttPacket::Subscribe(_) => { PACKET_TYPE_SUBSCRIBE }
        MqttPacket::Suback(_) => { PACKET_TYPE_SUBACK }
        MqttPacket::Unsubscribe(_) => { PACKET_TYPE_UNSUBSCRIBE }
        MqttPacket::Unsuback(_) => { PACKET_TYPE_UNSUBACK }
        MqttPacket::Pingreq(_) => { PACKET_TYPE_PINGREQ }
        MqttPacket::Pingresp(_) => { PACKET_TYPE_PINGRESP }
        MqttPacket::Disconnect(_) => { PACKET_TYPE_DISCONNECT }
    })
}

/// Checks whether a string is usable as the topic of a PUBLISH packet.  Topics may not be
/// empty, may not contain wildcard characters, and must fit a u16 length prefix.
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    !topic.contains(['#', '+', '\0'])
}

/// Checks whether a string is usable as a subscription topic filter.  `+` must occupy an
/// entire level; `#` must occupy the entire final level.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    if filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('+') && level != "+" {
            return false;
        }

        if level.contains('#') {
            if level != "#" || levels.peek().is_some() {
                return false;
            }
        }
    }

    true
}

/// Evaluates a topic filter against a concrete topic using standard MQTT matching semantics:
/// `+` matches exactly one level, a trailing `#` matches the remainder of the topic (including
/// its parent level), and filters starting with a wildcard never match topics starting with `$`.
pub fn topic_filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => {
                return true;
            }
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) => {
                if filter_level != topic_level {
                    return false;
                }
            }
            (Some(filter_level), None) => {
                /* "a/#" matches "a"; nothing else survives filter levels outrunning the topic */
                return filter_level == "#" && filter_levels.next().is_none();
            }
            (None, Some(_)) => {
                return false;
            }
            (None, None) => {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn topic_filter_matches_exact() {
        assert!(topic_filter_matches("a/b/c", "a/b/c"));
        assert!(!topic_filter_matches("a/b/c", "a/b"));
        assert!(!topic_filter_matches("a/b", "a/b/c"));
        assert!(!topic_filter_matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn topic_filter_matches_single_level_wildcard() {
        assert!(topic_filter_matches("a/+/c", "a/b/c"));
        assert!(topic_filter_matches("+/b/c", "a/b/c"));
        assert!(topic_filter_matches("a/b/+", "a/b/c"));
        assert!(topic_filter_matches("+", "a"));
        assert!(topic_filter_matches("a/+", "a/"));
        assert!(!topic_filter_matches("a/+", "a"));
        assert!(!topic_filter_matches("+", "a/b"));
        assert!(!topic_filter_matches("a/+/c", "a/b/d/c"));
    }

    #[test]
    fn topic_filter_matches_multi_level_wildcard() {
        assert!(topic_filter_matches("#", "a"));
        assert!(topic_filter_matches("#", "a/b/c"));
        assert!(topic_filter_matches("a/#", "a/b"));
        assert!(topic_filter_matches("a/#", "a/b/c"));
        assert!(topic_filter_matches("a/#", "a"));
        assert!(!topic_filter_matches("a/#", "b/c"));
        assert!(topic_filter_matches("a/+/#", "a/b"));
        assert!(!topic_filter_matches("a/+/#", "a"));
    }

    #[test]
    fn topic_filter_matches_dollar_topics() {
        assert!(!topic_filter_matches("#", "$SYS/broker/load"));
        assert!(!topic_filter_matches("+/broker/load", "$SYS/broker/load"));
        assert!(topic_filter_matches("$SYS/#", "$SYS/broker/load"));
        assert!(topic_filter_matches("$SYS/broker/+", "$SYS/broker/load"));
    }

    #[test]
    fn topic_validity() {
        assert!(is_valid_topic("a/b/c"));
        assert!(is_valid_topic("/"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("a/+/c"));
        assert!(!is_valid_topic("a/#"));
        assert!(!is_valid_topic("a\0b"));
    }

    #[test]
    fn topic_filter_validity() {
        assert!(is_valid_topic_filter("a/b/c"));
        assert!(is_valid_topic_filter("a/+/c"));
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("a/#"));
        assert!(is_valid_topic_filter("+/+/#"));
        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("a/#/c"));
        assert!(!is_valid_topic_filter("a/b#"));
        assert!(!is_valid_topic_filter("a/b+/c"));
        assert!(!is_valid_topic_filter("a\0b"));
    }

    #[test]
    fn return_code_conversions() {
        assert_eq!(ConnectReturnCode::Accepted, convert_u8_to_connect_return_code(0).unwrap());
        assert_eq!(ConnectReturnCode::NotAuthorized, convert_u8_to_connect_return_code(5).unwrap());
        assert!(convert_u8_to_connect_return_code(6).is_err());

        assert_eq!(SubackReturnCode::GrantedQos2, convert_u8_to_suback_return_code(2).unwrap());
        assert_eq!(SubackReturnCode::Failure, convert_u8_to_suback_return_code(128).unwrap());
        assert!(convert_u8_to_suback_return_code(3).is_err());

        assert_eq!(QualityOfService::ExactlyOnce, convert_u8_to_quality_of_service(2).unwrap());
        assert!(convert_u8_to_quality_of_service(3).is_err());
    }
}
