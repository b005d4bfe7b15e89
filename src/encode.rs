/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Internal utilities to encode MQTT 3.1.1 packets, plus the pluggable outbound packet writer
interface consumed by the session engine.
 */

use crate::error::{BasaltError, BasaltResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

/// Largest value representable by the MQTT variable length integer encoding
pub const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = (1 << 28) - 1;

/// Outbound packet serialization interface.  The session engine writes every outbound packet
/// through an implementation of this trait; tests substitute their own to observe or corrupt
/// the byte stream.
pub trait PacketWriter {

    /// Appends the full wire encoding of `packet` to `dest`
    fn write_packet(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> BasaltResult<()>;
}

/// Default packet writer implementing the MQTT 3.1.1 wire format exactly.
#[derive(Default)]
pub struct Encoder {}

impl Encoder {

    /// Creates a new encoder
    pub fn new() -> Self {
        Encoder {}
    }
}

impl PacketWriter for Encoder {
    fn write_packet(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
        log_packet("Encoding outbound packet: ", packet);

        match packet {
            MqttPacket::Connect(connect) => { connect::write_connect_packet(connect, dest) }
            MqttPacket::Connack(connack) => { connack::write_connack_packet(connack, dest) }
            MqttPacket::Publish(publish) => { publish::write_publish_packet(publish, dest) }
            MqttPacket::Puback(puback) => { puback::write_puback_packet(puback, dest) }
            MqttPacket::Pubrec(pubrec) => { pubrec::write_pubrec_packet(pubrec, dest) }
            MqttPacket::Pubrel(pubrel) => { pubrel::write_pubrel_packet(pubrel, dest) }
            MqttPacket::Pubcomp(pubcomp) => { pubcomp::write_pubcomp_packet(pubcomp, dest) }
            MqttPacket::Subscribe(subscribe) => { subscribe::write_subscribe_packet(subscribe, dest) }
            MqttPacket::Suback(suback) => { suback::write_suback_packet(suback, dest) }
            MqttPacket::Unsubscribe(unsubscribe) => { unsubscribe::write_unsubscribe_packet(unsubscribe, dest) }
            MqttPacket::Unsuback(unsuback) => { unsuback::write_unsuback_packet(unsuback, dest) }
            MqttPacket::Pingreq(_) => { pingreq::write_pingreq_packet(dest) }
            MqttPacket::Pingresp(_) => { pingresp::write_pingresp_packet(dest) }
            MqttPacket::Disconnect(_) => { disconnect::write_disconnect_packet(dest) }
        }
    }
}

pub(crate) fn compute_variable_length_integer_encode_size(value: usize) -> BasaltResult<usize> {
    if value < 1usize << 7 {
        Ok(1)
    } else if value < 1usize << 14 {
        Ok(2)
    } else if value < 1usize << 21 {
        Ok(3)
    } else if value < 1usize << 28 {
        Ok(4)
    } else {
        error!("compute_variable_length_integer_encode_size - value exceeds the protocol maximum (2 ^ 28 - 1)");
        Err(BasaltError::new_encoding_failure("vli value exceeds the protocol maximum"))
    }
}

pub(crate) fn encode_vli(value: u32, dest: &mut Vec<u8>) -> BasaltResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER as u32 {
        error!("encode_vli - value exceeds the protocol maximum (2 ^ 28 - 1)");
        return Err(BasaltError::new_encoding_failure("vli value exceeds the protocol maximum"));
    }

    let mut done = false;
    let mut val = value;
    while !done {
        let mut byte: u8 = (val & 0x7F) as u8;
        val /= 128;

        if val != 0 {
            byte |= 128;
        }

        dest.push(byte);

        done = val == 0;
    }

    Ok(())
}

pub(crate) fn encode_u16(value: u16, dest: &mut Vec<u8>) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn encode_length_prefixed_string(value: &str, dest: &mut Vec<u8>) {
    encode_u16(value.len() as u16, dest);
    dest.extend_from_slice(value.as_bytes());
}

pub(crate) fn encode_length_prefixed_bytes(value: &[u8], dest: &mut Vec<u8>) {
    encode_u16(value.len() as u16, dest);
    dest.extend_from_slice(value);
}

pub(crate) fn validate_string_length(value: &str, packet_type: PacketType, function_name: &str, field_name: &str) -> BasaltResult<()> {
    if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        error!("{} - {} exceeds the maximum encodable string length", function_name, field_name);
        return Err(BasaltError::new_packet_validation(packet_type, "string field exceeds maximum length"));
    }

    Ok(())
}

pub(crate) fn validate_binary_length(value: &[u8], packet_type: PacketType, function_name: &str, field_name: &str) -> BasaltResult<()> {
    if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        error!("{} - {} exceeds the maximum encodable binary length", function_name, field_name);
        return Err(BasaltError::new_packet_validation(packet_type, "binary field exceeds maximum length"));
    }

    Ok(())
}

macro_rules! define_ack_packet_encode_function {
    ($function_name: ident, $packet_type: ident, $first_byte: expr) => {
        pub(crate) fn $function_name(packet: &$packet_type, dest: &mut Vec<u8>) -> BasaltResult<()> {
            dest.push($first_byte);
            encode_vli(2, dest)?;
            encode_u16(packet.packet_id, dest);

            Ok(())
        }
    };
}

pub(crate) use define_ack_packet_encode_function;

macro_rules! define_empty_packet_encode_function {
    ($function_name: ident, $first_byte: expr) => {
        pub(crate) fn $function_name(dest: &mut Vec<u8>) -> BasaltResult<()> {
            dest.push($first_byte);
            encode_vli(0, dest)?;

            Ok(())
        }
    };
}

pub(crate) use define_empty_packet_encode_function;
