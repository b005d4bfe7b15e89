/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Incremental frame reader for the MQTT 3.1.1 wire format.  Turns an inbound byte stream into a
sequence of decoded packets while tolerating arbitrary fragmentation.
 */

use crate::error::{BasaltError, BasaltResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

use std::collections::VecDeque;

const DECODE_BUFFER_DEFAULT_SIZE: usize = 16 * 1024;

#[derive(Copy, Clone, Eq, PartialEq)]
enum DecoderState {
    ReadPacketType,
    ReadTotalRemainingLength,
    ReadPacketBody,
    TerminalError
}

enum DecoderDirective {
    OutOfData,
    Continue,
    TerminalError(BasaltError)
}

pub(crate) struct DecodingContext<'a> {
    pub(crate) decoded_packets: &'a mut VecDeque<Box<MqttPacket>>
}

/// Stateful packet deframer.  Bytes go in via `decode_bytes` in whatever fragments the transport
/// produces; whole packets come out through the decoding context.  Any decode error poisons the
/// decoder for the remainder of the transport attachment.
pub(crate) struct Decoder {
    state: DecoderState,

    scratch: Vec<u8>,

    first_byte: Option<u8>,

    remaining_length: Option<usize>,
}

fn decode_packet(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
    let packet_type = first_byte >> 4;

    debug!("Decoding an MQTT packet of type {}", packet_type_to_str(packet_type));

    match packet_type {
        PACKET_TYPE_CONNECT => { connect::decode_connect_packet(first_byte, packet_body) }
        PACKET_TYPE_CONNACK => { connack::decode_connack_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBLISH => { publish::decode_publish_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBACK => { puback::decode_puback_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBREC => { pubrec::decode_pubrec_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBREL => { pubrel::decode_pubrel_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBCOMP => { pubcomp::decode_pubcomp_packet(first_byte, packet_body) }
        PACKET_TYPE_SUBSCRIBE => { subscribe::decode_subscribe_packet(first_byte, packet_body) }
        PACKET_TYPE_SUBACK => { suback::decode_suback_packet(first_byte, packet_body) }
        PACKET_TYPE_UNSUBSCRIBE => { unsubscribe::decode_unsubscribe_packet(first_byte, packet_body) }
        PACKET_TYPE_UNSUBACK => { unsuback::decode_unsuback_packet(first_byte, packet_body) }
        PACKET_TYPE_PINGREQ => { pingreq::decode_pingreq_packet(first_byte, packet_body) }
        PACKET_TYPE_PINGRESP => { pingresp::decode_pingresp_packet(first_byte, packet_body) }
        PACKET_TYPE_DISCONNECT => { disconnect::decode_disconnect_packet(first_byte, packet_body) }
        _ => {
            error!("decode_packet - invalid packet type value ({})", packet_type);
            Err(BasaltError::new_unexpected_packet("invalid packet type value"))
        }
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            state: DecoderState::ReadPacketType,
            scratch: Vec::<u8>::with_capacity(DECODE_BUFFER_DEFAULT_SIZE),
            first_byte: None,
            remaining_length: None,
        }
    }

    pub fn reset_for_new_connection(&mut self) {
        self.reset();
    }

    fn process_read_packet_type<'a>(&mut self, bytes: &'a [u8]) -> (DecoderDirective, &'a [u8]) {
        if bytes.is_empty() {
            return (DecoderDirective::OutOfData, bytes);
        }

        self.first_byte = Some(bytes[0]);
        self.state = DecoderState::ReadTotalRemainingLength;

        (DecoderDirective::Continue, &bytes[1..])
    }

    fn process_read_total_remaining_length<'a>(&mut self, bytes: &'a [u8]) -> (DecoderDirective, &'a [u8]) {
        if bytes.is_empty() {
            return (DecoderDirective::OutOfData, bytes);
        }

        self.scratch.push(bytes[0]);
        let remaining_bytes = &bytes[1..];

        let decode_vli_result = decode_vli(&self.scratch);
        if let Ok(DecodeVliResult::Value(remaining_length, _)) = decode_vli_result {
            self.remaining_length = Some(remaining_length as usize);
            self.state = DecoderState::ReadPacketBody;
            self.scratch.clear();
            (DecoderDirective::Continue, remaining_bytes)
        } else if self.scratch.len() >= 4 {
            (DecoderDirective::TerminalError(BasaltError::new_malformed_packet("invalid remaining length vli value")), remaining_bytes)
        } else if !remaining_bytes.is_empty() {
            (DecoderDirective::Continue, remaining_bytes)
        } else {
            (DecoderDirective::OutOfData, remaining_bytes)
        }
    }

    fn process_read_packet_body<'a>(&mut self, bytes: &'a [u8], context: &mut DecodingContext) -> (DecoderDirective, &'a [u8]) {
        let read_so_far = self.scratch.len();
        let bytes_needed = self.remaining_length.unwrap() - read_so_far;
        if bytes_needed > bytes.len() {
            self.scratch.extend_from_slice(bytes);
            return (DecoderDirective::OutOfData, &[]);
        }

        let packet_slice: &[u8] =
            if !self.scratch.is_empty() {
                self.scratch.extend_from_slice(&bytes[..bytes_needed]);
                &self.scratch
            } else {
                &bytes[..bytes_needed]
            };

        match decode_packet(self.first_byte.unwrap(), packet_slice) {
            Ok(packet) => {
                log_packet("Successfully decoded incoming packet: ", &packet);
                context.decoded_packets.push_back(packet);

                self.reset_for_new_packet();
                (DecoderDirective::Continue, &bytes[bytes_needed..])
            }
            Err(error) => {
                (DecoderDirective::TerminalError(error), &[])
            }
        }
    }

    pub fn decode_bytes(&mut self, bytes: &[u8], context: &mut DecodingContext) -> BasaltResult<()> {
        let mut current_slice = bytes;

        let mut decode_result = DecoderDirective::Continue;
        while let DecoderDirective::Continue = decode_result {
            match self.state {
                DecoderState::ReadPacketType => {
                    (decode_result, current_slice) = self.process_read_packet_type(current_slice);
                }

                DecoderState::ReadTotalRemainingLength => {
                    (decode_result, current_slice) = self.process_read_total_remaining_length(current_slice);
                }

                DecoderState::ReadPacketBody => {
                    (decode_result, current_slice) = self.process_read_packet_body(current_slice, context);
                }

                _ => {
                    decode_result = DecoderDirective::TerminalError(BasaltError::new_internal_state_error("decoder already in a terminal failure state"));
                }
            }
        }

        if let DecoderDirective::TerminalError(error) = decode_result {
            self.state = DecoderState::TerminalError;
            return Err(error);
        }

        Ok(())
    }

    fn reset_for_new_packet(&mut self) {
        if self.state != DecoderState::TerminalError {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.state = DecoderState::ReadPacketType;
        self.scratch.clear();
        self.first_byte = None;
        self.remaining_length = None;
    }
}

#[derive(Eq, PartialEq, Debug)]
pub(crate) enum DecodeVliResult<'a> {
    InsufficientData,
    Value(u32, &'a [u8]), /* (decoded value, remaining bytes) */
}

pub(crate) fn decode_vli(buffer: &[u8]) -> BasaltResult<DecodeVliResult> {
    let mut value: u32 = 0;
    let mut needs_data: bool;
    let mut shift: u32 = 0;
    let data_len = buffer.len();

    for i in 0..4 {
        if i >= data_len {
            return Ok(DecodeVliResult::InsufficientData);
        }

        let byte = buffer[i];
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;

        needs_data = (byte & 0x80) != 0;
        if !needs_data {
            return Ok(DecodeVliResult::Value(value, &buffer[(i + 1)..]));
        }
    }

    let message = "decode_vli - invalid variable length integer";
    error!("{}", message);
    Err(BasaltError::new_malformed_packet(message))
}

pub(crate) fn decode_u8<'a>(bytes: &'a [u8], value: &mut u8) -> BasaltResult<&'a [u8]> {
    if bytes.is_empty() {
        let message = "decode_u8 - insufficient packet bytes for u8 value";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    *value = bytes[0];

    Ok(&bytes[1..])
}

pub(crate) fn decode_u8_as_enum<'a, T>(bytes: &'a [u8], value: &mut T, converter: fn(u8) -> BasaltResult<T>) -> BasaltResult<&'a [u8]> {
    if bytes.is_empty() {
        let message = "decode_u8_as_enum - insufficient packet bytes for enum value";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    *value = converter(bytes[0])?;

    Ok(&bytes[1..])
}

pub(crate) fn decode_u16<'a>(bytes: &'a [u8], value: &mut u16) -> BasaltResult<&'a [u8]> {
    if bytes.len() < 2 {
        let message = "decode_u16 - insufficient packet bytes for u16 value";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    *value = u16::from_be_bytes(bytes[..2].try_into().unwrap());

    Ok(&bytes[2..])
}

pub(crate) fn decode_length_prefixed_string<'a>(bytes: &'a [u8], value: &mut String) -> BasaltResult<&'a [u8]> {
    if bytes.len() < 2 {
        let message = "decode_length_prefixed_string - utf-8 string value does not have a full length prefix";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let value_length: usize = u16::from_be_bytes(bytes[..2].try_into().unwrap()) as usize;
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        let message = "decode_length_prefixed_string - utf-8 string value has length larger than remaining packet bytes";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let decode_utf8_result = std::str::from_utf8(&mutable_bytes[..value_length])?;
    *value = decode_utf8_result.to_string();
    Ok(&mutable_bytes[(value_length)..])
}

pub(crate) fn decode_length_prefixed_bytes<'a>(bytes: &'a [u8], value: &mut Vec<u8>) -> BasaltResult<&'a [u8]> {
    if bytes.len() < 2 {
        let message = "decode_length_prefixed_bytes - binary data value does not have a full length prefix";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let value_length: usize = u16::from_be_bytes(bytes[..2].try_into().unwrap()) as usize;
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        let message = "decode_length_prefixed_bytes - binary data value has length larger than remaining packet bytes";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    *value = Vec::from(&mutable_bytes[..value_length]);
    Ok(&mutable_bytes[(value_length)..])
}

pub(crate) fn decode_optional_length_prefixed_string<'a>(bytes: &'a [u8], value: &mut Option<String>) -> BasaltResult<&'a [u8]> {
    if value.is_some() {
        let message = "decode_optional_length_prefixed_string - invalid duplicate optional string field";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut decoded = String::new();
    let remaining = decode_length_prefixed_string(bytes, &mut decoded)?;
    *value = Some(decoded);
    Ok(remaining)
}

pub(crate) fn decode_optional_length_prefixed_bytes<'a>(bytes: &'a [u8], value: &mut Option<Vec<u8>>) -> BasaltResult<&'a [u8]> {
    if value.is_some() {
        let message = "decode_optional_length_prefixed_bytes - invalid duplicate optional binary data field";
        error!("{}", message);
        return Err(BasaltError::new_malformed_packet(message));
    }

    let mut decoded = Vec::new();
    let remaining = decode_length_prefixed_bytes(bytes, &mut decoded)?;
    *value = Some(decoded);
    Ok(remaining)
}

macro_rules! define_ack_packet_decode_function {
    ($function_name: ident, $mqtt_packet_type: ident, $packet_type: ident, $function_name_as_string: expr, $first_byte: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
            if first_byte != $first_byte {
                let message = format!("{} - invalid first byte", $function_name_as_string);
                error!("{}", message);
                return Err(BasaltError::new_malformed_packet(message));
            }

            if packet_body.len() != 2 {
                let message = format!("{} - invalid remaining length", $function_name_as_string);
                error!("{}", message);
                return Err(BasaltError::new_malformed_packet(message));
            }

            let mut packet = $packet_type { ..Default::default() };
            decode_u16(packet_body, &mut packet.packet_id)?;

            Ok(Box::new(MqttPacket::$mqtt_packet_type(packet)))
        }
    };
}

pub(crate) use define_ack_packet_decode_function;

macro_rules! define_empty_packet_decode_function {
    ($function_name: ident, $mqtt_packet_type: ident, $packet_type: ident, $function_name_as_string: expr, $first_byte: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8]) -> BasaltResult<Box<MqttPacket>> {
            if first_byte != $first_byte {
                let message = format!("{} - invalid first byte", $function_name_as_string);
                error!("{}", message);
                return Err(BasaltError::new_malformed_packet(message));
            }

            if !packet_body.is_empty() {
                let message = format!("{} - invalid remaining length", $function_name_as_string);
                error!("{}", message);
                return Err(BasaltError::new_malformed_packet(message));
            }

            Ok(Box::new(MqttPacket::$mqtt_packet_type($packet_type {})))
        }
    };
}

pub(crate) use define_empty_packet_decode_function;
