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

define_ack_packet_encode_function!(write_puback_packet, PubackPacket, PUBACK_FIRST_BYTE);
define_ack_packet_decode_function!(decode_puback_packet, Puback, PubackPacket, "decode_puback_packet", PUBACK_FIRST_BYTE);
define_ack_packet_display_trait!(PubackPacket, "PubackPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn puback_round_trip_encode_decode_default() {
        let packet = PubackPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet)));
    }

    #[test]
    fn puback_round_trip_encode_decode() {
        let packet = PubackPacket {
            packet_id: 123,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet)));
    }

    #[test]
    fn puback_decode_failure_bad_fixed_header() {
        let packet = PubackPacket {
            packet_id: 16384,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Puback(packet), 0x07);
    }

    #[test]
    fn puback_decode_failure_bad_remaining_length() {
        let packet = PubackPacket {
            packet_id: 42,
        };

        let stretch_remaining_length = |bytes: &[u8]| -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] = 3;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Puback(packet), stretch_remaining_length);
    }
}
