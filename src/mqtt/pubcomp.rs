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

define_ack_packet_encode_function!(write_pubcomp_packet, PubcompPacket, PUBCOMP_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubcomp_packet, Pubcomp, PubcompPacket, "decode_pubcomp_packet", PUBCOMP_FIRST_BYTE);
define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubcomp_round_trip_encode_decode() {
        let packet = PubcompPacket {
            packet_id: 65535,
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pubcomp(packet)));
    }

    #[test]
    fn pubcomp_decode_failure_bad_fixed_header() {
        let packet = PubcompPacket {
            packet_id: 65535,
        };

        do_fixed_header_flag_decode_failure_test(&MqttPacket::Pubcomp(packet), 0x03);
    }
}
