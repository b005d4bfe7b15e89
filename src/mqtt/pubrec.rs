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

define_ack_packet_encode_function!(write_pubrec_packet, PubrecPacket, PUBREC_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubrec_packet, Pubrec, PubrecPacket, "decode_pubrec_packet", PUBREC_FIRST_BYTE);
define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");
