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

define_ack_packet_encode_function!(write_pubrel_packet, PubrelPacket, PUBREL_FIRST_BYTE);
define_ack_packet_decode_function!(decode_pubrel_packet, Pubrel, PubrelPacket, "decode_pubrel_packet", PUBREL_FIRST_BYTE);
define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");
