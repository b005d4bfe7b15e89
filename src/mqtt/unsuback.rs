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

define_ack_packet_encode_function!(write_unsuback_packet, UnsubackPacket, UNSUBACK_FIRST_BYTE);
define_ack_packet_decode_function!(decode_unsuback_packet, Unsuback, UnsubackPacket, "decode_unsuback_packet", UNSUBACK_FIRST_BYTE);
define_ack_packet_display_trait!(UnsubackPacket, "UnsubackPacket");
