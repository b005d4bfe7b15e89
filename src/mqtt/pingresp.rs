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

define_empty_packet_encode_function!(write_pingresp_packet, PINGRESP_FIRST_BYTE);
define_empty_packet_decode_function!(decode_pingresp_packet, Pingresp, PingrespPacket, "decode_pingresp_packet", PINGRESP_FIRST_BYTE);
define_empty_packet_display_trait!(PingrespPacket, "PingrespPacket");
