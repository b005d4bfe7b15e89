/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the flow multiplexer: packet id allocation plus routing of inbound packets
to the active flows sharing the session's wire.
 */

use crate::error::{BasaltError, BasaltResult};
use crate::flow::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

const PACKET_ID_WORD_COUNT: usize = 1024;

/// Bitmap allocator over the packet id space `[1, 65535]`.  A cursor tracks a lower bound on
/// the lowest free id so allocation is lowest-free-first without a full scan per call.
pub(crate) struct PacketIdAllocator {
    words: Vec<u64>,
    cursor: u16,
    in_use_count: usize,
}

impl PacketIdAllocator {
    pub(crate) fn new() -> Self {
        let mut words = vec![0u64; PACKET_ID_WORD_COUNT];

        // id 0 is reserved by the protocol
        words[0] = 1;

        PacketIdAllocator {
            words,
            cursor: 1,
            in_use_count: 0,
        }
    }

    fn is_set(&self, id: u16) -> bool {
        (self.words[(id / 64) as usize] & (1u64 << (id % 64))) != 0
    }

    fn set(&mut self, id: u16) {
        self.words[(id / 64) as usize] |= 1u64 << (id % 64);
    }

    fn clear(&mut self, id: u16) {
        self.words[(id / 64) as usize] &= !(1u64 << (id % 64));
    }

    /// Allocates the lowest free packet id, failing when all 65535 ids are in use
    pub(crate) fn allocate(&mut self) -> BasaltResult<u16> {
        let mut id = self.cursor as u32;
        while id <= u16::MAX as u32 {
            /* skip fully-allocated words */
            if id % 64 == 0 && self.words[(id / 64) as usize] == u64::MAX {
                id += 64;
                continue;
            }

            if !self.is_set(id as u16) {
                self.set(id as u16);
                self.in_use_count += 1;
                self.cursor = (id as u16).saturating_add(1);
                return Ok(id as u16);
            }

            id += 1;
        }

        warn!("PacketIdAllocator - packet id space exhausted");
        Err(BasaltError::new_packet_id_space_exhausted())
    }

    /// Returns a packet id to the pool
    pub(crate) fn release(&mut self, id: u16) {
        if id == 0 || !self.is_set(id) {
            return;
        }

        self.clear(id);
        self.in_use_count -= 1;
        if id < self.cursor {
            self.cursor = id;
        }
    }

    pub(crate) fn is_in_use(&self, id: u16) -> bool {
        id != 0 && self.is_set(id)
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.in_use_count
    }
}

struct FlowEntry {
    flow_id: u64,
    packet_id: Option<u16>,
    flow: Box<dyn Flow>,
}

/// Result of offering an inbound packet to the active flows.
#[derive(Debug)]
pub(crate) enum RouteResult {

    /// Exactly one flow accepted the packet; `send` is the packet the flow wants written in
    /// response, if any.
    Consumed { send: Option<MqttPacket> },

    /// No flow accepted the packet; the session engine handles it (listeners, engine acks,
    /// lifecycle events).
    Unrouted(Box<MqttPacket>),
}

/// Owns packet id allocation and the insertion-ordered registry of active flows.  Inbound
/// packets are offered to each flow's `accept` in insertion order; the first match consumes
/// the packet and no other flow sees it.
pub(crate) struct FlowMultiplexer {
    allocator: PacketIdAllocator,
    flows: Vec<FlowEntry>,
}

impl FlowMultiplexer {
    pub(crate) fn new() -> Self {
        FlowMultiplexer {
            allocator: PacketIdAllocator::new(),
            flows: Vec::new(),
        }
    }

    /// Registers a flow under the supplied flow id: allocates and binds a packet id when the
    /// flow asks for one, invokes `start`, and returns the packet to write, if any.
    ///
    /// Packet id exhaustion fails the flow (its awaiter sees the error); other flows and the
    /// session continue untouched.
    pub(crate) fn register(&mut self, flow_id: u64, mut flow: Box<dyn Flow>) -> Option<MqttPacket> {
        let mut packet_id = None;
        if flow.needs_packet_id() {
            match self.allocator.allocate() {
                Ok(id) => {
                    flow.bind_packet_id(id);
                    packet_id = Some(id);
                }
                Err(error) => {
                    warn!("FlowMultiplexer - failing flow {}: {}", flow_id, error);
                    flow.fail(error);
                    return None;
                }
            }
        }

        let start_packet = flow.start();

        debug!("FlowMultiplexer - flow {} registered with packet id {:?}", flow_id, packet_id);
        self.flows.push(FlowEntry {
            flow_id,
            packet_id,
            flow,
        });

        start_packet
    }

    /// Offers an inbound packet to the active flows in insertion order
    pub(crate) fn route(&mut self, packet: Box<MqttPacket>) -> RouteResult {
        let accept_index = self.flows.iter().position(|entry| entry.flow.accept(&packet));
        if accept_index.is_none() {
            return RouteResult::Unrouted(packet);
        }

        let index = accept_index.unwrap();
        let flow_id = self.flows[index].flow_id;

        match self.flows[index].flow.next(*packet) {
            Ok(step) => {
                if step.done {
                    debug!("FlowMultiplexer - flow {} completed", flow_id);
                    self.remove_flow_at(index);
                }

                RouteResult::Consumed { send: step.send }
            }
            Err(error) => {
                warn!("FlowMultiplexer - flow {} failed: {}", flow_id, error);
                let mut entry = self.remove_flow_at(index);
                entry.flow.fail(error);

                RouteResult::Consumed { send: None }
            }
        }
    }

    /// Cancels a single flow, failing its awaiter with FlowStopped.  Returns whether the flow
    /// was found.
    pub(crate) fn stop_flow(&mut self, flow_id: u64) -> bool {
        let index = self.flows.iter().position(|entry| entry.flow_id == flow_id);
        if let Some(index) = index {
            info!("FlowMultiplexer - stopping flow {}", flow_id);
            let mut entry = self.remove_flow_at(index);
            entry.flow.fail(BasaltError::new_flow_stopped());
            return true;
        }

        false
    }

    /// Aborts every active flow with SessionClosed and resets the packet id pool.  Invoked on
    /// session teardown; the pool is per-session state.
    pub(crate) fn reset(&mut self) {
        let flow_count = self.flows.len();
        if flow_count > 0 {
            info!("FlowMultiplexer - aborting {} in-flight flows on session teardown", flow_count);
        }

        for mut entry in self.flows.drain(..) {
            entry.flow.fail(BasaltError::new_session_closed());
        }

        self.allocator = PacketIdAllocator::new();
    }

    pub(crate) fn active_flow_count(&self) -> usize {
        self.flows.len()
    }

    pub(crate) fn is_packet_id_in_use(&self, id: u16) -> bool {
        self.allocator.is_in_use(id)
    }

    fn remove_flow_at(&mut self, index: usize) -> FlowEntry {
        let entry = self.flows.remove(index);
        if let Some(packet_id) = entry.packet_id {
            self.allocator.release(packet_id);
        }

        entry
    }
}
