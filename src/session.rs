/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Internal module that implements most of the MQTT spec with respect to client session behavior

use crate::decode::*;
use crate::encode::*;
use crate::error::{BasaltError, BasaltResult};
use crate::flow::*;
use crate::listener::*;
use crate::multiplexer::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

use std::collections::{HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum SessionStateType {
    Disconnected,
    PendingConnack,
    Ready,
    PendingDisconnect,
    Halted
}

impl Display for SessionStateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStateType::Disconnected => { write!(f, "Disconnected") }
            SessionStateType::PendingConnack => { write!(f, "PendingConnack") }
            SessionStateType::Ready => { write!(f, "Ready") }
            SessionStateType::PendingDisconnect => { write!(f, "PendingDisconnect") }
            SessionStateType::Halted => { write!(f, "Halted") }
        }
    }
}

// The session state is completely uncoupled from networking data types.  We offer a simple
// interface that models and handles all relevant transport events.
pub(crate) enum NetworkEvent<'a> {
    ConnectionOpened,
    ConnectionClosed,
    IncomingData(&'a [u8]),
    WriteCompletion
}

pub(crate) struct NetworkEventContext<'a> {
    pub(crate) event: NetworkEvent<'a>,
    pub(crate) current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // output field for all data that should be written to the socket
    pub(crate) to_socket: &'a mut Vec<u8>,
    pub(crate) current_time: Instant,
}

pub(crate) struct SessionConfig {
    pub(crate) connect: ConnectPacket,

    pub(crate) connect_delay: Duration,

    pub(crate) base_timestamp: Instant,
}

// Primary data structure that tracks MQTT protocol state for one transport attachment.  A
// fresh session is created for every connection attempt; the listener registry and event
// dispatcher are owned by the client and shared into each session in turn.
pub(crate) struct SessionState {
    config: SessionConfig,

    state: SessionStateType,

    // the need to model time in a simple, test-controllable fashion leads to a solution where
    // the state thinks in time based on elapsed milliseconds since the state was created.
    // All public entry points take the current time as a parameter.
    current_time: Instant,
    elapsed_time_ms: u128,

    packet_writer: Arc<Mutex<Box<dyn PacketWriter + Send>>>,

    listeners: Arc<Mutex<ListenerRegistry>>,
    events: Arc<Mutex<EventDispatcher>>,

    multiplexer: FlowMultiplexer,
    decoder: Decoder,

    // Resolves the connect() awaiter; consumed on CONNACK receipt or session teardown
    connect_completion: Option<FlowCompletion<ConnackPacket>>,

    // The exact bytes of the first CONNECT encoding.  Connect-delay retries write this buffer
    // verbatim so every retried CONNECT is byte-identical to the first.
    connect_bytes: Vec<u8>,
    connect_write_pending: bool,
    connect_retry_timepoint: Option<Instant>,

    // Packets queued for encoding on the next service pass
    outbound: VecDeque<MqttPacket>,

    // QoS 0 publishes complete when their bytes reach the transport, not on any ack.  Queued
    // completions move to the flushed list when their publish is encoded, and resolve on the
    // following write completion event.
    qos0_completions_awaiting_encode: Vec<FlowCompletion<PublishResponse>>,
    qos0_completions_awaiting_write: Vec<FlowCompletion<PublishResponse>>,

    keep_alive: Duration,
    next_ping_timepoint: Option<Instant>,
    ping_outstanding: bool,
    ping_misses: u32,

    // Tracks the packet ids of incoming qos2 publishes that haven't been released yet.  When
    // we receive a qos2 publish whose packet id is in here, we can ignore it because it's a
    // duplicate delivery.  Packet ids are removed when we receive a pubrel for it.
    qos2_incomplete_incoming_publishes: HashSet<u16>,

    disconnect_write_pending: bool,

    terminal_emitted: bool,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionState: {{")?;
        write!(f, " state:{},", self.state)?;
        write!(f, " elapsed_time_ms:{},", self.elapsed_time_ms)?;
        write!(f, " active_flows:{},", self.multiplexer.active_flow_count())?;
        write!(f, " outbound:{} packets,", self.outbound.len())?;
        write!(f, " ping_outstanding:{},", self.ping_outstanding)?;
        write!(f, " ping_misses:{},", self.ping_misses)?;
        write!(f, " qos2_incomplete_incoming_publishes:{} ids", self.qos2_incomplete_incoming_publishes.len())?;
        write!(f, " }}")
    }
}

impl SessionState {

    // Crate-public API

    pub(crate) fn new(
        config: SessionConfig,
        packet_writer: Arc<Mutex<Box<dyn PacketWriter + Send>>>,
        listeners: Arc<Mutex<ListenerRegistry>>,
        events: Arc<Mutex<EventDispatcher>>,
        connect_completion: Option<FlowCompletion<ConnackPacket>>) -> SessionState {

        let base_time = config.base_timestamp;
        let keep_alive = Duration::from_secs(config.connect.keep_alive_seconds as u64);

        SessionState {
            config,
            state: SessionStateType::Disconnected,
            current_time: base_time,
            elapsed_time_ms: 0,
            packet_writer,
            listeners,
            events,
            multiplexer: FlowMultiplexer::new(),
            decoder: Decoder::new(),
            connect_completion,
            connect_bytes: Vec::new(),
            connect_write_pending: false,
            connect_retry_timepoint: None,
            outbound: VecDeque::new(),
            qos0_completions_awaiting_encode: Vec::new(),
            qos0_completions_awaiting_write: Vec::new(),
            keep_alive,
            next_ping_timepoint: None,
            ping_outstanding: false,
            ping_misses: 0,
            qos2_incomplete_incoming_publishes: HashSet::new(),
            disconnect_write_pending: false,
            terminal_emitted: false,
        }
    }

    pub(crate) fn state(&self) -> SessionStateType {
        self.state
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == SessionStateType::Ready
    }

    pub(crate) fn handle_network_event(&mut self, context: &mut NetworkEventContext) -> BasaltResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match &context.event {
                NetworkEvent::ConnectionOpened => { self.handle_network_event_connection_opened() }
                NetworkEvent::ConnectionClosed => { self.handle_network_event_connection_closed() }
                NetworkEvent::WriteCompletion => { self.handle_network_event_write_completion() }
                NetworkEvent::IncomingData(data) => { self.handle_network_event_incoming_data(data) }
            };

        if let Err(error) = &result {
            error!("[{} ms] handle_network_event - final result: {}", self.elapsed_time_ms, error);
            self.change_state(SessionStateType::Halted);
        } else {
            debug!("[{} ms] handle_network_event - {}", self.elapsed_time_ms, self);
        }

        result
    }

    pub(crate) fn service(&mut self, context: &mut ServiceContext) -> BasaltResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match self.state {
                SessionStateType::Disconnected => { Ok(()) }
                SessionStateType::PendingConnack => { self.service_pending_connack(context) }
                SessionStateType::Ready => { self.service_ready(context) }
                SessionStateType::PendingDisconnect => { self.service_write_queues(context) }
                SessionStateType::Halted => { Err(BasaltError::new_internal_state_error("session state previously halted")) }
            };

        if let Err(error) = &result {
            error!("[{} ms] service - final result: {}", self.elapsed_time_ms, error);
            self.change_state(SessionStateType::Halted);
        }

        result
    }

    pub(crate) fn get_next_service_timepoint(&mut self, current_time: &Instant) -> Option<Instant> {
        self.update_internal_clock(current_time);

        if !self.outbound.is_empty() || self.connect_write_pending {
            return Some(self.current_time);
        }

        match self.state {
            SessionStateType::PendingConnack => { self.connect_retry_timepoint }
            SessionStateType::Ready => { self.next_ping_timepoint }
            _ => { None }
        }
    }

    // User operation entry points.  All of them require a ready session; the engine performs
    // no offline queueing.

    pub(crate) fn start_publish(&mut self, publish: PublishPacket, completion: FlowCompletion<PublishResponse>, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != SessionStateType::Ready {
            completion.complete(Err(BasaltError::new_session_closed()));
            return;
        }

        if let Err(error) = crate::mqtt::publish::validate_publish_packet_outbound(&publish) {
            completion.complete(Err(error));
            return;
        }

        match publish.qos() {
            QualityOfService::AtMostOnce => {
                debug!("[{} ms] start_publish - queueing qos 0 publish", self.elapsed_time_ms);
                self.outbound.push_back(MqttPacket::Publish(publish));
                self.qos0_completions_awaiting_encode.push(completion);
            }
            QualityOfService::AtLeastOnce => {
                let flow_id = next_flow_id();
                debug!("[{} ms] start_publish - starting qos 1 publish flow {}", self.elapsed_time_ms, flow_id);
                self.register_flow(flow_id, Box::new(PublishQos1Flow::new(publish, completion)));
            }
            QualityOfService::ExactlyOnce => {
                let flow_id = next_flow_id();
                debug!("[{} ms] start_publish - starting qos 2 publish flow {}", self.elapsed_time_ms, flow_id);
                self.register_flow(flow_id, Box::new(PublishQos2Flow::new(publish, completion)));
            }
        }
    }

    pub(crate) fn start_subscribe(&mut self, subscriptions: Vec<Subscription>, completion: FlowCompletion<SubackPacket>, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != SessionStateType::Ready {
            completion.complete(Err(BasaltError::new_session_closed()));
            return;
        }

        let subscribe = SubscribePacket {
            packet_id: 0,
            subscriptions,
        };

        if let Err(error) = crate::mqtt::subscribe::validate_subscribe_packet_outbound(&subscribe) {
            completion.complete(Err(error));
            return;
        }

        let flow_id = next_flow_id();
        debug!("[{} ms] start_subscribe - starting subscribe flow {}", self.elapsed_time_ms, flow_id);
        self.register_flow(flow_id, Box::new(SubscribeFlow::new(subscribe, completion)));
    }

    pub(crate) fn start_unsubscribe(&mut self, topic_filters: Vec<String>, completion: FlowCompletion<UnsubackPacket>, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != SessionStateType::Ready {
            completion.complete(Err(BasaltError::new_session_closed()));
            return;
        }

        let unsubscribe = UnsubscribePacket {
            packet_id: 0,
            topic_filters,
        };

        if let Err(error) = crate::mqtt::unsubscribe::validate_unsubscribe_packet_outbound(&unsubscribe) {
            completion.complete(Err(error));
            return;
        }

        let flow_id = next_flow_id();
        debug!("[{} ms] start_unsubscribe - starting unsubscribe flow {}", self.elapsed_time_ms, flow_id);
        self.register_flow(flow_id, Box::new(UnsubscribeFlow::new(unsubscribe, completion)));
    }

    /// Registers an arbitrary user-supplied flow under a caller-allocated flow id
    pub(crate) fn start_user_flow(&mut self, flow_id: u64, mut flow: Box<dyn Flow>, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != SessionStateType::Ready {
            flow.fail(BasaltError::new_session_closed());
            return;
        }

        debug!("[{} ms] start_user_flow - starting flow {}", self.elapsed_time_ms, flow_id);
        self.register_flow(flow_id, flow);
    }

    pub(crate) fn stop_flow(&mut self, flow_id: u64, current_time: &Instant) -> bool {
        self.update_internal_clock(current_time);
        self.multiplexer.stop_flow(flow_id)
    }

    /// Begins a soft disconnect: a DISCONNECT packet is queued; once it drains to the
    /// transport the session reports a user-initiated termination.
    pub(crate) fn request_disconnect(&mut self, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != SessionStateType::Ready && self.state != SessionStateType::PendingConnack {
            return;
        }

        info!("[{} ms] request_disconnect - queueing DISCONNECT", self.elapsed_time_ms);
        self.outbound.push_back(MqttPacket::Disconnect(DisconnectPacket {}));
        self.disconnect_write_pending = true;
        self.change_state(SessionStateType::PendingDisconnect);
    }

    /// Terminal teardown.  Idempotent; the first invocation aborts every in-flight flow with
    /// SessionClosed, resolves a still-pending connect() with the termination reason, and
    /// emits the error/disconnect lifecycle events.  Returns the shared reason for the
    /// reconnect controller to inspect.
    pub(crate) fn shutdown(&mut self, reason: BasaltError) -> Arc<BasaltError> {
        let reason = Arc::new(reason);

        if self.terminal_emitted {
            return reason;
        }
        self.terminal_emitted = true;

        info!("[{} ms] shutdown - {}", self.elapsed_time_ms, reason);
        self.change_state(SessionStateType::Disconnected);

        if let Some(completion) = self.connect_completion.take() {
            completion.complete(Err(reason.clone_kind()));
        }

        for completion in self.qos0_completions_awaiting_encode.drain(..) {
            completion.complete(Err(BasaltError::new_session_closed()));
        }

        for completion in self.qos0_completions_awaiting_write.drain(..) {
            completion.complete(Err(BasaltError::new_session_closed()));
        }

        self.multiplexer.reset();

        if !matches!(*reason, BasaltError::UserInitiatedDisconnect(_)) {
            self.emit_event(ClientEvent::Error(ErrorEvent {
                error: reason.clone(),
            }));
        }

        self.emit_event(ClientEvent::Disconnect(DisconnectionEvent {
            error: reason.clone(),
        }));

        reason
    }

    // Private implementation

    fn update_internal_clock(&mut self, current_time: &Instant) {
        self.current_time = *current_time;
        self.elapsed_time_ms = (*current_time - self.config.base_timestamp).as_millis();
    }

    fn change_state(&mut self, next_state: SessionStateType) {
        debug!("[{} ms] change_state - transitioning from {} to {}", self.elapsed_time_ms, self.state, next_state);
        self.state = next_state;
    }

    fn emit_event(&self, event: ClientEvent) {
        let callbacks = self.events.lock().unwrap().callbacks();
        if callbacks.is_empty() {
            return;
        }

        let shared_event = Arc::new(event);
        for callback in callbacks {
            callback(shared_event.clone());
        }
    }

    fn register_flow(&mut self, flow_id: u64, flow: Box<dyn Flow>) {
        if let Some(start_packet) = self.multiplexer.register(flow_id, flow) {
            self.outbound.push_back(start_packet);
        }
    }

    fn encode_packet(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> BasaltResult<()> {
        let mut writer = self.packet_writer.lock().unwrap();
        writer.write_packet(packet, dest)
    }

    fn handle_network_event_connection_opened(&mut self) -> BasaltResult<()> {
        if self.state != SessionStateType::Disconnected || self.terminal_emitted {
            error!("[{} ms] handle_network_event_connection_opened - called in invalid state", self.elapsed_time_ms);
            return Err(BasaltError::new_internal_state_error("connection opened in an invalid state"));
        }

        info!("[{} ms] handle_network_event_connection_opened", self.elapsed_time_ms);
        self.change_state(SessionStateType::PendingConnack);
        self.decoder.reset_for_new_connection();

        // cache the CONNECT encoding once; retries must be byte-identical
        let connect_packet = MqttPacket::Connect(self.config.connect.clone());
        let mut connect_bytes = Vec::new();
        self.encode_packet(&connect_packet, &mut connect_bytes)?;

        self.connect_bytes = connect_bytes;
        self.connect_write_pending = true;

        if !self.config.connect_delay.is_zero() {
            self.connect_retry_timepoint = Some(self.current_time + self.config.connect_delay);
        }

        Ok(())
    }

    fn handle_network_event_connection_closed(&mut self) -> BasaltResult<()> {
        if self.state == SessionStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_closed - called in invalid state", self.elapsed_time_ms);
            return Err(BasaltError::new_internal_state_error("connection closed in an invalid state"));
        }

        info!("[{} ms] handle_network_event_connection_closed", self.elapsed_time_ms);
        self.next_ping_timepoint = None;
        self.connect_retry_timepoint = None;
        self.change_state(SessionStateType::Disconnected);

        Ok(())
    }

    fn handle_network_event_write_completion(&mut self) -> BasaltResult<()> {
        debug!("[{} ms] handle_network_event_write_completion", self.elapsed_time_ms);

        for completion in self.qos0_completions_awaiting_write.drain(..) {
            completion.complete(Ok(PublishResponse::Qos0));
        }

        if self.disconnect_write_pending && self.outbound.is_empty() {
            // the DISCONNECT has drained; the session ends cleanly
            info!("[{} ms] handle_network_event_write_completion - DISCONNECT drained, session complete", self.elapsed_time_ms);
            self.disconnect_write_pending = false;
            return Err(BasaltError::new_user_initiated_disconnect(false));
        }

        Ok(())
    }

    fn handle_network_event_incoming_data(&mut self, data: &[u8]) -> BasaltResult<()> {
        if self.state == SessionStateType::Disconnected || self.state == SessionStateType::Halted {
            error!("[{} ms] handle_network_event_incoming_data - called in invalid state", self.elapsed_time_ms);
            return Err(BasaltError::new_internal_state_error("incoming network data while in an invalid state"));
        }

        debug!("[{} ms] handle_network_event_incoming_data - received {} bytes", self.elapsed_time_ms, data.len());
        let mut decoded_packets = VecDeque::new();
        let mut decode_context = DecodingContext {
            decoded_packets: &mut decoded_packets
        };

        self.decoder.decode_bytes(data, &mut decode_context)?;

        for packet in decoded_packets {
            self.emit_event(ClientEvent::PacketReceived(PacketReceivedEvent {
                packet: (*packet).clone(),
            }));

            self.handle_packet(packet)?;
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: Box<MqttPacket>) -> BasaltResult<()> {
        match self.state {
            SessionStateType::PendingConnack => { self.handle_packet_pending_connack(packet) }
            SessionStateType::Ready => { self.handle_packet_ready(packet) }
            SessionStateType::PendingDisconnect => {
                debug!("[{} ms] handle_packet - dropping inbound {} while disconnecting", self.elapsed_time_ms, mqtt_packet_to_str(&packet));
                Ok(())
            }
            _ => {
                Err(BasaltError::new_internal_state_error("packet dispatch in an invalid state"))
            }
        }
    }

    fn handle_packet_pending_connack(&mut self, packet: Box<MqttPacket>) -> BasaltResult<()> {
        if let MqttPacket::Connack(connack) = *packet {
            if connack.return_code != ConnectReturnCode::Accepted {
                error!("[{} ms] handle_packet_pending_connack - connection rejected with return code {}", self.elapsed_time_ms, connack.return_code);
                let status = connack.return_code;
                if let Some(completion) = self.connect_completion.take() {
                    completion.complete(Err(BasaltError::new_connection_rejected(status)));
                }

                return Err(BasaltError::new_connection_rejected(status));
            }

            info!("[{} ms] handle_packet_pending_connack - connection accepted, session_present={}", self.elapsed_time_ms, connack.session_present);
            self.change_state(SessionStateType::Ready);
            self.connect_retry_timepoint = None;

            if !self.keep_alive.is_zero() {
                self.next_ping_timepoint = Some(self.current_time + self.keep_alive);
            }

            if let Some(completion) = self.connect_completion.take() {
                completion.complete(Ok(connack.clone()));
            }

            self.emit_event(ClientEvent::Connect(ConnectionSuccessEvent {
                connack,
            }));

            return Ok(());
        }

        let message = format!("handle_packet_pending_connack - received {} while awaiting CONNACK", mqtt_packet_to_str(&packet));
        error!("[{} ms] {}", self.elapsed_time_ms, message);

        if let Some(completion) = self.connect_completion.take() {
            completion.complete(Err(BasaltError::new_unexpected_packet(message.clone())));
        }

        Err(BasaltError::new_unexpected_packet(message))
    }

    fn handle_packet_ready(&mut self, packet: Box<MqttPacket>) -> BasaltResult<()> {
        // pingresps settle keep-alive accounting whether or not a ping flow is still around
        // to consume them
        if let MqttPacket::Pingresp(_) = &*packet {
            self.ping_outstanding = false;
            self.ping_misses = 0;
        }

        match self.multiplexer.route(packet) {
            RouteResult::Consumed { send } => {
                if let Some(response) = send {
                    self.outbound.push_back(response);
                }

                Ok(())
            }
            RouteResult::Unrouted(packet) => {
                self.handle_unrouted_packet(packet)
            }
        }
    }

    fn handle_unrouted_packet(&mut self, packet: Box<MqttPacket>) -> BasaltResult<()> {
        match *packet {
            MqttPacket::Publish(publish) => {
                self.handle_inbound_publish(publish)
            }
            MqttPacket::Pubrel(pubrel) => {
                // always answer with a PUBCOMP; forgetting the id is not a protocol option
                self.qos2_incomplete_incoming_publishes.remove(&pubrel.packet_id);
                self.outbound.push_back(MqttPacket::Pubcomp(PubcompPacket {
                    packet_id: pubrel.packet_id,
                }));

                Ok(())
            }
            MqttPacket::Pingresp(_) => {
                Ok(())
            }
            MqttPacket::Connack(_) => {
                let message = "handle_unrouted_packet - received a second CONNACK on an established session";
                error!("[{} ms] {}", self.elapsed_time_ms, message);
                Err(BasaltError::new_unexpected_packet(message))
            }
            MqttPacket::Connect(_) | MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) | MqttPacket::Pingreq(_) | MqttPacket::Disconnect(_) => {
                let message = format!("handle_unrouted_packet - received client-to-server packet {} from the broker", mqtt_packet_to_str(&packet));
                error!("[{} ms] {}", self.elapsed_time_ms, message);
                Err(BasaltError::new_protocol_violation(message))
            }
            _ => {
                // an ack nobody waits for; most commonly a late ack racing a stop_flow
                warn!("[{} ms] handle_unrouted_packet - no flow accepted inbound {}", self.elapsed_time_ms, mqtt_packet_to_str(&packet));
                Ok(())
            }
        }
    }

    fn handle_inbound_publish(&mut self, publish: PublishPacket) -> BasaltResult<()> {
        let mut deliver = true;

        match publish.qos() {
            QualityOfService::AtMostOnce => {}
            QualityOfService::AtLeastOnce => {
                // the ack is queued before listener dispatch; listener behavior can never
                // block protocol acknowledgement
                self.outbound.push_back(MqttPacket::Puback(PubackPacket {
                    packet_id: publish.packet_id(),
                }));
            }
            QualityOfService::ExactlyOnce => {
                self.outbound.push_back(MqttPacket::Pubrec(PubrecPacket {
                    packet_id: publish.packet_id(),
                }));

                if !self.qos2_incomplete_incoming_publishes.insert(publish.packet_id()) {
                    debug!("[{} ms] handle_inbound_publish - duplicate qos 2 delivery for packet id {}", self.elapsed_time_ms, publish.packet_id());
                    deliver = false;
                }
            }
        }

        if deliver {
            self.deliver_message(&publish);
        }

        Ok(())
    }

    fn deliver_message(&mut self, publish: &PublishPacket) {
        let message = Arc::new(Message::from_publish(publish));

        let callbacks = self.listeners.lock().unwrap().matching_callbacks(message.topic.as_str());
        debug!("[{} ms] deliver_message - {} listeners match topic \"{}\"", self.elapsed_time_ms, callbacks.len(), message.topic);

        for callback in callbacks {
            callback(message.clone());
        }

        self.emit_event(ClientEvent::Message(MessageEvent {
            message,
        }));
    }

    fn service_pending_connack(&mut self, context: &mut ServiceContext) -> BasaltResult<()> {
        if let Some(retry_timepoint) = self.connect_retry_timepoint {
            if context.current_time >= retry_timepoint {
                info!("[{} ms] service_pending_connack - no CONNACK within the connect delay, re-sending CONNECT", self.elapsed_time_ms);
                self.connect_write_pending = true;
                self.connect_retry_timepoint = Some(context.current_time + self.config.connect_delay);
            }
        }

        self.service_write_queues(context)
    }

    fn service_ready(&mut self, context: &mut ServiceContext) -> BasaltResult<()> {
        self.service_keep_alive(context)?;
        self.service_write_queues(context)
    }

    fn service_keep_alive(&mut self, context: &mut ServiceContext) -> BasaltResult<()> {
        if self.keep_alive.is_zero() {
            return Ok(());
        }

        if let Some(next_ping) = self.next_ping_timepoint {
            if context.current_time >= next_ping {
                if self.ping_outstanding {
                    self.ping_misses += 1;
                    warn!("[{} ms] service_keep_alive - ping interval elapsed without PINGRESP ({} consecutive misses)", self.elapsed_time_ms, self.ping_misses);

                    if self.ping_misses >= 2 {
                        error!("[{} ms] service_keep_alive - keep alive timeout exceeded", self.elapsed_time_ms);
                        return Err(BasaltError::new_connection_closed("keep alive timeout exceeded"));
                    }
                }

                debug!("[{} ms] service_keep_alive - ping time reached, starting ping flow", self.elapsed_time_ms);
                let flow_id = next_flow_id();
                self.register_flow(flow_id, Box::new(PingFlow::new(None)));
                self.ping_outstanding = true;
                self.next_ping_timepoint = Some(context.current_time + self.keep_alive);
            }
        }

        Ok(())
    }

    fn service_write_queues(&mut self, context: &mut ServiceContext) -> BasaltResult<()> {
        if self.connect_write_pending {
            debug!("[{} ms] service_write_queues - writing cached CONNECT ({} bytes)", self.elapsed_time_ms, self.connect_bytes.len());
            context.to_socket.extend_from_slice(self.connect_bytes.as_slice());
            self.connect_write_pending = false;
        }

        while let Some(packet) = self.outbound.pop_front() {
            let mut encoded = Vec::new();
            self.encode_packet(&packet, &mut encoded)?;
            context.to_socket.extend_from_slice(encoded.as_slice());
        }

        // every queued qos 0 publish is now in the outbound buffer
        self.qos0_completions_awaiting_write.append(&mut self.qos0_completions_awaiting_encode);

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::encode::Encoder;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    struct SessionTestFixture {
        session: SessionState,
        connect_handle: Option<FlowHandle<ConnackPacket>>,
        listeners: Arc<Mutex<ListenerRegistry>>,
        event_log: Arc<Mutex<Vec<String>>>,
        base_timestamp: Instant,
    }

    fn event_to_tag(event: &ClientEvent) -> String {
        match event {
            ClientEvent::Connect(_) => { "connect".to_string() }
            ClientEvent::Disconnect(_) => { "disconnect".to_string() }
            ClientEvent::Error(_) => { "error".to_string() }
            ClientEvent::Message(event) => { format!("message:{}", event.message.topic) }
            ClientEvent::PacketReceived(event) => { format!("packet:{}", mqtt_packet_to_str(&event.packet)) }
        }
    }

    impl SessionTestFixture {
        fn new(connect: ConnectPacket, connect_delay: Duration) -> Self {
            let base_timestamp = Instant::now();
            let listeners = Arc::new(Mutex::new(ListenerRegistry::new()));
            let events = Arc::new(Mutex::new(EventDispatcher::new()));

            let event_log = Arc::new(Mutex::new(Vec::new()));
            let log_clone = event_log.clone();
            events.lock().unwrap().add(Arc::new(move |event: Arc<ClientEvent>| {
                log_clone.lock().unwrap().push(event_to_tag(&event));
            }));

            let (connect_completion, connect_handle) = FlowCompletion::new(next_flow_id());

            let packet_writer: Arc<Mutex<Box<dyn PacketWriter + Send>>> = Arc::new(Mutex::new(Box::new(Encoder::new())));

            let session = SessionState::new(
                SessionConfig {
                    connect,
                    connect_delay,
                    base_timestamp,
                },
                packet_writer,
                listeners.clone(),
                events.clone(),
                Some(connect_completion),
            );

            SessionTestFixture {
                session,
                connect_handle: Some(connect_handle),
                listeners,
                event_log,
                base_timestamp,
            }
        }

        fn at(&self, offset_millis: u64) -> Instant {
            self.base_timestamp + Duration::from_millis(offset_millis)
        }

        fn open_connection(&mut self, offset_millis: u64) -> BasaltResult<()> {
            let mut context = NetworkEventContext {
                event: NetworkEvent::ConnectionOpened,
                current_time: self.at(offset_millis),
            };
            self.session.handle_network_event(&mut context)
        }

        fn feed_bytes(&mut self, bytes: &[u8], offset_millis: u64) -> BasaltResult<()> {
            let mut context = NetworkEventContext {
                event: NetworkEvent::IncomingData(bytes),
                current_time: self.at(offset_millis),
            };
            self.session.handle_network_event(&mut context)
        }

        fn write_completion(&mut self, offset_millis: u64) -> BasaltResult<()> {
            let mut context = NetworkEventContext {
                event: NetworkEvent::WriteCompletion,
                current_time: self.at(offset_millis),
            };
            self.session.handle_network_event(&mut context)
        }

        fn run_service(&mut self, offset_millis: u64) -> BasaltResult<Vec<u8>> {
            let mut to_socket = Vec::new();
            let mut context = ServiceContext {
                to_socket: &mut to_socket,
                current_time: self.at(offset_millis),
            };
            self.session.service(&mut context)?;
            Ok(to_socket)
        }

        fn establish(&mut self) {
            self.open_connection(0).unwrap();
            let connect_bytes = self.run_service(1).unwrap();
            assert!(!connect_bytes.is_empty());
            self.feed_bytes(&[0x20, 0x02, 0x00, 0x00], 2).unwrap();
            assert!(self.session.is_ready());
        }

        fn event_tags(&self) -> Vec<String> {
            self.event_log.lock().unwrap().clone()
        }
    }

    fn standard_connect() -> ConnectPacket {
        ConnectPacket {
            client_id: "MQTTS".to_string(),
            clean_session: true,
            keep_alive_seconds: 60,
            ..Default::default()
        }
    }

    #[test]
    fn connect_success_resolves_ready() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        fixture.open_connection(0).unwrap();
        assert_eq!(SessionStateType::PendingConnack, fixture.session.state());

        let connect_bytes = fixture.run_service(1).unwrap();
        let expected_connect: Vec<u8> = vec![
            0x10, 0x11,
            0x00, 0x04, 0x4D, 0x51, 0x54, 0x54, 0x04,
            0x02,
            0x00, 0x3C,
            0x00, 0x05, 0x4D, 0x51, 0x54, 0x54, 0x53,
        ];
        assert_eq!(expected_connect, connect_bytes);

        // CONNACK: session present, accepted
        fixture.feed_bytes(&[0x20, 0x02, 0x01, 0x00], 2).unwrap();
        assert!(fixture.session.is_ready());

        let connack = fixture.connect_handle.take().unwrap().receiver.try_recv().unwrap().unwrap();
        assert!(connack.session_present);
        assert_eq!(ConnectReturnCode::Accepted, connack.return_code);

        assert_eq!(vec!["packet:Connack".to_string(), "connect".to_string()], fixture.event_tags());
    }

    #[test]
    fn connect_delay_retries_identical_bytes() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::from_millis(2000));

        fixture.open_connection(0).unwrap();

        let first_connect = fixture.run_service(1).unwrap();
        assert!(!first_connect.is_empty());

        // still inside the delay window: nothing to write
        let nothing = fixture.run_service(1999).unwrap();
        assert!(nothing.is_empty());

        // past the window: one more CONNECT, byte-identical to the first
        let second_connect = fixture.run_service(2001).unwrap();
        assert_eq!(first_connect, second_connect);

        // service timepoint moves forward for a third retry
        let next = fixture.session.get_next_service_timepoint(&fixture.at(2002)).unwrap();
        assert_eq!(fixture.at(4001), next);
    }

    #[test]
    fn connect_rejection_fails_connect_awaiter() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        fixture.open_connection(0).unwrap();
        fixture.run_service(1).unwrap();

        // CONNACK with return code 5 (not authorized)
        let result = fixture.feed_bytes(&[0x20, 0x02, 0x00, 0x05], 2);
        let error = result.unwrap_err();
        assert_eq!(Some(ConnectReturnCode::NotAuthorized), error.connect_status());

        let connect_result = fixture.connect_handle.take().unwrap().receiver.try_recv().unwrap();
        assert_matches!(connect_result, Err(BasaltError::ConnectionRejected(_)));
        assert!(!fixture.session.is_ready());
    }

    #[test]
    fn unknown_packet_during_handshake_is_fatal() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        fixture.open_connection(0).unwrap();
        fixture.run_service(1).unwrap();

        // reserved packet type 15
        let result = fixture.feed_bytes(&[0xF0, 0x02, 0x01, 0x00], 2);
        assert_matches!(result, Err(BasaltError::UnexpectedPacket(_)));

        let reason = fixture.session.shutdown(result.unwrap_err());
        assert_matches!(*reason, BasaltError::UnexpectedPacket(_));

        let connect_result = fixture.connect_handle.take().unwrap().receiver.try_recv().unwrap();
        assert_matches!(connect_result, Err(BasaltError::UnexpectedPacket(_)));

        // error and disconnect exactly once each, in that order
        assert_eq!(vec!["error".to_string(), "disconnect".to_string()], fixture.event_tags());

        // shutdown is idempotent; no event duplication
        fixture.session.shutdown(BasaltError::new_session_closed());
        assert_eq!(2, fixture.event_tags().len());
    }

    #[test]
    fn suback_before_connack_is_fatal() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        fixture.open_connection(0).unwrap();
        fixture.run_service(1).unwrap();

        let result = fixture.feed_bytes(&[0x90, 0x03, 0x00, 0x01, 0x00], 2);
        assert_matches!(result, Err(BasaltError::UnexpectedPacket(_)));
    }

    #[test]
    fn keep_alive_pings_and_pong_resets() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        // keep alive is 60 seconds from CONNACK receipt at 2 ms; nothing due at 59s
        assert!(fixture.run_service(59_000).unwrap().is_empty());

        let ping_bytes = fixture.run_service(60_002).unwrap();
        assert_eq!(vec![0xC0, 0x00], ping_bytes);

        // PINGRESP arrives; the ping flow completes and the miss counter clears
        fixture.feed_bytes(&[0xD0, 0x00], 61_000).unwrap();

        // next ping one interval after the first
        let second_ping = fixture.run_service(120_002).unwrap();
        assert_eq!(vec![0xC0, 0x00], second_ping);
    }

    #[test]
    fn keep_alive_two_missed_pings_is_fatal() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        assert_eq!(vec![0xC0, 0x00], fixture.run_service(60_002).unwrap());

        // no PINGRESP: first miss re-pings
        assert_eq!(vec![0xC0, 0x00], fixture.run_service(120_002).unwrap());

        // second consecutive miss terminates the session
        let result = fixture.run_service(180_002);
        assert_matches!(result, Err(BasaltError::ConnectionClosed(_)));
    }

    #[test]
    fn keep_alive_zero_disables_pings() {
        let mut connect = standard_connect();
        connect.keep_alive_seconds = 0;

        let mut fixture = SessionTestFixture::new(connect, Duration::ZERO);
        fixture.establish();

        assert!(fixture.run_service(3_600_000).unwrap().is_empty());
        assert_eq!(None, fixture.session.get_next_service_timepoint(&fixture.at(3_600_001)));
    }

    #[test]
    fn inbound_qos0_publish_reaches_listeners_and_events() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        fixture.listeners.lock().unwrap().add("A", Arc::new(move |message: Arc<Message>| {
            received_clone.lock().unwrap().push((*message).clone());
        }));

        fixture.establish();

        // topic "A", payload "B"
        fixture.feed_bytes(&[0x30, 0x04, 0x00, 0x01, 0x41, 0x42], 10).unwrap();

        let messages = received.lock().unwrap();
        assert_eq!(1, messages.len());
        assert_eq!("A", messages[0].topic);
        assert_eq!(b"B".to_vec(), messages[0].payload);
        assert_eq!(QualityOfService::AtMostOnce, messages[0].qos);
        assert!(!messages[0].retained);
        assert!(!messages[0].duplicate);

        assert!(fixture.event_tags().contains(&"message:A".to_string()));
    }

    #[test]
    fn inbound_qos1_publish_is_acked_before_listener_dispatch() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        fixture.listeners.lock().unwrap().add("alarms/+", Arc::new(|_| {}));

        fixture.establish();

        // qos 1, packet id 10, topic "alarms/1", payload empty
        fixture.feed_bytes(&[0x32, 0x0C, 0x00, 0x08, b'a', b'l', b'a', b'r', b'm', b's', b'/', b'1', 0x00, 0x0A], 10).unwrap();

        let ack_bytes = fixture.run_service(11).unwrap();
        assert_eq!(vec![0x40, 0x02, 0x00, 0x0A], ack_bytes);
    }

    #[test]
    fn inbound_qos2_publish_deduplicates_and_releases() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);

        let received = Arc::new(Mutex::new(0usize));
        let received_clone = received.clone();
        fixture.listeners.lock().unwrap().add("#", Arc::new(move |_| {
            *received_clone.lock().unwrap() += 1;
        }));

        fixture.establish();

        // qos 2 publish, packet id 5, topic "q"
        let publish: Vec<u8> = vec![0x34, 0x05, 0x00, 0x01, b'q', 0x00, 0x05];
        fixture.feed_bytes(publish.as_slice(), 10).unwrap();
        assert_eq!(vec![0x50, 0x02, 0x00, 0x05], fixture.run_service(11).unwrap());

        // redelivery before PUBREL: PUBREC again, no second listener invocation
        let mut duplicate = publish.clone();
        duplicate[0] |= 0x08;
        fixture.feed_bytes(duplicate.as_slice(), 12).unwrap();
        assert_eq!(vec![0x50, 0x02, 0x00, 0x05], fixture.run_service(13).unwrap());
        assert_eq!(1, *received.lock().unwrap());

        // PUBREL releases the id and gets a PUBCOMP
        fixture.feed_bytes(&[0x62, 0x02, 0x00, 0x05], 14).unwrap();
        assert_eq!(vec![0x70, 0x02, 0x00, 0x05], fixture.run_service(15).unwrap());

        // a new delivery on the same id is delivered again
        fixture.feed_bytes(publish.as_slice(), 16).unwrap();
        fixture.run_service(17).unwrap();
        assert_eq!(2, *received.lock().unwrap());
    }

    #[test]
    fn qos1_publish_flow_round_trip() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        let publish = PublishPacket::builder("telemetry/cpu", QualityOfService::AtLeastOnce)
            .with_payload(vec![1, 2, 3])
            .build();

        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let now = fixture.at(10);
        fixture.session.start_publish(publish, completion, &now);

        let publish_bytes = fixture.run_service(11).unwrap();
        assert!(!publish_bytes.is_empty());

        // puback for the allocated packet id (lowest-free-first allocates 1)
        fixture.feed_bytes(&[0x40, 0x02, 0x00, 0x01], 12).unwrap();

        let mut receiver = handle.receiver;
        assert_eq!(PublishResponse::Qos1(PubackPacket { packet_id: 1 }), receiver.try_recv().unwrap().unwrap());
    }

    #[test]
    fn qos0_publish_completes_on_write() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        let publish = PublishPacket::builder("fire/and/forget", QualityOfService::AtMostOnce).build();

        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let now = fixture.at(10);
        fixture.session.start_publish(publish, completion, &now);

        let mut receiver = handle.receiver;

        // not complete at submission, not complete at encode, complete at write completion
        assert!(receiver.try_recv().is_err());
        fixture.run_service(11).unwrap();
        assert!(receiver.try_recv().is_err());
        fixture.write_completion(12).unwrap();
        assert_eq!(PublishResponse::Qos0, receiver.try_recv().unwrap().unwrap());
    }

    #[test]
    fn operations_before_ready_fail_with_session_closed() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.open_connection(0).unwrap();

        let publish = PublishPacket::builder("a", QualityOfService::AtLeastOnce).build();
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let now = fixture.at(1);
        fixture.session.start_publish(publish, completion, &now);

        let mut receiver = handle.receiver;
        assert_matches!(receiver.try_recv().unwrap(), Err(BasaltError::SessionClosed(_)));
    }

    #[test]
    fn soft_disconnect_drains_then_terminates() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        let now = fixture.at(10);
        fixture.session.request_disconnect(&now);
        assert_eq!(SessionStateType::PendingDisconnect, fixture.session.state());

        let disconnect_bytes = fixture.run_service(11).unwrap();
        assert_eq!(vec![0xE0, 0x00], disconnect_bytes);

        let result = fixture.write_completion(12);
        assert_matches!(result, Err(BasaltError::UserInitiatedDisconnect(_)));

        let reason = fixture.session.shutdown(result.unwrap_err());
        assert_matches!(*reason, BasaltError::UserInitiatedDisconnect(_));

        // user-initiated teardown emits no error event
        let tags = fixture.event_tags();
        assert!(!tags.contains(&"error".to_string()));
        assert_eq!(Some(&"disconnect".to_string()), tags.last());
    }

    #[test]
    fn shutdown_aborts_in_flight_flows_with_session_closed() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        let publish = PublishPacket::builder("a/b", QualityOfService::ExactlyOnce).build();
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let now = fixture.at(10);
        fixture.session.start_publish(publish, completion, &now);

        fixture.session.shutdown(BasaltError::new_connection_closed("transport interrupted"));

        let mut receiver = handle.receiver;
        assert_matches!(receiver.try_recv().unwrap(), Err(BasaltError::SessionClosed(_)));
    }

    #[test]
    fn stop_flow_reports_presence() {
        let mut fixture = SessionTestFixture::new(standard_connect(), Duration::ZERO);
        fixture.establish();

        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let flow_id = handle.flow_id();
        let now = fixture.at(10);
        fixture.session.start_user_flow(flow_id, Box::new(PingFlow::new(Some(completion))), &now);

        assert!(fixture.session.stop_flow(flow_id, &now));
        assert!(!fixture.session.stop_flow(flow_id, &now));

        let mut receiver = handle.receiver;
        assert_matches!(receiver.try_recv().unwrap(), Err(BasaltError::FlowStopped(_)));
    }
}
