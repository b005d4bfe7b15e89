/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the flow abstraction: a self-contained, multi-step protocol exchange that
produces packets to send, accepts the inbound packets that belong to it, and yields a final
value to an awaiter.
 */

use crate::error::{BasaltError, BasaltResult};
use crate::mqtt::*;

use log::*;
use tokio::sync::oneshot;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique flow id.  Flow ids are distinct from packet ids; a flow may or
/// may not hold a packet id, but always has a flow id.
pub(crate) fn next_flow_id() -> u64 {
    NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed)
}

/// The outcome of advancing a flow with an accepted packet: optionally a packet to write to
/// the wire, and whether the flow has reached its terminal state.
#[derive(Debug, Default)]
pub struct FlowStep {

    /// Packet the flow wants written to the transport, if any
    pub send: Option<MqttPacket>,

    /// True when the flow has completed and should be removed from the multiplexer
    pub done: bool,
}

impl FlowStep {

    /// A step that neither sends nor completes; the flow keeps waiting.
    pub fn pending() -> Self {
        FlowStep {
            ..Default::default()
        }
    }

    /// A step that emits a packet and keeps waiting.
    pub fn send(packet: MqttPacket) -> Self {
        FlowStep {
            send: Some(packet),
            done: false,
        }
    }

    /// A step that completes the flow without emitting anything.
    pub fn complete() -> Self {
        FlowStep {
            send: None,
            done: true,
        }
    }
}

/// One-shot channel used by a flow to deliver its typed result to whoever is awaiting it.
/// Dropping the completion without calling `complete` fails the awaiter with a channel error.
pub struct FlowCompletion<T> {
    sender: oneshot::Sender<BasaltResult<T>>
}

impl<T> FlowCompletion<T> {

    /// Creates a connected completion/handle pair for a flow with the given flow id
    pub fn new(flow_id: u64) -> (FlowCompletion<T>, FlowHandle<T>) {
        let (sender, receiver) = oneshot::channel();
        (
            FlowCompletion {
                sender
            },
            FlowHandle {
                flow_id,
                receiver
            }
        )
    }

    /// Delivers the flow's terminal value or error.  Receiver-side drops are not an error.
    pub fn complete(self, result: BasaltResult<T>) {
        let _ = self.sender.send(result);
    }
}

/// Awaiter-side handle to a running flow.  Holds the flow's process-unique id and resolves to
/// the flow's terminal value.
pub struct FlowHandle<T> {
    flow_id: u64,
    pub(crate) receiver: oneshot::Receiver<BasaltResult<T>>
}

impl<T> FlowHandle<T> {

    /// Returns the process-unique id of the underlying flow, usable with `stop_flow`
    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    /// Waits for the flow to reach its terminal state and returns the resulting value or error
    pub async fn recv(self) -> BasaltResult<T> {
        match self.receiver.await {
            Err(_) => { Err(BasaltError::new_operation_channel_failure("flow dropped without delivering a result")) }
            Ok(result) => { result }
        }
    }
}

/// A user-visible protocol exchange driven by the flow multiplexer.
///
/// A flow's life cycle: registration (packet id binding if requested, then `start`), zero or
/// more routed packets (`accept` filters, `next` advances), then completion (a `done` step),
/// failure (`fail`), or cancellation.  The multiplexer treats implementations as opaque; any
/// handshake expressible as accept/respond/possibly-loop fits.
pub trait Flow: Send + 'static {

    /// Returns true if this flow needs a packet id allocated before it starts
    fn needs_packet_id(&self) -> bool { false }

    /// Called once before `start` when `needs_packet_id` returned true
    fn bind_packet_id(&mut self, _packet_id: u16) {}

    /// Returns the initial packet to emit when the flow is registered.  May be None for flows
    /// that wait on an external event first.
    fn start(&mut self) -> Option<MqttPacket> { None }

    /// Decides whether an inbound packet belongs to this flow.  Must not mutate flow state.
    fn accept(&self, packet: &MqttPacket) -> bool;

    /// Advances the flow with a just-accepted packet.  Errors fail only this flow.
    fn next(&mut self, packet: MqttPacket) -> BasaltResult<FlowStep>;

    /// Delivers a terminal error to the flow's awaiter.  Invoked on session teardown,
    /// `stop_flow`, or an `Err` returned from `next`.
    fn fail(&mut self, error: BasaltError);
}

/// Union type that encapsulates the non-error ways a Publish operation can complete.
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {

    /// A QoS 0 publish was successfully written to the wire.  This does not mean the message
    /// actually reached the broker.
    Qos0,

    /// A QoS 1 publish completed via PUBACK receipt.
    Qos1(PubackPacket),

    /// A QoS 2 publish completed via PUBCOMP receipt.
    Qos2(PubcompPacket),
}

pub(crate) struct PublishQos1Flow {
    publish: PublishPacket,
    completion: Option<FlowCompletion<PublishResponse>>,
}

impl PublishQos1Flow {
    pub(crate) fn new(publish: PublishPacket, completion: FlowCompletion<PublishResponse>) -> Self {
        PublishQos1Flow {
            publish,
            completion: Some(completion),
        }
    }
}

impl Flow for PublishQos1Flow {
    fn needs_packet_id(&self) -> bool { true }

    fn bind_packet_id(&mut self, packet_id: u16) {
        debug!("PublishQos1Flow - binding to packet id {}", packet_id);
        self.publish.packet_id = packet_id;
    }

    fn start(&mut self) -> Option<MqttPacket> {
        Some(MqttPacket::Publish(self.publish.clone()))
    }

    fn accept(&self, packet: &MqttPacket) -> bool {
        if let MqttPacket::Puback(puback) = packet {
            return puback.packet_id == self.publish.packet_id;
        }

        false
    }

    fn next(&mut self, packet: MqttPacket) -> BasaltResult<FlowStep> {
        if let MqttPacket::Puback(puback) = packet {
            if let Some(completion) = self.completion.take() {
                completion.complete(Ok(PublishResponse::Qos1(puback)));
            }

            return Ok(FlowStep::complete());
        }

        Err(BasaltError::new_internal_state_error("qos 1 publish flow advanced with a packet it did not accept"))
    }

    fn fail(&mut self, error: BasaltError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum PublishQos2FlowState {
    AwaitingPubrec,
    AwaitingPubcomp,
}

pub(crate) struct PublishQos2Flow {
    publish: PublishPacket,
    state: PublishQos2FlowState,
    completion: Option<FlowCompletion<PublishResponse>>,
}

impl PublishQos2Flow {
    pub(crate) fn new(publish: PublishPacket, completion: FlowCompletion<PublishResponse>) -> Self {
        PublishQos2Flow {
            publish,
            state: PublishQos2FlowState::AwaitingPubrec,
            completion: Some(completion),
        }
    }
}

impl Flow for PublishQos2Flow {
    fn needs_packet_id(&self) -> bool { true }

    fn bind_packet_id(&mut self, packet_id: u16) {
        debug!("PublishQos2Flow - binding to packet id {}", packet_id);
        self.publish.packet_id = packet_id;
    }

    fn start(&mut self) -> Option<MqttPacket> {
        Some(MqttPacket::Publish(self.publish.clone()))
    }

    fn accept(&self, packet: &MqttPacket) -> bool {
        match (self.state, packet) {
            (PublishQos2FlowState::AwaitingPubrec, MqttPacket::Pubrec(pubrec)) => {
                pubrec.packet_id == self.publish.packet_id
            }
            (PublishQos2FlowState::AwaitingPubcomp, MqttPacket::Pubcomp(pubcomp)) => {
                pubcomp.packet_id == self.publish.packet_id
            }
            _ => { false }
        }
    }

    fn next(&mut self, packet: MqttPacket) -> BasaltResult<FlowStep> {
        match packet {
            MqttPacket::Pubrec(pubrec) => {
                self.state = PublishQos2FlowState::AwaitingPubcomp;
                Ok(FlowStep::send(MqttPacket::Pubrel(PubrelPacket {
                    packet_id: pubrec.packet_id,
                })))
            }
            MqttPacket::Pubcomp(pubcomp) => {
                if let Some(completion) = self.completion.take() {
                    completion.complete(Ok(PublishResponse::Qos2(pubcomp)));
                }

                Ok(FlowStep::complete())
            }
            _ => {
                Err(BasaltError::new_internal_state_error("qos 2 publish flow advanced with a packet it did not accept"))
            }
        }
    }

    fn fail(&mut self, error: BasaltError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }
}

pub(crate) struct SubscribeFlow {
    subscribe: SubscribePacket,
    completion: Option<FlowCompletion<SubackPacket>>,
}

impl SubscribeFlow {
    pub(crate) fn new(subscribe: SubscribePacket, completion: FlowCompletion<SubackPacket>) -> Self {
        SubscribeFlow {
            subscribe,
            completion: Some(completion),
        }
    }
}

impl Flow for SubscribeFlow {
    fn needs_packet_id(&self) -> bool { true }

    fn bind_packet_id(&mut self, packet_id: u16) {
        debug!("SubscribeFlow - binding to packet id {}", packet_id);
        self.subscribe.packet_id = packet_id;
    }

    fn start(&mut self) -> Option<MqttPacket> {
        Some(MqttPacket::Subscribe(self.subscribe.clone()))
    }

    fn accept(&self, packet: &MqttPacket) -> bool {
        if let MqttPacket::Suback(suback) = packet {
            return suback.packet_id == self.subscribe.packet_id;
        }

        false
    }

    fn next(&mut self, packet: MqttPacket) -> BasaltResult<FlowStep> {
        if let MqttPacket::Suback(suback) = packet {
            if suback.return_codes.len() != self.subscribe.subscriptions.len() {
                let message = "SubscribeFlow - suback return code count does not match subscription count";
                error!("{}", message);
                return Err(BasaltError::new_protocol_violation(message));
            }

            if let Some(completion) = self.completion.take() {
                completion.complete(Ok(suback));
            }

            return Ok(FlowStep::complete());
        }

        Err(BasaltError::new_internal_state_error("subscribe flow advanced with a packet it did not accept"))
    }

    fn fail(&mut self, error: BasaltError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }
}

pub(crate) struct UnsubscribeFlow {
    unsubscribe: UnsubscribePacket,
    completion: Option<FlowCompletion<UnsubackPacket>>,
}

impl UnsubscribeFlow {
    pub(crate) fn new(unsubscribe: UnsubscribePacket, completion: FlowCompletion<UnsubackPacket>) -> Self {
        UnsubscribeFlow {
            unsubscribe,
            completion: Some(completion),
        }
    }
}

impl Flow for UnsubscribeFlow {
    fn needs_packet_id(&self) -> bool { true }

    fn bind_packet_id(&mut self, packet_id: u16) {
        debug!("UnsubscribeFlow - binding to packet id {}", packet_id);
        self.unsubscribe.packet_id = packet_id;
    }

    fn start(&mut self) -> Option<MqttPacket> {
        Some(MqttPacket::Unsubscribe(self.unsubscribe.clone()))
    }

    fn accept(&self, packet: &MqttPacket) -> bool {
        if let MqttPacket::Unsuback(unsuback) = packet {
            return unsuback.packet_id == self.unsubscribe.packet_id;
        }

        false
    }

    fn next(&mut self, packet: MqttPacket) -> BasaltResult<FlowStep> {
        if let MqttPacket::Unsuback(unsuback) = packet {
            if let Some(completion) = self.completion.take() {
                completion.complete(Ok(unsuback));
            }

            return Ok(FlowStep::complete());
        }

        Err(BasaltError::new_internal_state_error("unsubscribe flow advanced with a packet it did not accept"))
    }

    fn fail(&mut self, error: BasaltError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }
}

/// Keep-alive exchange: emits a PINGREQ and completes on the next PINGRESP.  Pingresps are not
/// id-correlated, so insertion order decides which ping flow an inbound pingresp resolves when
/// several are outstanding.
pub(crate) struct PingFlow {
    completion: Option<FlowCompletion<()>>,
}

impl PingFlow {
    pub(crate) fn new(completion: Option<FlowCompletion<()>>) -> Self {
        PingFlow {
            completion,
        }
    }
}

impl Flow for PingFlow {
    fn start(&mut self) -> Option<MqttPacket> {
        Some(MqttPacket::Pingreq(PingreqPacket {}))
    }

    fn accept(&self, packet: &MqttPacket) -> bool {
        matches!(packet, MqttPacket::Pingresp(_))
    }

    fn next(&mut self, _: MqttPacket) -> BasaltResult<FlowStep> {
        if let Some(completion) = self.completion.take() {
            completion.complete(Ok(()));
        }

        Ok(FlowStep::complete())
    }

    fn fail(&mut self, error: BasaltError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use assert_matches::assert_matches;

    fn create_qos1_publish() -> PublishPacket {
        PublishPacket::builder("telemetry/cpu", QualityOfService::AtLeastOnce)
            .with_payload(vec![1, 2, 3])
            .build()
    }

    #[test]
    fn publish_qos1_flow_happy_path() {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let mut flow = PublishQos1Flow::new(create_qos1_publish(), completion);

        assert!(flow.needs_packet_id());
        flow.bind_packet_id(12);

        let start_packet = flow.start().unwrap();
        if let MqttPacket::Publish(publish) = &start_packet {
            assert_eq!(12, publish.packet_id);
        } else {
            panic!("publish flow should start with a publish packet");
        }

        assert!(!flow.accept(&MqttPacket::Puback(PubackPacket { packet_id: 13 })));
        assert!(!flow.accept(&MqttPacket::Pubcomp(PubcompPacket { packet_id: 12 })));
        assert!(flow.accept(&MqttPacket::Puback(PubackPacket { packet_id: 12 })));

        let step = flow.next(MqttPacket::Puback(PubackPacket { packet_id: 12 })).unwrap();
        assert!(step.done);
        assert!(step.send.is_none());

        let mut receiver = handle.receiver;
        assert_eq!(PublishResponse::Qos1(PubackPacket { packet_id: 12 }), receiver.try_recv().unwrap().unwrap());
    }

    #[test]
    fn publish_qos2_flow_happy_path() {
        let publish = PublishPacket::builder("telemetry/cpu", QualityOfService::ExactlyOnce).build();
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let mut flow = PublishQos2Flow::new(publish, completion);

        flow.bind_packet_id(7);
        assert!(flow.start().is_some());

        assert!(flow.accept(&MqttPacket::Pubrec(PubrecPacket { packet_id: 7 })));
        assert!(!flow.accept(&MqttPacket::Pubcomp(PubcompPacket { packet_id: 7 })));

        let step = flow.next(MqttPacket::Pubrec(PubrecPacket { packet_id: 7 })).unwrap();
        assert!(!step.done);
        assert_eq!(Some(MqttPacket::Pubrel(PubrelPacket { packet_id: 7 })), step.send);

        // after the pubrel is emitted, only the pubcomp is acceptable
        assert!(!flow.accept(&MqttPacket::Pubrec(PubrecPacket { packet_id: 7 })));
        assert!(flow.accept(&MqttPacket::Pubcomp(PubcompPacket { packet_id: 7 })));

        let step = flow.next(MqttPacket::Pubcomp(PubcompPacket { packet_id: 7 })).unwrap();
        assert!(step.done);

        let mut receiver = handle.receiver;
        assert_eq!(PublishResponse::Qos2(PubcompPacket { packet_id: 7 }), receiver.try_recv().unwrap().unwrap());
    }

    #[test]
    fn subscribe_flow_happy_path() {
        let subscribe = SubscribePacket {
            subscriptions: vec![Subscription::new("a/b", QualityOfService::AtLeastOnce)],
            ..Default::default()
        };

        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let mut flow = SubscribeFlow::new(subscribe, completion);
        flow.bind_packet_id(3);

        let suback = SubackPacket {
            packet_id: 3,
            return_codes: vec![SubackReturnCode::GrantedQos1],
        };

        assert!(flow.accept(&MqttPacket::Suback(suback.clone())));
        let step = flow.next(MqttPacket::Suback(suback.clone())).unwrap();
        assert!(step.done);

        let mut receiver = handle.receiver;
        assert_eq!(suback, receiver.try_recv().unwrap().unwrap());
    }

    #[test]
    fn subscribe_flow_return_code_count_mismatch() {
        let subscribe = SubscribePacket {
            subscriptions: vec![
                Subscription::new("a/b", QualityOfService::AtLeastOnce),
                Subscription::new("c/d", QualityOfService::AtMostOnce),
            ],
            ..Default::default()
        };

        let (completion, _handle) = FlowCompletion::new(next_flow_id());
        let mut flow = SubscribeFlow::new(subscribe, completion);
        flow.bind_packet_id(3);

        let suback = SubackPacket {
            packet_id: 3,
            return_codes: vec![SubackReturnCode::GrantedQos1],
        };

        assert_matches!(flow.next(MqttPacket::Suback(suback)), Err(BasaltError::ProtocolViolation(_)));
    }

    #[test]
    fn ping_flow_happy_path() {
        let mut flow = PingFlow::new(None);

        assert!(!flow.needs_packet_id());
        assert_eq!(Some(MqttPacket::Pingreq(PingreqPacket {})), flow.start());
        assert!(flow.accept(&MqttPacket::Pingresp(PingrespPacket {})));
        assert!(!flow.accept(&MqttPacket::Puback(PubackPacket { packet_id: 1 })));

        let step = flow.next(MqttPacket::Pingresp(PingrespPacket {})).unwrap();
        assert!(step.done);
    }

    #[test]
    fn flow_fail_delivers_error_to_awaiter() {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        let mut flow = PublishQos1Flow::new(create_qos1_publish(), completion);

        flow.fail(BasaltError::new_session_closed());

        let mut receiver = handle.receiver;
        assert_matches!(receiver.try_recv().unwrap(), Err(BasaltError::SessionClosed(_)));
    }

    #[test]
    fn flow_ids_are_process_unique() {
        let first = next_flow_id();
        let second = next_flow_id();
        assert!(second > first);
    }
}
