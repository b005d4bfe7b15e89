/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the topic-filtered listener registry and the client lifecycle event bus.
Listener registrations are owned by the client, not the session, and therefore survive
reconnects.
 */

use crate::error::BasaltError;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

use std::fmt;
use std::sync::Arc;

/// An inbound application message, as delivered to topic listeners and `Message` events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {

    /// Topic the message was published to
    pub topic: String,

    /// Payload of the message
    pub payload: Vec<u8>,

    /// Quality of service level the message was delivered with
    pub qos: QualityOfService,

    /// True if the message was sent in response to a retained-message request rather than a
    /// live publish
    pub retained: bool,

    /// True if the broker flagged the delivery as a redelivery
    pub duplicate: bool,
}

impl Message {
    pub(crate) fn from_publish(publish: &PublishPacket) -> Self {
        Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.duplicate,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message {{ topic:\"{}\" payload:<{} Bytes> qos:{} retained:{} duplicate:{} }}",
            self.topic, self.payload.len(), quality_of_service_to_str(self.qos), self.retained, self.duplicate)
    }
}

/// Callback function to be invoked with every message matching a listener's topic filter
pub type MessageListenerCallback = dyn Fn(Arc<Message>) + Send + Sync;

/// Opaque structure that represents the identity of a listener registration.  Returned by
/// adding a listener and used to remove that same listener if needed.
#[derive(Debug, Eq, PartialEq)]
pub struct ListenerHandle {
    pub(crate) id: u64
}

struct ListenerEntry {
    id: u64,
    topic_filter: String,
    callback: Arc<MessageListenerCallback>,
}

/// Registration-ordered list of `(topic filter, callback)` entries.  Mutated only by
/// `listen`/`remove_listener` on the client; the session engine only reads it.
pub(crate) struct ListenerRegistry {
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        ListenerRegistry {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, topic_filter: &str, callback: Arc<MessageListenerCallback>) -> ListenerHandle {
        let id = self.next_id;
        self.next_id += 1;

        debug!("ListenerRegistry - adding listener {} on filter \"{}\"", id, topic_filter);
        self.entries.push(ListenerEntry {
            id,
            topic_filter: topic_filter.to_string(),
            callback,
        });

        ListenerHandle { id }
    }

    pub(crate) fn remove(&mut self, handle: &ListenerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != handle.id);

        let removed = self.entries.len() != before;
        if removed {
            debug!("ListenerRegistry - removed listener {}", handle.id);
        }

        removed
    }

    /// Returns the callbacks of every listener whose filter matches `topic`, in registration
    /// order.  Collected first so that invocation happens outside any registry lock.
    pub(crate) fn matching_callbacks(&self, topic: &str) -> Vec<Arc<MessageListenerCallback>> {
        self.entries.iter()
            .filter(|entry| topic_filter_matches(entry.topic_filter.as_str(), topic))
            .map(|entry| entry.callback.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An event emitted by the client after successfully performing a Connect <-> Connack
/// handshake with the broker over a new network connection.
#[derive(Debug)]
pub struct ConnectionSuccessEvent {

    /// CONNACK packet sent by the broker as the final step of connection establishment
    pub connack: ConnackPacket,
}

impl fmt::Display for ConnectionSuccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionSuccessEvent {{ {} }}", self.connack)
    }
}

/// An event emitted by the client when a session reaches its terminal disconnected state,
/// for any reason.
#[derive(Debug)]
pub struct DisconnectionEvent {

    /// Why the session ended.  User-initiated disconnects carry the corresponding marker
    /// error rather than a failure.
    pub error: Arc<BasaltError>,
}

impl fmt::Display for DisconnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DisconnectionEvent {{ {} }}", self.error)
    }
}

/// An event emitted by the client whenever a session fails.  Always followed by a
/// DisconnectionEvent for the same session.
#[derive(Debug)]
pub struct ErrorEvent {

    /// The failure that terminated the session
    pub error: Arc<BasaltError>,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorEvent {{ {} }}", self.error)
    }
}

/// An event emitted by the client whenever an inbound PUBLISH is delivered to the
/// application.
#[derive(Debug)]
pub struct MessageEvent {

    /// Message that was received from the broker.  The appropriate acknowledgement is always
    /// produced by the session engine before this event is emitted.
    pub message: Arc<Message>,
}

impl fmt::Display for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageEvent {{ {} }}", self.message)
    }
}

/// An event emitted by the client for every successfully decoded inbound packet, before any
/// routing decisions are made.  Lets observers watch for individual packet types.
#[derive(Debug)]
pub struct PacketReceivedEvent {

    /// The decoded packet
    pub packet: MqttPacket,
}

impl fmt::Display for PacketReceivedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketReceivedEvent {{ {} }}", self.packet)
    }
}

/// Union of all the different events emitted by the client.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientEvent {

    /// Emitted after every successful Connect <-> Connack handshake.
    Connect(ConnectionSuccessEvent),

    /// Emitted when a session reaches its terminal disconnected state.
    Disconnect(DisconnectionEvent),

    /// Emitted when a session fails; always followed by the session's Disconnect event.
    Error(ErrorEvent),

    /// Emitted when an inbound PUBLISH is delivered to the application.
    Message(MessageEvent),

    /// Emitted for every successfully decoded inbound packet.
    PacketReceived(PacketReceivedEvent),
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Connect(event) => { write!(f, "{}", event) }
            ClientEvent::Disconnect(event) => { write!(f, "{}", event) }
            ClientEvent::Error(event) => { write!(f, "{}", event) }
            ClientEvent::Message(event) => { write!(f, "{}", event) }
            ClientEvent::PacketReceived(event) => { write!(f, "{}", event) }
        }
    }
}

/// Callback function to be invoked with every emitted client event
pub type ClientEventListenerCallback = dyn Fn(Arc<ClientEvent>) + Send + Sync;

/// Synchronous observer list for lifecycle events.  Emission happens inline with the state
/// transition that caused the event; observers see events in exactly the order the
/// transitions occurred.
pub(crate) struct EventDispatcher {
    next_id: u64,
    entries: Vec<(u64, Arc<ClientEventListenerCallback>)>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        EventDispatcher {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, callback: Arc<ClientEventListenerCallback>) -> ListenerHandle {
        let id = self.next_id;
        self.next_id += 1;

        self.entries.push((id, callback));

        ListenerHandle { id }
    }

    pub(crate) fn remove(&mut self, handle: &ListenerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != handle.id);

        self.entries.len() != before
    }

    pub(crate) fn callbacks(&self) -> Vec<Arc<ClientEventListenerCallback>> {
        self.entries.iter().map(|(_, callback)| callback.clone()).collect()
    }
}
