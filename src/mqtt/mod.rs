/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model the MQTT 3.1.1 specification.
 */

use std::fmt;

use crate::error::BasaltError;

pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod pingreq;
pub(crate) mod pingresp;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;
pub mod utils;

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT 3.1.1 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718099) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = BasaltError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

/// Server return code for connection attempts.
///
/// Enum values match [MQTT 3.1.1 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718035) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectReturnCode {

    /// Returned when the connection is accepted.
    #[default]
    Accepted = 0,

    /// Returned when the server does not support the protocol level requested by the client.
    UnacceptableProtocolVersion = 1,

    /// Returned when the client identifier is a valid UTF-8 string but is not allowed by the
    /// server.
    IdentifierRejected = 2,

    /// Returned when the network connection was accepted but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// Returned when the data in the username or password is malformed.
    BadUsernameOrPassword = 4,

    /// Returned when the client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {

    /// Returns whether or not the return code represents a successful connect
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = BasaltError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_connect_return_code(value)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => { write!(f, "Accepted") }
            ConnectReturnCode::UnacceptableProtocolVersion => { write!(f, "UnacceptableProtocolVersion") }
            ConnectReturnCode::IdentifierRejected => { write!(f, "IdentifierRejected") }
            ConnectReturnCode::ServerUnavailable => { write!(f, "ServerUnavailable") }
            ConnectReturnCode::BadUsernameOrPassword => { write!(f, "BadUsernameOrPassword") }
            ConnectReturnCode::NotAuthorized => { write!(f, "NotAuthorized") }
        }
    }
}

/// Return codes inside SUBACK packet payloads that specify the results for each subscription in
/// the associated SUBSCRIBE packet.
///
/// Enum values match [MQTT 3.1.1 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718071) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SubackReturnCode {

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 0.
    #[default]
    GrantedQos0 = 0,

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 1.
    GrantedQos1 = 1,

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 2.
    GrantedQos2 = 2,

    /// Returned when the subscription was not accepted.
    Failure = 128,
}

impl SubackReturnCode {

    /// Returns whether or not the return code represents a successful subscription
    pub fn is_success(&self) -> bool {
        !matches!(self, SubackReturnCode::Failure)
    }

    /// Returns the granted quality of service level, if the subscription succeeded
    pub fn granted_qos(&self) -> Option<QualityOfService> {
        match self {
            SubackReturnCode::GrantedQos0 => { Some(QualityOfService::AtMostOnce) }
            SubackReturnCode::GrantedQos1 => { Some(QualityOfService::AtLeastOnce) }
            SubackReturnCode::GrantedQos2 => { Some(QualityOfService::ExactlyOnce) }
            SubackReturnCode::Failure => { None }
        }
    }
}

impl TryFrom<u8> for SubackReturnCode {
    type Error = BasaltError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_suback_return_code(value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
/// An enum indicating the kind of MQTT packet
pub enum PacketType {

    /// A [CONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028) packet
    Connect,

    /// A [CONNACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033) packet
    Connack,

    /// A [PUBLISH](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037) packet
    Publish,

    /// A [PUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718043) packet
    Puback,

    /// A [PUBREC](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718048) packet
    Pubrec,

    /// A [PUBREL](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718053) packet
    Pubrel,

    /// A [PUBCOMP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718058) packet
    Pubcomp,

    /// A [SUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063) packet
    Subscribe,

    /// A [SUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718068) packet
    Suback,

    /// An [UNSUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718072) packet
    Unsubscribe,

    /// An [UNSUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718077) packet
    Unsuback,

    /// A [PINGREQ](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718081) packet
    Pingreq,

    /// A [PINGRESP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718085) packet
    Pingresp,

    /// A [DISCONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718090) packet
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}

/// Data model for the message a broker publishes on the client's behalf when the connection's
/// session ends abnormally.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LastWill {

    /// Topic the will message should be published to.
    pub(crate) topic: String,

    /// Payload of the will message.
    pub(crate) payload: Vec<u8>,

    /// Quality of service the broker should publish the will message with.
    pub(crate) qos: QualityOfService,

    /// Whether the will message should be retained by the broker.
    pub(crate) retain: bool,
}

impl LastWill {

    /// Creates a new builder for a LastWill
    pub fn builder(topic: &str) -> LastWillBuilder {
        LastWillBuilder::new(topic)
    }

    /// Returns the topic the will message should be published to
    pub fn topic(&self) -> &str { self.topic.as_str() }

    /// Returns the payload of the will message
    pub fn payload(&self) -> &[u8] { self.payload.as_slice() }

    /// Returns the quality of service the will message should be published with
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Returns whether the will message should be retained by the broker
    pub fn retain(&self) -> bool { self.retain }
}

/// Builder type for LastWill instances
pub struct LastWillBuilder {
    will: LastWill
}

impl LastWillBuilder {
    pub(crate) fn new(topic: &str) -> Self {
        LastWillBuilder {
            will: LastWill {
                topic: topic.to_string(),
                ..Default::default()
            }
        }
    }

    /// Sets the payload of the will message
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.will.payload = payload;
        self
    }

    /// Sets the quality of service the will message should be published with
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.will.qos = qos;
        self
    }

    /// Sets whether the will message should be retained by the broker
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.will.retain = retain;
        self
    }

    /// Builds a new LastWill.  Consumes the builder in the process.
    pub fn build(self) -> LastWill {
        self.will
    }
}

/// Specifies a single subscription within a Subscribe operation
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {
    pub(crate) topic_filter: String,
    pub(crate) qos: QualityOfService,
}

impl Subscription {

    /// Creates a new Subscription from a topic filter and a maximum quality of service
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
        }
    }

    /// Returns the topic filter to subscribe to
    pub fn topic_filter(&self) -> &str { self.topic_filter.as_str() }

    /// Returns the maximum QoS on which the subscriber will accept publish messages.  Granted QoS
    /// may be lower.
    pub fn qos(&self) -> QualityOfService { self.qos }
}

/// Data model of an [MQTT 3.1.1 CONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {

    /// The maximum time interval, in seconds, that is permitted to elapse between the point at
    /// which the client finishes transmitting one MQTT packet and the point it starts sending the
    /// next.  The client will use PINGREQ packets to maintain this property.
    pub(crate) keep_alive_seconds: u16,

    /// Whether the broker should discard any existing session state for this client id.
    pub(crate) clean_session: bool,

    /// A unique string identifying the client to the server.  Used to restore session state
    /// between connections.  An empty client id is only allowed together with a clean session.
    pub(crate) client_id: String,

    /// A string value that the server may use for client authentication and authorization.
    pub(crate) username: Option<String>,

    /// Opaque binary data that the server may use for client authentication and authorization.
    pub(crate) password: Option<Vec<u8>>,

    /// The definition of a message to be published when the connection's session is destroyed
    /// abnormally by the server.  If undefined, then nothing will be sent.
    pub(crate) will: Option<LastWill>,
}

/// Data model of an [MQTT 3.1.1 CONNACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {

    /// True if the client rejoined an existing session on the server, false otherwise.
    pub session_present: bool,

    /// Result value that indicates either success or the reason for failure for the
    /// connection attempt.
    pub return_code: ConnectReturnCode,
}

/// Data model of an [MQTT 3.1.1 PUBLISH](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet id used to correlate acknowledgements.  Zero when the quality of service is
    /// AtMostOnce; assigned by the flow multiplexer otherwise.
    pub(crate) packet_id: u16,

    /// The topic this message is published to.  May not contain wildcards.
    pub(crate) topic: String,

    /// The payload of the message.
    pub(crate) payload: Vec<u8>,

    /// The quality of service this message is delivered with.
    pub(crate) qos: QualityOfService,

    /// True if the broker should store this message and deliver it to future subscribers on
    /// matching topics.
    pub(crate) retain: bool,

    /// True if this packet is a redelivery of an earlier attempt.  Always false for QoS 0.
    pub(crate) duplicate: bool,
}

impl PublishPacket {

    /// Creates a new builder for a PublishPacket
    pub fn builder(topic: &str, qos: QualityOfService) -> PublishPacketBuilder {
        PublishPacketBuilder::new(topic, qos)
    }

    /// Returns the packet id bound to this publish, zero if unbound
    pub fn packet_id(&self) -> u16 { self.packet_id }

    /// Returns the topic this message is published to
    pub fn topic(&self) -> &str { self.topic.as_str() }

    /// Returns the payload of the message
    pub fn payload(&self) -> &[u8] { self.payload.as_slice() }

    /// Returns the quality of service this message is delivered with
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Returns whether the broker should retain this message
    pub fn retain(&self) -> bool { self.retain }

    /// Returns whether this packet is a redelivery
    pub fn duplicate(&self) -> bool { self.duplicate }
}

/// Builder type for PublishPacket instances
pub struct PublishPacketBuilder {
    packet: PublishPacket
}

impl PublishPacketBuilder {
    pub(crate) fn new(topic: &str, qos: QualityOfService) -> Self {
        PublishPacketBuilder {
            packet: PublishPacket {
                topic: topic.to_string(),
                qos,
                ..Default::default()
            }
        }
    }

    /// Sets the payload of the message
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.packet.payload = payload;
        self
    }

    /// Sets whether the broker should retain this message
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.packet.retain = retain;
        self
    }

    /// Sets whether this packet is flagged as a redelivery
    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.packet.duplicate = duplicate;
        self
    }

    /// Builds a new PublishPacket.  Consumes the builder in the process.
    pub fn build(self) -> PublishPacket {
        self.packet
    }
}

/// Data model of an [MQTT 3.1.1 PUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718043) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {

    /// Packet id of the QoS 1 publish this packet acknowledges.
    pub packet_id: u16,
}

/// Data model of an [MQTT 3.1.1 PUBREC](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718048) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {

    /// Packet id of the QoS 2 publish this packet acknowledges receipt of.
    pub packet_id: u16,
}

/// Data model of an [MQTT 3.1.1 PUBREL](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718053) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {

    /// Packet id of the QoS 2 delivery this packet releases.
    pub packet_id: u16,
}

/// Data model of an [MQTT 3.1.1 PUBCOMP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718058) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {

    /// Packet id of the QoS 2 delivery this packet completes.
    pub packet_id: u16,
}

/// Data model of an [MQTT 3.1.1 SUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {

    /// Packet id used to correlate the broker's SUBACK.  Assigned by the flow multiplexer.
    pub(crate) packet_id: u16,

    /// List of topic filter subscriptions the client wishes to establish.  Must not be empty.
    pub(crate) subscriptions: Vec<Subscription>,
}

/// Data model of an [MQTT 3.1.1 SUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718068) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {

    /// Packet id of the SUBSCRIBE this packet responds to.
    pub packet_id: u16,

    /// One return code per subscription in the associated SUBSCRIBE, in order.
    pub return_codes: Vec<SubackReturnCode>,
}

/// Data model of an [MQTT 3.1.1 UNSUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718072) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {

    /// Packet id used to correlate the broker's UNSUBACK.  Assigned by the flow multiplexer.
    pub(crate) packet_id: u16,

    /// List of topic filters the client wishes to unsubscribe from.  Must not be empty.
    pub(crate) topic_filters: Vec<String>,
}

/// Data model of an [MQTT 3.1.1 UNSUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718077) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {

    /// Packet id of the UNSUBSCRIBE this packet responds to.
    pub packet_id: u16,
}

/// Data model of an [MQTT 3.1.1 PINGREQ](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718081) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of an [MQTT 3.1.1 PINGRESP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718085) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of an [MQTT 3.1.1 DISCONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718090) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {}

/// Algebraic union of all MQTT 3.1.1 packet types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {

    /// A CONNECT packet
    Connect(ConnectPacket),

    /// A CONNACK packet
    Connack(ConnackPacket),

    /// A PUBLISH packet
    Publish(PublishPacket),

    /// A PUBACK packet
    Puback(PubackPacket),

    /// A PUBREC packet
    Pubrec(PubrecPacket),

    /// A PUBREL packet
    Pubrel(PubrelPacket),

    /// A PUBCOMP packet
    Pubcomp(PubcompPacket),

    /// A SUBSCRIBE packet
    Subscribe(SubscribePacket),

    /// A SUBACK packet
    Suback(SubackPacket),

    /// An UNSUBSCRIBE packet
    Unsubscribe(UnsubscribePacket),

    /// An UNSUBACK packet
    Unsuback(UnsubackPacket),

    /// A PINGREQ packet
    Pingreq(PingreqPacket),

    /// A PINGRESP packet
    Pingresp(PingrespPacket),

    /// A DISCONNECT packet
    Disconnect(DisconnectPacket),
}
