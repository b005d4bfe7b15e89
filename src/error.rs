/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReturnCode, PacketType};

use std::error::Error;
use std::fmt;

/// Additional details about a MalformedPacket error variant
#[derive(Debug)]
pub struct MalformedPacketContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an UnexpectedPacket error variant
#[derive(Debug)]
pub struct UnexpectedPacketContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProtocolViolation error variant
#[derive(Debug)]
pub struct ProtocolViolationContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionRejected error variant
#[derive(Debug)]
pub struct ConnectionRejectedContext {

    /// CONNACK return code that triggered the rejection
    pub status: ConnectReturnCode,
}

/// Additional details about a FlowStopped error variant
#[derive(Debug)]
pub struct FlowStoppedContext {
}

/// Additional details about a SessionClosed error variant
#[derive(Debug)]
pub struct SessionClosedContext {
}

/// Additional details about a PacketIdSpaceExhausted error variant
#[derive(Debug)]
pub struct PacketIdSpaceExhaustedContext {
}

/// Additional details about an InvalidConnect error variant
#[derive(Debug)]
pub struct InvalidConnectContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an EncodingFailure error variant
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PacketValidation error variant
#[derive(Debug)]
pub struct PacketValidationContext {

    /// type of packet that failed validation
    pub packet_type: PacketType,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {

    /// true if the disconnect bypassed the DISCONNECT packet and write drain
    pub forced: bool,
}

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug)]
pub struct OperationChannelFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire basalt-mqtt crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum BasaltError {

    /// Error emitted when an inbound packet's encoding could not be parsed.  Examples include
    /// bad header flags, an unknown packet type nibble, and mismatches between remaining length
    /// fields and overall packet length.
    MalformedPacket(MalformedPacketContext),

    /// Error emitted when a successfully parsed packet is illegal in the session's current
    /// state.  The canonical case is any non-CONNACK packet arriving while the client is
    /// awaiting a CONNACK.
    UnexpectedPacket(UnexpectedPacketContext),

    /// Error emitted when the peer violates MQTT rules that parsing alone cannot catch
    /// (a DUP flag on a QoS 0 publish, a server-sent DISCONNECT, etc...).
    ProtocolViolation(ProtocolViolationContext),

    /// Error emitted when the broker explicitly rejects a connection attempt by responding to
    /// the client's CONNECT with a CONNACK containing a non-zero return code.
    ConnectionRejected(ConnectionRejectedContext),

    /// Error applied to a flow cancelled through `stop_flow`.  Does not affect any other flow.
    FlowStopped(FlowStoppedContext),

    /// Error applied to every in-flight flow when the owning session terminates.
    SessionClosed(SessionClosedContext),

    /// Error indicating no more packet ids are available for outbound flows.  Requires 65535
    /// concurrently incomplete id-bearing flows.
    PacketIdSpaceExhausted(PacketIdSpaceExhaustedContext),

    /// Error emitted when a CONNECT packet fails pre-encode validation.  The canonical case is
    /// an empty client id together with `clean_session` false.
    InvalidConnect(InvalidConnectContext),

    /// Error encountered while attempting to encode an outbound MQTT packet.
    EncodingFailure(EncodingFailureContext),

    /// Error emitted when a packet is submitted that violates the MQTT specification.
    PacketValidation(PacketValidationContext),

    /// Generic error wrapping an underlying transport I/O failure.
    TransportError(TransportErrorContext),

    /// Error emitted when a successfully established connection subsequently gets closed for
    /// some external reason.  This general error may be superseded by a more specific error
    /// (user initiated disconnect) under certain conditions.
    ConnectionClosed(ConnectionClosedContext),

    /// Error emitted after the client shuts a connection down due to user action.  Does not
    /// indicate an actual failure, but reconnect strategies must be able to see it.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// Failure encountered while using the client's operation channel.  This usually means the
    /// client event loop has been dropped.
    OperationChannelFailure(OperationChannelFailureContext),

    /// Error emitted by the client when something happens that should never happen.  Always
    /// indicates a bug in the client.
    InternalStateError(InternalStateErrorContext),
}

impl BasaltError {

    pub(crate) fn new_malformed_packet(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::MalformedPacket(
            MalformedPacketContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_unexpected_packet(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::UnexpectedPacket(
            UnexpectedPacketContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_violation(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::ProtocolViolation(
            ProtocolViolationContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_rejected(status: ConnectReturnCode) -> Self {
        BasaltError::ConnectionRejected(
            ConnectionRejectedContext {
                status
            }
        )
    }

    pub(crate) fn new_flow_stopped() -> Self {
        BasaltError::FlowStopped(
            FlowStoppedContext {
            }
        )
    }

    pub(crate) fn new_session_closed() -> Self {
        BasaltError::SessionClosed(
            SessionClosedContext {
            }
        )
    }

    pub(crate) fn new_packet_id_space_exhausted() -> Self {
        BasaltError::PacketIdSpaceExhausted(
            PacketIdSpaceExhaustedContext {
            }
        )
    }

    pub(crate) fn new_invalid_connect(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::InvalidConnect(
            InvalidConnectContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_encoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::EncodingFailure(
            EncodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::PacketValidation(
            PacketValidationContext {
                packet_type,
                source : source.into()
            }
        )
    }

    /// Constructs a TransportError variant from an existing error.  Typically this should be a
    /// std::io::Error surfaced by the transport in use.
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_user_initiated_disconnect(forced: bool) -> Self {
        BasaltError::UserInitiatedDisconnect(
            UserInitiatedDisconnectContext {
                forced
            }
        )
    }

    pub(crate) fn new_operation_channel_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        BasaltError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    /// Returns the CONNACK return code when this error is a broker connection rejection.
    pub fn connect_status(&self) -> Option<ConnectReturnCode> {
        if let BasaltError::ConnectionRejected(context) = self {
            return Some(context.status);
        }

        None
    }

    /// Constructs a fresh error of the same kind as this one.  Used when a single failure has
    /// to be delivered to several independent awaiters; pattern-matchable kind is preserved,
    /// the source chain is flattened to a message.
    pub(crate) fn clone_kind(&self) -> BasaltError {
        match self {
            BasaltError::MalformedPacket(_) => { BasaltError::new_malformed_packet(format!("{}", self)) }
            BasaltError::UnexpectedPacket(_) => { BasaltError::new_unexpected_packet(format!("{}", self)) }
            BasaltError::ProtocolViolation(_) => { BasaltError::new_protocol_violation(format!("{}", self)) }
            BasaltError::ConnectionRejected(context) => { BasaltError::new_connection_rejected(context.status) }
            BasaltError::FlowStopped(_) => { BasaltError::new_flow_stopped() }
            BasaltError::SessionClosed(_) => { BasaltError::new_session_closed() }
            BasaltError::PacketIdSpaceExhausted(_) => { BasaltError::new_packet_id_space_exhausted() }
            BasaltError::InvalidConnect(_) => { BasaltError::new_invalid_connect(format!("{}", self)) }
            BasaltError::EncodingFailure(_) => { BasaltError::new_encoding_failure(format!("{}", self)) }
            BasaltError::PacketValidation(context) => { BasaltError::new_packet_validation(context.packet_type, format!("{}", self)) }
            BasaltError::TransportError(_) => { BasaltError::new_transport_error(format!("{}", self)) }
            BasaltError::ConnectionClosed(_) => { BasaltError::new_connection_closed(format!("{}", self)) }
            BasaltError::UserInitiatedDisconnect(context) => { BasaltError::new_user_initiated_disconnect(context.forced) }
            BasaltError::OperationChannelFailure(_) => { BasaltError::new_operation_channel_failure(format!("{}", self)) }
            BasaltError::InternalStateError(_) => { BasaltError::new_internal_state_error(format!("{}", self)) }
        }
    }
}

impl Error for BasaltError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BasaltError::MalformedPacket(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::UnexpectedPacket(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::ProtocolViolation(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::InvalidConnect(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::EncodingFailure(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::PacketValidation(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::OperationChannelFailure(context) => {
                Some(context.source.as_ref())
            }
            BasaltError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for BasaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasaltError::MalformedPacket(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            BasaltError::UnexpectedPacket(_) => {
                write!(f, "a decoded packet is not legal in the session's current state")
            }
            BasaltError::ProtocolViolation(_) => {
                write!(f, "broker behavior disallowed by the mqtt spec")
            }
            BasaltError::ConnectionRejected(context) => {
                write!(f, "the broker rejected the connect packet with return code {}", context.status)
            }
            BasaltError::FlowStopped(_) => {
                write!(f, "the flow was cancelled by a stop_flow invocation")
            }
            BasaltError::SessionClosed(_) => {
                write!(f, "the flow was aborted because the owning session terminated")
            }
            BasaltError::PacketIdSpaceExhausted(_) => {
                write!(f, "no unused packet ids remain for outbound flows")
            }
            BasaltError::InvalidConnect(_) => {
                write!(f, "the connect packet failed pre-encode validation")
            }
            BasaltError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            BasaltError::PacketValidation(context) => {
                write!(f, "{} contains a property that violates the mqtt spec", context.packet_type)
            }
            BasaltError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            BasaltError::ConnectionClosed(_) => {
                write!(f, "client connection was closed; source contains further details")
            }
            BasaltError::UserInitiatedDisconnect(context) => {
                if context.forced {
                    write!(f, "connection was shut down by user action (forced)")
                } else {
                    write!(f, "connection was shut down by user action (soft)")
                }
            }
            BasaltError::OperationChannelFailure(_) => {
                write!(f, "failure encountered while sending/receiving on an MQTT operation-related channel")
            }
            BasaltError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
        }
    }
}

impl From<std::io::Error> for BasaltError {
    fn from(error: std::io::Error) -> Self {
        BasaltError::new_transport_error(error)
    }
}

impl From<core::str::Utf8Error> for BasaltError {
    fn from(err: core::str::Utf8Error) -> Self {
        BasaltError::new_malformed_packet(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type BasaltResult<T> = Result<T, BasaltError>;
