/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring an MQTT client.
 */

use crate::encode::{Encoder, PacketWriter};
use crate::mqtt::*;
use crate::reconnect::ReconnectStrategy;
use crate::transport::{TransportFactory, TransportStream};

use std::fmt;
use std::time::Duration;

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS: u16 = 60;

/// Configuration options that determine the field values of the CONNECT packet the client
/// sends on every connection attempt, including automatic reconnects.
pub struct ConnectOptions {

    pub(crate) client_id: String,

    pub(crate) clean_session: bool,

    pub(crate) keep_alive_seconds: u16,

    pub(crate) username: Option<String>,

    pub(crate) password: Option<Vec<u8>>,

    pub(crate) will: Option<LastWill>,
}

impl ConnectOptions {

    /// Creates a new builder for ConnectOptions.  A client id is always required; brokers
    /// may auto-assign one when an empty id is combined with a clean session.
    pub fn builder(client_id: &str) -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::new(client_id)
    }

    pub(crate) fn to_connect_packet(&self) -> ConnectPacket {
        ConnectPacket {
            keep_alive_seconds: self.keep_alive_seconds,
            clean_session: self.clean_session,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.clone(),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive_seconds", &self.keep_alive_seconds)
            .field("username", &self.username.as_ref().map(|_| "<...redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<...redacted>"))
            .field("will", &self.will)
            .finish()
    }
}

/// A builder for connection-related options on the client.
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder object for ConnectOptions
    pub fn new(client_id: &str) -> Self {
        ConnectOptionsBuilder {
            options: ConnectOptions {
                client_id: client_id.to_string(),
                clean_session: true,
                keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
                username: None,
                password: None,
                will: None,
            }
        }
    }

    /// Sets whether the broker should discard any existing session state for this client id
    /// on connect.  Defaults to true.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets the maximum time interval, in seconds, that is permitted to elapse between the
    /// point at which the client finishes transmitting one MQTT packet and the point it
    /// starts sending the next.  The client uses PINGREQ packets to maintain this property;
    /// zero disables keep-alive entirely.
    pub fn with_keep_alive_seconds(mut self, keep_alive_seconds: u16) -> Self {
        self.options.keep_alive_seconds = keep_alive_seconds;
        self
    }

    /// Sets a string value that the server may use for client authentication and
    /// authorization.
    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets opaque binary data that the server may use for client authentication and
    /// authorization.
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Sets the message the broker should publish on the client's behalf if the connection's
    /// session ends abnormally.
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.options.will = Some(will);
        self
    }

    /// Creates a new ConnectOptions object from what was configured on the builder.
    pub fn build(self) -> ConnectOptions {
        self.options
    }
}

/// Customization of automatic reconnect behavior beyond the shipped default.
pub struct ReconnectOptions {

    pub(crate) strategy: Option<Box<dyn ReconnectStrategy>>,

    pub(crate) max_reconnect_attempts: Option<u32>,

    pub(crate) reconnect_unready: bool,
}

impl ReconnectOptions {

    /// Creates a new builder for ReconnectOptions
    pub fn builder() -> ReconnectOptionsBuilder {
        ReconnectOptionsBuilder::new()
    }
}

/// Builder type for ReconnectOptions instances
pub struct ReconnectOptionsBuilder {
    options: ReconnectOptions
}

impl ReconnectOptionsBuilder {

    /// Creates a new builder object for ReconnectOptions
    pub fn new() -> Self {
        ReconnectOptionsBuilder {
            options: ReconnectOptions {
                strategy: None,
                max_reconnect_attempts: None,
                reconnect_unready: false,
            }
        }
    }

    /// Replaces the default fixed-delay strategy with a caller-supplied one
    pub fn with_strategy(mut self, strategy: Box<dyn ReconnectStrategy>) -> Self {
        self.options.strategy = Some(strategy);
        self
    }

    /// Bounds the number of reconnect attempts since the last successful CONNACK.  Only
    /// meaningful for the default strategy; a custom strategy enforces its own bound.
    pub fn with_max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.options.max_reconnect_attempts = Some(max_reconnect_attempts);
        self
    }

    /// Controls whether reconnection may continue indefinitely before the first successful
    /// CONNACK.  When false (the default), pre-CONNACK attempts are bounded by the maximum
    /// reconnect attempt count.
    pub fn with_reconnect_unready(mut self, reconnect_unready: bool) -> Self {
        self.options.reconnect_unready = reconnect_unready;
        self
    }

    /// Creates a new ReconnectOptions object from what was configured on the builder.
    pub fn build(self) -> ReconnectOptions {
        self.options
    }
}

impl Default for ReconnectOptionsBuilder {
    fn default() -> Self {
        ReconnectOptionsBuilder::new()
    }
}

/// How the client should behave when a session terminates without the user asking for it.
pub enum AutoReconnect {

    /// Never reconnect; every session termination is terminal.
    Disabled,

    /// Reconnect with the default strategy: up to 60 attempts at a fixed 1 second interval,
    /// refusing auth-class CONNACK rejections and user-initiated disconnects.
    Enabled,

    /// Reconnect with customized behavior.
    Custom(ReconnectOptions),
}

/// Static configuration for an MQTT client, immutable once construction finishes.
pub struct ClientConfig<T> where T: TransportStream {

    pub(crate) transport_factory: TransportFactory<T>,

    pub(crate) packet_writer: Box<dyn PacketWriter + Send>,

    pub(crate) auto_reconnect: AutoReconnect,

    pub(crate) connect_delay: Duration,
}

impl<T> ClientConfig<T> where T: TransportStream {

    /// Creates a new builder for a ClientConfig.  The transport factory is the only required
    /// configuration.
    pub fn builder(transport_factory: TransportFactory<T>) -> ClientConfigBuilder<T> {
        ClientConfigBuilder::new(transport_factory)
    }
}

/// Builder type for ClientConfig instances
pub struct ClientConfigBuilder<T> where T: TransportStream {
    config: ClientConfig<T>
}

impl<T> ClientConfigBuilder<T> where T: TransportStream {

    /// Creates a new builder object for a ClientConfig
    pub fn new(transport_factory: TransportFactory<T>) -> Self {
        ClientConfigBuilder {
            config: ClientConfig {
                transport_factory,
                packet_writer: Box::new(Encoder::new()),
                auto_reconnect: AutoReconnect::Enabled,
                connect_delay: Duration::ZERO,
            }
        }
    }

    /// Overrides the outbound packet serializer.  Primarily a test hook; the default encoder
    /// implements the MQTT 3.1.1 wire format exactly.
    pub fn with_packet_writer(mut self, packet_writer: Box<dyn PacketWriter + Send>) -> Self {
        self.config.packet_writer = packet_writer;
        self
    }

    /// Configures automatic reconnect behavior.  Defaults to the standard strategy.
    pub fn with_auto_reconnect(mut self, auto_reconnect: AutoReconnect) -> Self {
        self.config.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the CONNECT retry interval used while awaiting a CONNACK.  Zero (the default)
    /// disables CONNECT retries within a single transport attachment.
    pub fn with_connect_delay(mut self, connect_delay: Duration) -> Self {
        self.config.connect_delay = connect_delay;
        self
    }

    /// Creates a new ClientConfig object from what was configured on the builder.
    pub fn build(self) -> ClientConfig<T> {
        self.config
    }
}
