/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
This crate provides an asynchronous client engine for communicating with a message broker
using the MQTT 3.1.1 protocol.

The engine is transport-agnostic: it consumes any byte duplex implementing tokio's
`AsyncRead + AsyncWrite` through a factory, frames and deframes MQTT control packets over it,
multiplexes concurrent protocol exchanges (*flows*) on the single wire, delivers inbound
messages to topic-filtered listeners, keeps the connection alive with PINGREQ traffic, and
transparently recovers from transport loss through a pluggable reconnect strategy.

# Usage

To use this crate, you'll first need to add it to your project's Cargo.toml:

```toml
[dependencies]
basalt-mqtt = "0.2"
```

If your project does not include [`tokio`](https://crates.io/crates/tokio), you will need to
add it too:

```toml
[dependencies]
tokio = { version = "1", features = ["full"] }
```

# Example: Connect to a local Mosquitto server

Assuming a default Mosquitto installation, you can connect locally by plaintext on port 1883:

```no_run
use basalt_mqtt::client::Client;
use basalt_mqtt::config::{ClientConfig, ConnectOptions};
use basalt_mqtt::transport::TransportFactoryReturn;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    let factory = Box::new(|| -> TransportFactoryReturn<TcpStream> {
        Box::pin(async { TcpStream::connect("127.0.0.1:1883").await })
    });

    let config = ClientConfig::builder(factory).build();
    let client = Client::new(config, ConnectOptions::builder("example-client").build());

    // Resolves on the broker's CONNACK.  With reconnect enabled (the default), the client
    // keeps the connection alive from here until disconnect() is invoked.
    client.connect().await?;

    // <do stuff with the client>

    client.disconnect(false).await?;

    Ok(())
}
```

# Example: React to inbound messages

Listeners are registered on the client, not the connection, so they keep firing across
automatic reconnects:

```no_run
# use basalt_mqtt::client::Client;
# use std::sync::Arc;
# fn register(client: &Client) -> basalt_mqtt::error::BasaltResult<()> {
let handle = client.listen("sensors/+/temperature", Arc::new(|message| {
    println!("{}: {} bytes", message.topic, message.payload.len());
}))?;
# Ok(())
# }
```
*/

#![warn(missing_docs)]

pub mod client;
pub mod config;
mod decode;
mod encode;
pub mod error;
pub mod flow;
pub mod listener;
mod logging;
pub mod mqtt;
mod multiplexer;
pub mod reconnect;
mod runtime;
mod session;
pub mod transport;

/* Re-export the commonly used data model types at the root level */
pub use error::{BasaltError, BasaltResult};

pub use mqtt::ConnectReturnCode;
pub use mqtt::MqttPacket;
pub use mqtt::PacketType;
pub use mqtt::QualityOfService;
pub use mqtt::SubackReturnCode;
pub use mqtt::Subscription;
pub use mqtt::LastWill;

pub use mqtt::ConnackPacket;
pub use mqtt::ConnectPacket;
pub use mqtt::DisconnectPacket;
pub use mqtt::PingreqPacket;
pub use mqtt::PingrespPacket;
pub use mqtt::PubackPacket;
pub use mqtt::PubcompPacket;
pub use mqtt::PublishPacket;
pub use mqtt::PubrecPacket;
pub use mqtt::PubrelPacket;
pub use mqtt::SubackPacket;
pub use mqtt::SubscribePacket;
pub use mqtt::UnsubackPacket;
pub use mqtt::UnsubscribePacket;

pub use mqtt::utils::{
    is_valid_topic,
    is_valid_topic_filter,
    topic_filter_matches,
};

pub use encode::{Encoder, PacketWriter};

pub use flow::{Flow, FlowCompletion, FlowHandle, FlowStep, PublishResponse};

pub use listener::{ClientEvent, ListenerHandle, Message};
