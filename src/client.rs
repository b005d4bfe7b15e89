/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public MQTT client and associated types necessary to invoke operations
on it.
 */

use crate::config::*;
use crate::error::{BasaltError, BasaltResult};
use crate::flow::*;
use crate::listener::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::runtime::*;
use crate::transport::TransportStream;

use tokio::sync::mpsc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) enum OperationOptions {
    Connect(FlowCompletion<ConnackPacket>),
    Disconnect {
        force: bool,
        completion: FlowCompletion<()>,
    },
    Publish(PublishPacket, FlowCompletion<PublishResponse>),
    Subscribe(Vec<Subscription>, FlowCompletion<SubackPacket>),
    Unsubscribe(Vec<String>, FlowCompletion<UnsubackPacket>),
    StartFlow(u64, Box<dyn Flow>),
    StopFlow(u64, FlowCompletion<bool>),
}

/// A network client that functions as a thin wrapper over the MQTT 3.1.1 protocol.
///
/// All protocol state lives on a single event-loop task spawned at construction; the handle
/// only submits operations over a channel and shares the listener registry.  There are no
/// mutable functions in the client API, so it can be shared across tasks by wrapping a
/// newly-constructed client in an Arc.
///
/// A client is created idle.  `connect` drives it toward a CONNACK; from then on, depending
/// on the configured reconnect behavior, it maintains the connection until a `disconnect`
/// call or a terminal reconnect refusal parks it again.
pub struct Client {
    operation_sender: mpsc::UnboundedSender<OperationOptions>,
    listeners: Arc<Mutex<ListenerRegistry>>,
    events: Arc<Mutex<EventDispatcher>>,
    ready: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl Client {

    /// Creates a new client from static configuration and connect options.  Must be invoked
    /// from within a tokio runtime; the client's event loop is spawned onto it immediately.
    pub fn new<T>(config: ClientConfig<T>, connect_options: ConnectOptions) -> Client where T: TransportStream {
        let (operation_sender, operation_receiver) = mpsc::unbounded_channel();

        let listeners = Arc::new(Mutex::new(ListenerRegistry::new()));
        let events = Arc::new(Mutex::new(EventDispatcher::new()));
        let ready = Arc::new(AtomicBool::new(false));
        let disconnected = Arc::new(AtomicBool::new(true));

        let runtime = ClientRuntime::new(
            config,
            connect_options,
            listeners.clone(),
            events.clone(),
            ready.clone(),
            disconnected.clone(),
            operation_receiver,
        );

        tokio::spawn(client_event_loop(runtime));

        Client {
            operation_sender,
            listeners,
            events,
            ready,
            disconnected,
        }
    }

    fn submit(&self, operation: OperationOptions) -> BasaltResult<()> {
        if self.operation_sender.send(operation).is_err() {
            return Err(BasaltError::new_operation_channel_failure("client event loop has shut down"));
        }

        Ok(())
    }

    /// Initiates a connection attempt, resolving on the first CONNACK or the first terminal
    /// error observed.  Automatic reconnection (if configured) continues in the background
    /// independent of this future's resolution.
    pub async fn connect(&self) -> BasaltResult<ConnackPacket> {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        self.submit(OperationOptions::Connect(completion))?;

        handle.recv().await
    }

    /// Shuts the client down, resolving once the terminal disconnected state is reached.
    ///
    /// A forced disconnect abandons every pending flow and closes the transport immediately;
    /// a soft disconnect writes a DISCONNECT packet and lets outstanding writes drain first.
    /// Neither form triggers automatic reconnection.
    pub async fn disconnect(&self, force: bool) -> BasaltResult<()> {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        self.submit(OperationOptions::Disconnect {
            force,
            completion,
        })?;

        handle.recv().await
    }

    /// Publishes a message.  QoS 0 publishes resolve when the bytes reach the transport,
    /// QoS 1 on PUBACK, QoS 2 on PUBCOMP.
    pub async fn publish(&self, publish: PublishPacket) -> BasaltResult<PublishResponse> {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        self.submit(OperationOptions::Publish(publish, completion))?;

        handle.recv().await
    }

    /// Subscribes to one or more topic filters, resolving with the broker's SUBACK.  The
    /// granted QoS (or failure) for each filter is in the return code list, in order.
    pub async fn subscribe(&self, subscriptions: Vec<Subscription>) -> BasaltResult<SubackPacket> {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        self.submit(OperationOptions::Subscribe(subscriptions, completion))?;

        handle.recv().await
    }

    /// Unsubscribes from one or more topic filters, resolving on UNSUBACK.
    pub async fn unsubscribe(&self, topic_filters: Vec<String>) -> BasaltResult<UnsubackPacket> {
        let (completion, handle) = FlowCompletion::new(next_flow_id());
        self.submit(OperationOptions::Unsubscribe(topic_filters, completion))?;

        handle.recv().await
    }

    /// Registers a callback for inbound messages matching a topic filter.  Registrations are
    /// owned by the client and keep working across automatic reconnects.
    pub fn listen(&self, topic_filter: &str, callback: Arc<MessageListenerCallback>) -> BasaltResult<ListenerHandle> {
        if !is_valid_topic_filter(topic_filter) {
            return Err(BasaltError::new_packet_validation(PacketType::Subscribe, "listen requires a valid topic filter"));
        }

        Ok(self.listeners.lock().unwrap().add(topic_filter, callback))
    }

    /// Removes a previously registered message listener.  Returns whether the listener was
    /// still registered.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        self.listeners.lock().unwrap().remove(handle)
    }

    /// Registers a callback for lifecycle events (connect, disconnect, message, error, and
    /// per-packet receipt).
    pub fn add_event_listener(&self, callback: Arc<ClientEventListenerCallback>) -> ListenerHandle {
        self.events.lock().unwrap().add(callback)
    }

    /// Removes a previously registered event listener
    pub fn remove_event_listener(&self, handle: &ListenerHandle) -> bool {
        self.events.lock().unwrap().remove(handle)
    }

    /// Starts a user-defined protocol flow on the current session.  The factory receives the
    /// completion the flow must eventually resolve; the returned handle carries the flow id
    /// and the flow's eventual value.
    pub fn start_flow<R, F>(&self, factory: F) -> BasaltResult<FlowHandle<R>>
        where R: Send + 'static, F: FnOnce(FlowCompletion<R>) -> Box<dyn Flow> {

        let flow_id = next_flow_id();
        let (completion, handle) = FlowCompletion::new(flow_id);
        let flow = factory(completion);

        self.submit(OperationOptions::StartFlow(flow_id, flow))?;

        Ok(handle)
    }

    /// Cancels a single flow; its awaiter fails with a FlowStopped error while every other
    /// flow proceeds.  Resolves with whether the flow was found.
    pub async fn stop_flow(&self, flow_id: u64) -> BasaltResult<bool> {
        let (completion, handle) = FlowCompletion::new(flow_id);
        self.submit(OperationOptions::StopFlow(flow_id, completion))?;

        handle.recv().await
    }

    /// Returns whether the client currently holds an established session (a CONNACK has been
    /// received and no terminal event has followed).
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Returns whether the client is parked in the terminal disconnected state
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}
