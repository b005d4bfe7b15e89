/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Functionality for running the client's session engine on top of [`tokio`](https://crates.io/crates/tokio).

All protocol state transitions happen on one event-loop task; concurrency is expressed through
suspension points (transport reads, write drains, timers, reconnect backoff) rather than
shared-memory parallelism, so session state needs no locks.
 */

use crate::client::OperationOptions;
use crate::config::*;
use crate::error::BasaltError;
use crate::flow::FlowCompletion;
use crate::listener::*;
use crate::mqtt::ConnackPacket;
use crate::reconnect::*;
use crate::session::*;
use crate::transport::{TransportFactory, TransportStream};

use log::*;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::sleep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::encode::PacketWriter;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ClientImplState {
    Stopped,
    Connecting,
    Connected,
    PendingReconnect(Duration),
    Shutdown,
}

pub(crate) struct ClientRuntime<T> where T: TransportStream {
    transport_factory: TransportFactory<T>,
    packet_writer: Arc<Mutex<Box<dyn PacketWriter + Send>>>,
    connect_options: ConnectOptions,
    connect_delay: Duration,
    reconnect: ReconnectController,

    listeners: Arc<Mutex<ListenerRegistry>>,
    events: Arc<Mutex<EventDispatcher>>,
    ready: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,

    operation_receiver: mpsc::UnboundedReceiver<OperationOptions>,

    // connect() awaiter carried between the connecting state and the session that resolves it
    pending_connect: Option<FlowCompletion<ConnackPacket>>,

    // disconnect() awaiters resolved when the terminal stopped state is reached
    disconnect_waiters: Vec<FlowCompletion<()>>,

    stream: Option<T>,
}

fn build_reconnect_controller(auto_reconnect: AutoReconnect) -> ReconnectController {
    match auto_reconnect {
        AutoReconnect::Disabled => {
            ReconnectController::new(None, true, 0)
        }
        AutoReconnect::Enabled => {
            ReconnectController::new(Some(Box::<FixedDelayStrategy>::default()), false, DEFAULT_RECONNECT_ATTEMPTS)
        }
        AutoReconnect::Custom(options) => {
            let max_attempts = options.max_reconnect_attempts.unwrap_or(DEFAULT_RECONNECT_ATTEMPTS);
            let strategy = options.strategy.unwrap_or_else(|| {
                Box::new(FixedDelayStrategy::new(max_attempts, DEFAULT_RECONNECT_INTERVAL))
            });

            ReconnectController::new(Some(strategy), options.reconnect_unready, max_attempts)
        }
    }
}

impl<T> ClientRuntime<T> where T: TransportStream {

    pub(crate) fn new(
        config: ClientConfig<T>,
        connect_options: ConnectOptions,
        listeners: Arc<Mutex<ListenerRegistry>>,
        events: Arc<Mutex<EventDispatcher>>,
        ready: Arc<AtomicBool>,
        disconnected: Arc<AtomicBool>,
        operation_receiver: mpsc::UnboundedReceiver<OperationOptions>) -> Self {

        ClientRuntime {
            transport_factory: config.transport_factory,
            packet_writer: Arc::new(Mutex::new(config.packet_writer)),
            connect_options,
            connect_delay: config.connect_delay,
            reconnect: build_reconnect_controller(config.auto_reconnect),
            listeners,
            events,
            ready,
            disconnected,
            operation_receiver,
            pending_connect: None,
            disconnect_waiters: Vec::new(),
            stream: None,
        }
    }

    fn fail_inactive_operation(operation: OperationOptions) {
        match operation {
            OperationOptions::Connect(completion) => {
                completion.complete(Err(BasaltError::new_internal_state_error("connect already in progress")));
            }
            OperationOptions::Disconnect { completion, .. } => {
                completion.complete(Ok(()));
            }
            OperationOptions::Publish(_, completion) => {
                completion.complete(Err(BasaltError::new_session_closed()));
            }
            OperationOptions::Subscribe(_, completion) => {
                completion.complete(Err(BasaltError::new_session_closed()));
            }
            OperationOptions::Unsubscribe(_, completion) => {
                completion.complete(Err(BasaltError::new_session_closed()));
            }
            OperationOptions::StartFlow(_, mut flow) => {
                flow.fail(BasaltError::new_session_closed());
            }
            OperationOptions::StopFlow(_, completion) => {
                completion.complete(Ok(false));
            }
        }
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

    // Events for connection attempts that die before a session exists (transport factory
    // failures).  Session-level failures emit through the session itself.
    fn emit_attempt_failure_events(&self, reason: &Arc<BasaltError>) {
        self.emit_event(ClientEvent::Error(ErrorEvent {
            error: reason.clone(),
        }));
        self.emit_event(ClientEvent::Disconnect(DisconnectionEvent {
            error: reason.clone(),
        }));
    }

    // Consults the reconnect controller about a termination; connect() awaiters observe the
    // first terminal error regardless of whether reconnection continues behind them.
    fn handle_termination(&mut self, reason: Arc<BasaltError>) -> ClientImplState {
        if let Some(completion) = self.pending_connect.take() {
            completion.complete(Err(reason.clone_kind()));
        }

        if let Some(delay) = self.reconnect.decide(&reason) {
            info!("tokio - handle_termination - reconnecting in {:?}", delay);
            ClientImplState::PendingReconnect(delay)
        } else {
            info!("tokio - handle_termination - terminal disconnect");
            ClientImplState::Stopped
        }
    }

    async fn process_stopped(&mut self) -> ClientImplState {
        self.ready.store(false, Ordering::SeqCst);
        self.disconnected.store(true, Ordering::SeqCst);

        for completion in self.disconnect_waiters.drain(..) {
            completion.complete(Ok(()));
        }

        loop {
            trace!("tokio - process_stopped loop");

            match self.operation_receiver.recv().await {
                None => {
                    return ClientImplState::Shutdown;
                }
                Some(OperationOptions::Connect(completion)) => {
                    debug!("tokio - process_stopped - connect requested");
                    self.pending_connect = Some(completion);
                    self.reconnect.on_connect_requested();
                    return ClientImplState::Connecting;
                }
                Some(OperationOptions::Disconnect { completion, .. }) => {
                    completion.complete(Ok(()));
                }
                Some(operation) => {
                    Self::fail_inactive_operation(operation);
                }
            }
        }
    }

    async fn process_connecting(&mut self) -> ClientImplState {
        self.disconnected.store(false, Ordering::SeqCst);

        let mut connect_future = (self.transport_factory)();

        loop {
            trace!("tokio - process_connecting loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    match operation_result {
                        None => {
                            return ClientImplState::Shutdown;
                        }
                        Some(OperationOptions::Disconnect { completion, .. }) => {
                            info!("tokio - process_connecting - disconnect requested, abandoning connection attempt");
                            self.disconnect_waiters.push(completion);
                            if let Some(connect_completion) = self.pending_connect.take() {
                                connect_completion.complete(Err(BasaltError::new_user_initiated_disconnect(true)));
                            }
                            return ClientImplState::Stopped;
                        }
                        Some(operation) => {
                            Self::fail_inactive_operation(operation);
                        }
                    }
                }
                connection_result = &mut connect_future => {
                    match connection_result {
                        Ok(stream) => {
                            info!("tokio - process_connecting - transport connection established successfully");
                            self.stream = Some(stream);
                            return ClientImplState::Connected;
                        }
                        Err(error) => {
                            info!("tokio - process_connecting - transport connection establishment failed: {}", error);
                            let reason = Arc::new(BasaltError::new_transport_error(error));
                            self.emit_attempt_failure_events(&reason);
                            return self.handle_termination(reason);
                        }
                    }
                }
            }
        }
    }

    async fn process_connected(&mut self) -> ClientImplState {
        let stream = self.stream.take().unwrap();
        let (mut stream_reader, mut stream_writer) = split(stream);

        let mut session = SessionState::new(
            SessionConfig {
                connect: self.connect_options.to_connect_packet(),
                connect_delay: self.connect_delay,
                base_timestamp: Instant::now(),
            },
            self.packet_writer.clone(),
            self.listeners.clone(),
            self.events.clone(),
            self.pending_connect.take(),
        );

        let mut opened_context = NetworkEventContext {
            event: NetworkEvent::ConnectionOpened,
            current_time: Instant::now(),
        };

        if let Err(error) = session.handle_network_event(&mut opened_context) {
            let reason = session.shutdown(error);
            let _ = stream_writer.shutdown().await;
            return self.handle_termination(reason);
        }

        let mut outbound_data: Vec<u8> = Vec::with_capacity(4096);
        let mut cumulative_bytes_written: usize = 0;
        let mut inbound_data: [u8; 4096] = [0; 4096];
        let mut should_flush = false;

        let mut was_ready = false;
        let mut client_dropped = false;
        let mut termination: Option<BasaltError> = None;

        while termination.is_none() {
            trace!("tokio - process_connected loop");

            let next_service_time_option = session.get_next_service_timepoint(&Instant::now());
            let service_wait: Option<tokio::time::Sleep> = next_service_time_option.map(|next_service_time| sleep(next_service_time.saturating_duration_since(Instant::now())));

            let outbound_slice_option: Option<&[u8]> =
                if cumulative_bytes_written < outbound_data.len() {
                    Some(&outbound_data[cumulative_bytes_written..])
                } else {
                    None
                };

            let write_directive =
                if should_flush {
                    Some(WriteDirective::Flush)
                } else {
                    outbound_slice_option.map(WriteDirective::Bytes)
                };

            tokio::select! {
                // incoming user operations future
                operation_result = self.operation_receiver.recv() => {
                    match operation_result {
                        None => {
                            client_dropped = true;
                            termination = Some(BasaltError::new_user_initiated_disconnect(true));
                        }
                        Some(operation) => {
                            let now = Instant::now();
                            match operation {
                                OperationOptions::Connect(completion) => {
                                    completion.complete(Err(BasaltError::new_internal_state_error("connect invoked on an active client")));
                                }
                                OperationOptions::Disconnect { force, completion } => {
                                    self.disconnect_waiters.push(completion);
                                    if force {
                                        info!("tokio - process_connected - forced disconnect requested");
                                        termination = Some(BasaltError::new_user_initiated_disconnect(true));
                                    } else {
                                        session.request_disconnect(&now);
                                    }
                                }
                                OperationOptions::Publish(publish, completion) => {
                                    session.start_publish(publish, completion, &now);
                                }
                                OperationOptions::Subscribe(subscriptions, completion) => {
                                    session.start_subscribe(subscriptions, completion, &now);
                                }
                                OperationOptions::Unsubscribe(topic_filters, completion) => {
                                    session.start_unsubscribe(topic_filters, completion, &now);
                                }
                                OperationOptions::StartFlow(flow_id, flow) => {
                                    session.start_user_flow(flow_id, flow, &now);
                                }
                                OperationOptions::StopFlow(flow_id, completion) => {
                                    completion.complete(Ok(session.stop_flow(flow_id, &now)));
                                }
                            }
                        }
                    }
                }
                // incoming data on the socket future
                read_result = stream_reader.read(inbound_data.as_mut_slice()) => {
                    match read_result {
                        Ok(0) => {
                            info!("tokio - process_connected - connection closed for read (0 bytes)");
                            termination = Some(termination_for_transport_loss(&session, BasaltError::new_connection_closed("network stream closed")));
                        }
                        Ok(bytes_read) => {
                            debug!("tokio - process_connected - read {} bytes from connection stream", bytes_read);
                            let mut context = NetworkEventContext {
                                event: NetworkEvent::IncomingData(&inbound_data[..bytes_read]),
                                current_time: Instant::now(),
                            };

                            if let Err(error) = session.handle_network_event(&mut context) {
                                termination = Some(error);
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream read failed: {:?}", error);
                            termination = Some(termination_for_transport_loss(&session, BasaltError::new_connection_closed(error)));
                        }
                    }
                }
                // client service future (if relevant)
                Some(_) = conditional_wait(service_wait) => {
                    debug!("tokio - process_connected - running client service task");
                    let mut service_context = ServiceContext {
                        to_socket: &mut outbound_data,
                        current_time: Instant::now(),
                    };

                    if let Err(error) = session.service(&mut service_context) {
                        termination = Some(error);
                    }
                }
                // outbound data future (if relevant)
                Some(bytes_written_result) = conditional_write(write_directive, &mut stream_writer) => {
                    match bytes_written_result {
                        Ok(bytes_written) => {
                            if should_flush {
                                should_flush = false;
                                let mut context = NetworkEventContext {
                                    event: NetworkEvent::WriteCompletion,
                                    current_time: Instant::now(),
                                };

                                if let Err(error) = session.handle_network_event(&mut context) {
                                    termination = Some(error);
                                }
                            } else {
                                debug!("tokio - process_connected - wrote {} bytes to connection stream", bytes_written);
                                cumulative_bytes_written += bytes_written;
                                if cumulative_bytes_written == outbound_data.len() {
                                    outbound_data.clear();
                                    cumulative_bytes_written = 0;
                                    should_flush = true;
                                }
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream write failed: {:?}", error);
                            termination = Some(termination_for_transport_loss(&session, BasaltError::new_connection_closed(error)));
                        }
                    }
                }
            }

            if session.is_ready() && !was_ready {
                was_ready = true;
                self.ready.store(true, Ordering::SeqCst);
                self.reconnect.on_connection_success();
            }
        }

        self.ready.store(false, Ordering::SeqCst);

        let reason = session.shutdown(termination.unwrap());

        info!("tokio - process_connected - shutting down stream");
        let _ = stream_writer.shutdown().await;
        info!("tokio - process_connected - stream fully closed");

        if client_dropped {
            return ClientImplState::Shutdown;
        }

        self.handle_termination(reason)
    }

    async fn process_pending_reconnect(&mut self, wait: Duration) -> ClientImplState {
        let reconnect_timer = sleep(wait);
        tokio::pin!(reconnect_timer);

        loop {
            trace!("tokio - process_pending_reconnect loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    match operation_result {
                        None => {
                            return ClientImplState::Shutdown;
                        }
                        Some(OperationOptions::Disconnect { completion, .. }) => {
                            info!("tokio - process_pending_reconnect - disconnect requested, cancelling reconnect");
                            self.disconnect_waiters.push(completion);
                            return ClientImplState::Stopped;
                        }
                        Some(operation) => {
                            Self::fail_inactive_operation(operation);
                        }
                    }
                }
                () = &mut reconnect_timer => {
                    info!("tokio - process_pending_reconnect - reconnect timer elapsed");
                    return ClientImplState::Connecting;
                }
            }
        }
    }
}

// A transport that dies while a soft disconnect is draining finished the user's request, it
// did not fail it; misclassifying the close would hand a user-initiated shutdown to the
// reconnect strategy as a retriable loss.
fn termination_for_transport_loss(session: &SessionState, error: BasaltError) -> BasaltError {
    if session.state() == SessionStateType::PendingDisconnect {
        return BasaltError::new_user_initiated_disconnect(false);
    }

    error
}

async fn conditional_wait(wait_option: Option<tokio::time::Sleep>) -> Option<()> {
    match wait_option {
        Some(timer) => {
            timer.await;
            Some(())
        },
        None => None,
    }
}

enum WriteDirective<'a> {
    Bytes(&'a [u8]),
    Flush
}

async fn conditional_write<'a, T>(directive: Option<WriteDirective<'a>>, writer: &mut WriteHalf<T>) -> Option<std::io::Result<usize>> where T: TransportStream {
    match directive {
        Some(WriteDirective::Bytes(bytes)) => {
            Some(writer.write(bytes).await)
        }
        Some(WriteDirective::Flush) => {
            if let Err(error) = writer.flush().await {
                Some(Err(error))
            } else {
                Some(Ok(0))
            }
        }
        _ => { None }
    }
}

pub(crate) async fn client_event_loop<T>(mut runtime: ClientRuntime<T>) where T: TransportStream {
    let mut current_state = ClientImplState::Stopped;

    loop {
        let next_state =
            match current_state {
                ClientImplState::Stopped => { runtime.process_stopped().await }
                ClientImplState::Connecting => { runtime.process_connecting().await }
                ClientImplState::Connected => { runtime.process_connected().await }
                ClientImplState::PendingReconnect(wait) => { runtime.process_pending_reconnect(wait).await }
                ClientImplState::Shutdown => { break; }
            };

        debug!("tokio - client_event_loop - transitioning from {:?} to {:?}", current_state, next_state);
        current_state = next_state;
    }

    info!("tokio - client_event_loop - shut down");
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::client::Client;
    use crate::decode::{Decoder, DecodingContext};
    use crate::encode::Encoder;
    use crate::error::BasaltResult;
    use crate::flow::*;
    use crate::mqtt::*;
    use crate::transport::TransportFactoryReturn;

    use assert_matches::assert_matches;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn make_duplex_factory() -> (TransportFactory<DuplexStream>, mpsc::UnboundedReceiver<DuplexStream>, Arc<AtomicUsize>) {
        let (server_sender, server_receiver) = mpsc::unbounded_channel();
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = attempt_count.clone();

        let factory: TransportFactory<DuplexStream> = Box::new(move || -> TransportFactoryReturn<DuplexStream> {
            counter.fetch_add(1, Ordering::SeqCst);
            let (client_half, server_half) = tokio::io::duplex(4096);
            let _ = server_sender.send(server_half);
            Box::pin(async move { Ok(client_half) })
        });

        (factory, server_receiver, attempt_count)
    }

    enum BrokerAction {
        Respond(Vec<MqttPacket>),
        Close,
    }

    async fn serve_connection<F>(stream: DuplexStream, mut handler: F)
        where F: FnMut(&MqttPacket) -> BrokerAction + Send {

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = Decoder::new();
        let mut encoder = Encoder::new();
        let mut buffer = [0u8; 4096];

        'serve: loop {
            let bytes_read = match reader.read(&mut buffer).await {
                Ok(0) => { break; }
                Ok(bytes_read) => { bytes_read }
                Err(_) => { break; }
            };

            let mut packets: VecDeque<Box<MqttPacket>> = VecDeque::new();
            {
                let mut context = DecodingContext {
                    decoded_packets: &mut packets
                };

                if decoder.decode_bytes(&buffer[..bytes_read], &mut context).is_err() {
                    break;
                }
            }

            for packet in packets {
                match handler(&packet) {
                    BrokerAction::Respond(responses) => {
                        for response in responses {
                            let mut encoded = Vec::new();
                            encoder.write_packet(&response, &mut encoded).unwrap();
                            if writer.write_all(&encoded).await.is_err() {
                                break 'serve;
                            }
                        }
                    }
                    BrokerAction::Close => {
                        break 'serve;
                    }
                }
            }
        }
    }

    fn successful_connack() -> MqttPacket {
        MqttPacket::Connack(ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        })
    }

    fn echo_broker_handler(packet: &MqttPacket) -> BrokerAction {
        match packet {
            MqttPacket::Connect(_) => {
                BrokerAction::Respond(vec![successful_connack()])
            }
            MqttPacket::Publish(publish) => {
                match publish.qos() {
                    QualityOfService::AtMostOnce => { BrokerAction::Respond(vec![]) }
                    QualityOfService::AtLeastOnce => {
                        BrokerAction::Respond(vec![MqttPacket::Puback(PubackPacket {
                            packet_id: publish.packet_id(),
                        })])
                    }
                    QualityOfService::ExactlyOnce => {
                        BrokerAction::Respond(vec![MqttPacket::Pubrec(PubrecPacket {
                            packet_id: publish.packet_id(),
                        })])
                    }
                }
            }
            MqttPacket::Pubrel(pubrel) => {
                BrokerAction::Respond(vec![MqttPacket::Pubcomp(PubcompPacket {
                    packet_id: pubrel.packet_id,
                })])
            }
            MqttPacket::Subscribe(subscribe) => {
                let return_codes = subscribe.subscriptions.iter()
                    .map(|subscription| {
                        match subscription.qos() {
                            QualityOfService::AtMostOnce => { SubackReturnCode::GrantedQos0 }
                            QualityOfService::AtLeastOnce => { SubackReturnCode::GrantedQos1 }
                            QualityOfService::ExactlyOnce => { SubackReturnCode::GrantedQos2 }
                        }
                    })
                    .collect();

                BrokerAction::Respond(vec![MqttPacket::Suback(SubackPacket {
                    packet_id: subscribe.packet_id,
                    return_codes,
                })])
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                BrokerAction::Respond(vec![MqttPacket::Unsuback(UnsubackPacket {
                    packet_id: unsubscribe.packet_id,
                })])
            }
            MqttPacket::Pingreq(_) => {
                BrokerAction::Respond(vec![MqttPacket::Pingresp(PingrespPacket {})])
            }
            MqttPacket::Disconnect(_) => {
                BrokerAction::Close
            }
            _ => {
                BrokerAction::Respond(vec![])
            }
        }
    }

    fn test_connect_options() -> ConnectOptions {
        ConnectOptions::builder("runtime-tester")
            .with_keep_alive_seconds(0)
            .build()
    }

    struct IdleFlow {
        completion: Option<FlowCompletion<()>>,
    }

    impl Flow for IdleFlow {
        fn accept(&self, _: &MqttPacket) -> bool {
            false
        }

        fn next(&mut self, _: MqttPacket) -> BasaltResult<FlowStep> {
            Ok(FlowStep::pending())
        }

        fn fail(&mut self, error: BasaltError) {
            if let Some(completion) = self.completion.take() {
                completion.complete(Err(error));
            }
        }
    }

    #[tokio::test]
    async fn client_connects_and_disconnects_cleanly() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Disabled)
            .build();

        let client = Client::new(config, test_connect_options());

        let broker = tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, echo_broker_handler).await;
        });

        let connack = timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();
        assert_eq!(ConnectReturnCode::Accepted, connack.return_code);
        assert!(client.ready());
        assert!(!client.disconnected());

        timeout(TEST_TIMEOUT, client.disconnect(false)).await.unwrap().unwrap();
        assert!(!client.ready());
        assert!(client.disconnected());

        timeout(TEST_TIMEOUT, broker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_operations_round_trip() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Disabled)
            .build();

        let client = Client::new(config, test_connect_options());

        tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, echo_broker_handler).await;
        });

        timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();

        let suback = timeout(TEST_TIMEOUT, client.subscribe(vec![
            Subscription::new("telemetry/#", QualityOfService::AtLeastOnce),
            Subscription::new("control/+", QualityOfService::ExactlyOnce),
        ])).await.unwrap().unwrap();
        assert_eq!(vec![SubackReturnCode::GrantedQos1, SubackReturnCode::GrantedQos2], suback.return_codes);

        let qos0_response = timeout(TEST_TIMEOUT, client.publish(
            PublishPacket::builder("telemetry/cpu", QualityOfService::AtMostOnce)
                .with_payload(vec![0])
                .build())).await.unwrap().unwrap();
        assert_eq!(PublishResponse::Qos0, qos0_response);

        let qos1_response = timeout(TEST_TIMEOUT, client.publish(
            PublishPacket::builder("telemetry/cpu", QualityOfService::AtLeastOnce)
                .with_payload(vec![1])
                .build())).await.unwrap().unwrap();
        assert_matches!(qos1_response, PublishResponse::Qos1(_));

        let qos2_response = timeout(TEST_TIMEOUT, client.publish(
            PublishPacket::builder("telemetry/cpu", QualityOfService::ExactlyOnce)
                .with_payload(vec![2])
                .build())).await.unwrap().unwrap();
        assert_matches!(qos2_response, PublishResponse::Qos2(_));

        let unsuback = timeout(TEST_TIMEOUT, client.unsubscribe(vec!["telemetry/#".to_string()])).await.unwrap().unwrap();
        assert!(unsuback.packet_id > 0);

        timeout(TEST_TIMEOUT, client.disconnect(false)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbound_publish_reaches_listener() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Disabled)
            .build();

        let client = Client::new(config, test_connect_options());

        let (message_sender, mut message_receiver) = mpsc::unbounded_channel();
        client.listen("abc", Arc::new(move |message| {
            let _ = message_sender.send((*message).clone());
        })).unwrap();

        tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, |packet| {
                match packet {
                    MqttPacket::Connect(_) => {
                        BrokerAction::Respond(vec![
                            successful_connack(),
                            MqttPacket::Publish(PublishPacket::builder("abc", QualityOfService::AtMostOnce).build()),
                        ])
                    }
                    other => { echo_broker_handler(other) }
                }
            }).await;
        });

        timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();

        let message = timeout(TEST_TIMEOUT, message_receiver.recv()).await.unwrap().unwrap();
        assert_eq!("abc", message.topic);
        assert!(message.payload.is_empty());
        assert_eq!(QualityOfService::AtMostOnce, message.qos);

        timeout(TEST_TIMEOUT, client.disconnect(true)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnect_preserves_listeners() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Custom(
                ReconnectOptions::builder()
                    .with_strategy(Box::new(FixedDelayStrategy::new(5, Duration::from_millis(10))))
                    .build()))
            .build();

        let client = Arc::new(Client::new(config, test_connect_options()));

        let (message_sender, mut message_receiver) = mpsc::unbounded_channel();
        client.listen("abc", Arc::new(move |message| {
            let _ = message_sender.send((*message).clone());
        })).unwrap();

        let connect_client = client.clone();
        let connect_task = tokio::spawn(async move { connect_client.connect().await });

        // topic "abc", empty payload
        let publish_bytes: [u8; 7] = [0x30, 0x05, 0x00, 0x03, 0x61, 0x62, 0x63];
        let mut read_buffer = [0u8; 1024];

        // first session: CONNACK, one publish, then transport destruction
        let first_stream = timeout(TEST_TIMEOUT, servers.recv()).await.unwrap().unwrap();
        let (mut first_reader, mut first_writer) = tokio::io::split(first_stream);
        assert!(first_reader.read(&mut read_buffer).await.unwrap() > 0);
        first_writer.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        timeout(TEST_TIMEOUT, connect_task).await.unwrap().unwrap().unwrap();

        first_writer.write_all(&publish_bytes).await.unwrap();
        let first_message = timeout(TEST_TIMEOUT, message_receiver.recv()).await.unwrap().unwrap();
        assert_eq!("abc", first_message.topic);

        drop(first_reader);
        drop(first_writer);

        // automatic reconnect: same listener, same bytes, second delivery
        let second_stream = timeout(TEST_TIMEOUT, servers.recv()).await.unwrap().unwrap();
        let (mut second_reader, mut second_writer) = tokio::io::split(second_stream);
        assert!(second_reader.read(&mut read_buffer).await.unwrap() > 0);
        second_writer.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        second_writer.write_all(&publish_bytes).await.unwrap();

        let second_message = timeout(TEST_TIMEOUT, message_receiver.recv()).await.unwrap().unwrap();
        assert_eq!("abc", second_message.topic);

        timeout(TEST_TIMEOUT, client.disconnect(true)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bounded_reconnect_attempts_reach_terminal_disconnect() {
        let (factory, mut servers, attempt_count) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Custom(
                ReconnectOptions::builder()
                    .with_strategy(Box::new(FixedDelayStrategy::new(2, Duration::from_millis(10))))
                    .with_max_reconnect_attempts(2)
                    .build()))
            .build();

        let client = Arc::new(Client::new(config, test_connect_options()));

        let connect_client = client.clone();
        let connect_task = tokio::spawn(async move { connect_client.connect().await });

        // first session establishes, then gets destroyed
        let first_stream = timeout(TEST_TIMEOUT, servers.recv()).await.unwrap().unwrap();
        let (mut first_reader, mut first_writer) = tokio::io::split(first_stream);
        let mut read_buffer = [0u8; 1024];
        assert!(first_reader.read(&mut read_buffer).await.unwrap() > 0);
        first_writer.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        timeout(TEST_TIMEOUT, connect_task).await.unwrap().unwrap().unwrap();

        drop(first_reader);
        drop(first_writer);

        // two reconnect attempts get destroyed without a CONNACK
        for _ in 0..2 {
            let stream = timeout(TEST_TIMEOUT, servers.recv()).await.unwrap().unwrap();
            drop(stream);
        }

        // the third destruction is terminal: no further attempt is made
        assert!(timeout(Duration::from_millis(500), servers.recv()).await.is_err());
        assert_eq!(3, attempt_count.load(Ordering::SeqCst));

        let mut parked = false;
        for _ in 0..50 {
            if client.disconnected() {
                parked = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(parked);
        assert!(!client.ready());
    }

    #[tokio::test]
    async fn connection_rejection_is_terminal_for_auth_failures() {
        let (factory, mut servers, attempt_count) = make_duplex_factory();
        let config = ClientConfig::builder(factory).build();

        let client = Client::new(config, test_connect_options());

        tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, |packet| {
                match packet {
                    MqttPacket::Connect(_) => {
                        BrokerAction::Respond(vec![MqttPacket::Connack(ConnackPacket {
                            session_present: false,
                            return_code: ConnectReturnCode::NotAuthorized,
                        })])
                    }
                    _ => { BrokerAction::Respond(vec![]) }
                }
            }).await;
        });

        let connect_result = timeout(TEST_TIMEOUT, client.connect()).await.unwrap();
        let error = connect_result.unwrap_err();
        assert_eq!(Some(ConnectReturnCode::NotAuthorized), error.connect_status());

        let mut parked = false;
        for _ in 0..50 {
            if client.disconnected() {
                parked = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(parked);
        assert_eq!(1, attempt_count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_flow_cancels_an_idle_flow() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Disabled)
            .build();

        let client = Client::new(config, test_connect_options());

        tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, echo_broker_handler).await;
        });

        timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();

        let handle = client.start_flow(|completion| {
            Box::new(IdleFlow {
                completion: Some(completion),
            })
        }).unwrap();

        let flow_id = handle.flow_id();
        assert!(timeout(TEST_TIMEOUT, client.stop_flow(flow_id)).await.unwrap().unwrap());
        assert_matches!(timeout(TEST_TIMEOUT, handle.recv()).await.unwrap(), Err(BasaltError::FlowStopped(_)));

        // a second stop of the same flow finds nothing
        assert!(!timeout(TEST_TIMEOUT, client.stop_flow(flow_id)).await.unwrap().unwrap());

        timeout(TEST_TIMEOUT, client.disconnect(true)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_events_fire_in_order() {
        let (factory, mut servers, _) = make_duplex_factory();
        let config = ClientConfig::builder(factory)
            .with_auto_reconnect(AutoReconnect::Disabled)
            .build();

        let client = Client::new(config, test_connect_options());

        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        client.add_event_listener(Arc::new(move |event: Arc<ClientEvent>| {
            let tag = match &*event {
                ClientEvent::Connect(_) => { "connect" }
                ClientEvent::Disconnect(_) => { "disconnect" }
                ClientEvent::Error(_) => { "error" }
                ClientEvent::Message(_) => { "message" }
                ClientEvent::PacketReceived(_) => { "packet" }
            };
            let _ = event_sender.send(tag.to_string());
        }));

        tokio::spawn(async move {
            let stream = servers.recv().await.unwrap();
            serve_connection(stream, echo_broker_handler).await;
        });

        timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();
        timeout(TEST_TIMEOUT, client.disconnect(true)).await.unwrap().unwrap();

        let mut tags = Vec::new();
        while let Ok(Some(tag)) = timeout(Duration::from_millis(250), event_receiver.recv()).await {
            tags.push(tag);
        }

        // CONNACK receipt, connect, then the terminal disconnect; a forced disconnect emits
        // no error event
        assert_eq!(vec!["packet".to_string(), "connect".to_string(), "disconnect".to_string()], tags);
    }
}
