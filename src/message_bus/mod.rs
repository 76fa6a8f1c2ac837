//! MessageBus - MQTT Publish/Subscribe Adapter
//!
//! ## Responsibilities
//!
//! - Intersection-scoped topic names
//! - Broker connection with reconnect backoff
//! - (Re)subscribe to the command topic on every ConnAck
//! - Forward command payloads to `CommandIngress` untouched
//! - Non-blocking publish (`BusPublisher`)

use crate::command_ingress::CommandIngress;
use crate::error::Result;
use crate::shutdown::Shutdown;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use rumqttc::QoS;

/// Initial reconnect delay
const BACKOFF_INITIAL_MS: u64 = 500;
/// Reconnect delay ceiling
const BACKOFF_MAX_MS: u64 = 30_000;
/// Outgoing request queue capacity
const REQUEST_CAPACITY: usize = 64;
/// Upper bound on flushing the DISCONNECT at shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Topic names for one intersection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub command: String,
    pub status: String,
    pub violation: String,
}

impl Topics {
    pub fn new(status_prefix: &str, violation_prefix: &str, intersection_id: &str) -> Self {
        Self {
            command: format!("{}/{}/command", status_prefix, intersection_id),
            status: format!("{}/{}/status", status_prefix, intersection_id),
            violation: format!("{}/{}/detected", violation_prefix, intersection_id),
        }
    }
}

/// Non-blocking publication onto the bus
pub trait BusPublisher: Send + Sync {
    /// Queue `payload` for delivery; must not wait on network I/O
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Packet size limit, both directions
    pub max_packet_size: usize,
}

/// Exponential reconnect backoff
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BACKOFF_INITIAL_MS),
            Duration::from_millis(BACKOFF_MAX_MS),
        )
    }
}

/// Command subscription: topic + where to put the payloads
pub struct CommandSubscription {
    pub topic: String,
    pub ingress: CommandIngress,
}

/// MQTT bus client
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Connect and start the event loop task.
    ///
    /// The task keeps reconnecting with backoff until `shutdown` fires.
    pub fn start(
        options: BusOptions,
        subscription: Option<CommandSubscription>,
        mut shutdown: Shutdown,
    ) -> (Self, JoinHandle<()>) {
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_max_packet_size(options.max_packet_size, options.max_packet_size);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let subscriber = client.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::default();

            let mut connected = false;

            loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => break,
                    event = eventloop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();
                        connected = true;
                        tracing::info!(host = %options.host, port = options.port, "Bus connected");
                        if let Some(ref sub) = subscription {
                            if let Err(e) = subscriber.try_subscribe(sub.topic.clone(), QoS::AtLeastOnce) {
                                tracing::error!(topic = %sub.topic, error = %e, "Failed to subscribe");
                            } else {
                                tracing::info!(topic = %sub.topic, "Subscribed to command topic");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match subscription {
                            Some(ref sub) if publish.topic == sub.topic => {
                                sub.ingress.deliver(publish.payload);
                            }
                            _ => {
                                tracing::debug!(topic = %publish.topic, "Ignoring message on unexpected topic");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected = false;
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Bus connection error, reconnecting"
                        );
                        tokio::select! {
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            if connected {
                disconnect(&subscriber, &mut eventloop).await;
            }
            tracing::info!("Bus event loop stopped");
        });

        (Self { client }, handle)
    }
}

/// Send DISCONNECT and drive the event loop until it is on the wire
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        tracing::debug!(error = %e, "Bus disconnect request failed");
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    match flushed {
        Ok(()) => tracing::info!("Bus disconnected"),
        Err(_) => tracing::warn!("Bus disconnect timed out"),
    }
}

impl BusPublisher for MqttBus {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.client.try_publish(topic, qos, false, payload)?;
        Ok(())
    }
}

/// Message captured by `MemoryBus`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

/// In-process bus that records publications (tests)
#[derive(Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages published so far
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Messages on a single topic
    pub fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

/// Bus used when no broker is configured: logs and drops every message
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBus;

impl BusPublisher for OfflineBus {
    fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<()> {
        tracing::debug!(topic = %topic, size = payload.len(), "No broker, message dropped");
        Ok(())
    }
}

impl BusPublisher for MemoryBus {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        tracing::debug!(topic = %topic, size = payload.len(), "Published (memory bus)");
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(PublishedMessage {
                topic: topic.to_string(),
                qos,
                payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_ingress::{self, Command};
    use crate::models::LightState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Read one MQTT packet: fixed header byte and body
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Read packets until one whose type nibble matches `kind`
    async fn read_until(stream: &mut TcpStream, kind: u8) -> (u8, Vec<u8>) {
        loop {
            let (header, body) = read_packet(stream).await.unwrap();
            if header & 0xF0 == kind {
                return (header, body);
            }
        }
    }

    /// Accept a client and complete the CONNECT / CONNACK exchange
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, 0x10, "expected CONNECT");
        stream.write_all(&CONNACK).await.unwrap();
        stream
    }

    /// Wait for SUBSCRIBE, acknowledge it, return the topic filter
    async fn accept_subscribe(stream: &mut TcpStream) -> String {
        let (_, body) = read_until(stream, 0x80).await;
        let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let topic = String::from_utf8(body[4..4 + topic_len].to_vec()).unwrap();
        stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await.unwrap();
        topic
    }

    fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut remaining = 2 + topic.len() + payload.len();
        let mut packet = vec![0x30];
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if remaining == 0 {
                break;
            }
        }
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Split a PUBLISH body (QoS 0) into topic and payload
    fn decode_publish(body: &[u8]) -> (String, Vec<u8>) {
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
        (topic, body[2 + topic_len..].to_vec())
    }

    async fn local_broker() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn options(port: u16) -> BusOptions {
        BusOptions {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "bus-test".to_string(),
            keep_alive: Duration::from_secs(30),
            max_packet_size: 1024 * 1024,
        }
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("traffic_light", "traffic_violation", "12");
        assert_eq!(topics.command, "traffic_light/12/command");
        assert_eq!(topics.status, "traffic_light/12/status");
        assert_eq!(topics.violation, "traffic_violation/12/detected");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_memory_bus_records() {
        let bus = MemoryBus::new();
        bus.publish("a", QoS::AtLeastOnce, b"1".to_vec()).unwrap();
        bus.publish("b", QoS::AtMostOnce, b"2".to_vec()).unwrap();

        assert_eq!(bus.messages().len(), 2);
        let on_a = bus.messages_on("a");
        assert_eq!(on_a.len(), 1);
        assert_eq!(on_a[0].payload, b"1");
        assert_eq!(on_a[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_offline_bus_drops_messages() {
        let bus = OfflineBus;
        for _ in 0..1000 {
            bus.publish("a", QoS::AtMostOnce, vec![0u8; 1024]).unwrap();
        }
        assert_eq!(std::mem::size_of::<OfflineBus>(), 0);
    }

    #[tokio::test]
    async fn test_publish_larger_than_default_packet_limit() {
        let (listener, port) = local_broker().await;
        let (trigger, shutdown) = crate::shutdown::channel();
        let (bus, task) = MqttBus::start(options(port), None, shutdown);

        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            let (_, body) = read_until(&mut stream, 0x30).await;
            decode_publish(&body)
        });

        let payload = vec![0xABu8; 40 * 1024];
        bus.publish("traffic_violation/0/detected", QoS::AtMostOnce, payload.clone())
            .unwrap();

        let (topic, received) = tokio::time::timeout(TEST_TIMEOUT, broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "traffic_violation/0/detected");
        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload);

        trigger.trigger("test");
        tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_event_loop_subscribes_forwards_reconnects_and_disconnects() {
        let (listener, port) = local_broker().await;
        let (trigger, shutdown) = crate::shutdown::channel();
        let (ingress, mut queue) = command_ingress::channel();
        let command_topic = "traffic_light/0/command".to_string();
        let subscription = CommandSubscription {
            topic: command_topic.clone(),
            ingress,
        };
        let (_bus, task) = MqttBus::start(options(port), Some(subscription), shutdown);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let broker_topic = command_topic.clone();
        let broker = tokio::spawn(async move {
            // First session: subscribe, then the broker goes away
            let mut first = accept_session(&listener).await;
            assert_eq!(accept_subscribe(&mut first).await, broker_topic);
            drop(first);

            // Client backs off, reconnects and subscribes again
            let mut second = accept_session(&listener).await;
            assert_eq!(accept_subscribe(&mut second).await, broker_topic);
            second
                .write_all(&encode_publish("traffic_light/9/command", b"Green"))
                .await
                .unwrap();
            second
                .write_all(&encode_publish(&broker_topic, b"Red"))
                .await
                .unwrap();

            let _ = stop_rx.await;
            read_until(&mut second, 0xE0).await;
        });

        let commands = tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let commands = queue.drain();
                if !commands.is_empty() {
                    return commands;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(commands, vec![Command::SetState(LightState::Red)]);

        trigger.trigger("test");
        let _ = stop_tx.send(());
        tokio::time::timeout(TEST_TIMEOUT, broker).await.unwrap().unwrap();
        tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(queue.drain().is_empty());
    }
}
