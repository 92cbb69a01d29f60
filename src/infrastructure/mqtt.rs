//! MQTT Transport Module
//!
//! Devices publish and subscribe through [`MessageTransport`]. The broker
//! connection, reconnects and resubscription live in [`MqttTransport`]; inbound
//! messages are handed to the fleet through a channel.

use crate::domain::error::TransportError;
use crate::domain::settings::MqttSettings;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CLIENT_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publish/subscribe surface used by device handles
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool)
        -> Result<(), TransportError>;

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;
}

pub type SharedTransport = Arc<dyn MessageTransport>;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop.
    ///
    /// The connection is established lazily by the event loop and re-established
    /// after failures; subscriptions are replayed on every (re)connect.
    pub fn connect(settings: &MqttSettings) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(BTreeSet::new()));
        let (tx, rx) = mpsc::channel(CLIENT_CAPACITY);

        info!(
            "Connecting to MQTT broker at {}:{}",
            settings.host, settings.port
        );
        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            tx,
        ));

        (
            Self {
                client,
                subscriptions,
            },
            rx,
        )
    }

    fn known_subscriptions(subscriptions: &Mutex<BTreeSet<String>>) -> Vec<String> {
        match subscriptions.lock() {
            Ok(set) => set.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    tx: mpsc::Sender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                // Queued behind pending requests that only this loop can drain
                tokio::spawn(resubscribe(
                    client.clone(),
                    MqttTransport::known_subscriptions(&subscriptions),
                ));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                };
                debug!("MQTT message on {}", message.topic);
                if tx.send(message).await.is_err() {
                    info!("Inbound message consumer gone, stopping MQTT event loop");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn resubscribe(client: AsyncClient, topics: Vec<String>) {
    for topic in topics {
        if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
            warn!("Failed to resubscribe to {}: {}", topic, e);
        }
    }
}

#[async_trait]
impl MessageTransport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: String,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        if let Ok(mut set) = self.subscriptions.lock() {
            set.extend(topics.iter().cloned());
        }

        for topic in topics {
            self.client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe {
                    topics: topics.to_vec(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Accept one client, acknowledge its CONNECT and collect what it sends
    /// until `needle` shows up
    async fn broker_until(listener: TcpListener, needle: &'static [u8]) -> bool {
        let Ok((mut socket, _)) = listener.accept().await else {
            return false;
        };
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];

        let Ok(n) = socket.read(&mut buf).await else {
            return false;
        };
        received.extend_from_slice(&buf[..n]);
        if socket.write_all(&CONNACK).await.is_err() {
            return false;
        }

        loop {
            if received.windows(needle.len()).any(|w| w == needle) {
                return true;
            }
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[tokio::test]
    async fn test_resubscribe_with_a_full_request_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(broker_until(listener, b"cybele/test/set"));

        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("cybele-test", "127.0.0.1", port), CLIENT_CAPACITY);
        for _ in 0..CLIENT_CAPACITY {
            client
                .try_publish("cybele/test/state", QoS::AtLeastOnce, false, "{}")
                .unwrap();
        }
        let subscriptions = Arc::new(Mutex::new(BTreeSet::from(["cybele/test/set".to_string()])));
        let (tx, _rx) = mpsc::channel(CLIENT_CAPACITY);

        let events = tokio::spawn(run_event_loop(eventloop, client, subscriptions, tx));

        let subscribed = tokio::time::timeout(Duration::from_secs(5), broker).await;
        assert!(matches!(subscribed, Ok(Ok(true))));
        events.abort();
    }
}
