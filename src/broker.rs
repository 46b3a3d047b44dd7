use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DeviceConfig;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-device topic names.
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub telemetry: String,
    pub config: String,
    pub commands: String,
    pub status: String,
}

impl Topics {
    pub fn for_device(device_uid: &str) -> Self {
        Self::under("devices", device_uid)
    }

    /// Topics of a backend participant such as the report scheduler.
    pub fn for_service(name: &str) -> Self {
        Self::under("services", name)
    }

    fn under(prefix: &str, id: &str) -> Self {
        Topics {
            telemetry: format!("{prefix}/{id}/telemetry"),
            config: format!("{prefix}/{id}/config"),
            commands: format!("{prefix}/{id}/commands"),
            status: format!("{prefix}/{id}/status"),
        }
    }
}

/// Raw message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct RawInbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection provider handed to every component that publishes.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Asks the connection to retry now instead of waiting out its backoff. Never blocks.
    fn request_reconnect(&self);

    /// Publishes the offline marker and disconnects.
    async fn shutdown(&self) -> Result<()>;
}

pub struct MqttBroker {
    client: AsyncClient,
    topics: Topics,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl MqttBroker {
    /// Connects with an "offline" last will and spawns the event loop task.
    ///
    /// Messages on the config and commands topics are forwarded to `inbound`.
    pub fn start(
        config: &DeviceConfig,
        device_uid: &str,
        topics: Topics,
        inbound: mpsc::Sender<RawInbound>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let mut options = MqttOptions::new(device_uid, &config.mqtt_broker, config.mqtt_port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            &topics.status,
            STATUS_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 20);
        let broker = Arc::new(MqttBroker {
            client: client.clone(),
            topics: topics.clone(),
            connected: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        });

        let connected = broker.connected.clone();
        let stopping = broker.stopping.clone();
        let wake = broker.wake.clone();
        info!(host = %config.mqtt_broker, port = config.mqtt_port, "Connecting to MQTT broker");

        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            warn!(code = ?ack.code, "Broker refused connection");
                            continue;
                        }
                        info!("Connected to MQTT broker");
                        connected.store(true, Ordering::SeqCst);
                        // Re-issued on every reconnect; the broker may have dropped the session.
                        for topic in [&topics.config, &topics.commands] {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!(topic = %topic, error = %e, "Subscribe failed");
                            }
                        }
                        if let Err(e) = client.try_publish(
                            topics.status.as_str(),
                            QoS::AtLeastOnce,
                            true,
                            STATUS_ONLINE.as_bytes().to_vec(),
                        ) {
                            warn!(error = %e, "Failed to announce online status");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let message = RawInbound {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        };
                        if inbound.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, stopping event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker closed the connection");
                        connected.store(false, Ordering::SeqCst);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = wake.notified() => {}
                        }
                    }
                }
            }
            info!("MQTT event loop stopped");
        });

        (broker, handle)
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await
        .map_err(|_| anyhow!("MQTT publish timed out"))?
        .map_err(|e| anyhow!("MQTT publish failed: {e:?}"))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn request_reconnect(&self) {
        self.wake.notify_one();
    }

    async fn shutdown(&self) -> Result<()> {
        let offline = self
            .publish(&self.topics.status, STATUS_OFFLINE.as_bytes().to_vec(), true)
            .await;
        self.stopping.store(true, Ordering::SeqCst);
        tokio::time::timeout(REQUEST_TIMEOUT, self.client.disconnect())
            .await
            .map_err(|_| anyhow!("MQTT disconnect timed out"))?
            .map_err(|e| anyhow!("MQTT disconnect failed: {e:?}"))?;
        offline
    }
}

/// Connects a throwaway client (no will, no subscriptions) and waits for the broker's ConnAck.
pub async fn probe_connection(config: &DeviceConfig, client_id: &str, timeout: Duration) -> Result<()> {
    let mut options = MqttOptions::new(client_id, &config.mqtt_broker, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(10));
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(anyhow!("broker refused connection: {:?}", ack.code))
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("cannot reach broker: {e}")),
            }
        }
    };
    let result = tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| anyhow!("no connection to broker within {timeout:?}"))?;

    if result.is_ok() {
        let _ = client.try_disconnect();
        let _ = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await;
    }
    result
}
