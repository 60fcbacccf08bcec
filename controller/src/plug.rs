use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use smartplug_common::{
    config::MqttConfig,
    topics::{command_topic, intent_payload, parse_power_payload, state_topic, PAYLOAD_QUERY},
    DeviceConfig, DeviceError, DeviceIntent,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;

/// Outbound port to a physical plug. Implementations may block on the
/// network; callers bound every call with a timeout.
#[async_trait]
pub trait PlugPort: Send + Sync {
    async fn set_state(&self, device: &DeviceConfig, intent: DeviceIntent)
        -> Result<(), DeviceError>;

    async fn get_state(&self, device: &DeviceConfig) -> Result<DeviceIntent, DeviceError>;
}

#[derive(Debug, Clone)]
struct PowerReply {
    topic: String,
    payload: String,
}

/// Tasmota-style plugs behind an MQTT broker.
///
/// Plugs that only speak the Tuya LAN protocol (local key, protocol 3.3)
/// are not driven directly; bridge them to MQTT first. `dp_id` selects the
/// `POWER<n>` relay.
pub struct MqttPlug {
    client: AsyncClient,
    replies: broadcast::Sender<PowerReply>,
}

impl MqttPlug {
    /// Starts the event loop. Never blocks on the broker; subscriptions are
    /// issued once it accepts the connection.
    pub fn connect<'a>(
        config: &MqttConfig,
        devices: impl IntoIterator<Item = &'a DeviceConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !config.user.is_empty() {
            options.set_credentials(&config.user, &config.pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let topics: Vec<String> = devices
            .into_iter()
            .map(|device| state_topic(device.topic_base(), device.dp_id))
            .collect();

        let (replies, _) = broadcast::channel(64);
        spawn_mqtt_loop(
            client.clone(),
            eventloop,
            topics.into(),
            replies.clone(),
            cancel,
        );
        info!(
            "mqtt plug driver using broker {}:{}",
            config.host, config.port
        );

        Self { client, replies }
    }

    async fn publish_and_wait(
        &self,
        device: &DeviceConfig,
        payload: &'static str,
    ) -> Result<DeviceIntent, DeviceError> {
        let reply_topic = state_topic(device.topic_base(), device.dp_id);
        // Subscribe before publishing so a fast reply is not missed.
        let mut rx = self.replies.subscribe();

        self.client
            .publish(
                command_topic(device.topic_base(), device.dp_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|err| DeviceError::Transport(err.to_string()))?;

        loop {
            match rx.recv().await {
                Ok(reply) if reply.topic == reply_topic => {
                    return parse_power_payload(&reply.payload, device.dp_id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("plug reply channel lagged by {skipped} messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DeviceError::Unreachable(
                        "mqtt event loop stopped".to_string(),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl PlugPort for MqttPlug {
    async fn set_state(
        &self,
        device: &DeviceConfig,
        intent: DeviceIntent,
    ) -> Result<(), DeviceError> {
        let reported = self
            .publish_and_wait(device, intent_payload(intent))
            .await?;
        if reported == intent {
            Ok(())
        } else {
            Err(DeviceError::Rejected {
                requested: intent.as_str(),
                reported: reported.as_str(),
            })
        }
    }

    async fn get_state(&self, device: &DeviceConfig) -> Result<DeviceIntent, DeviceError> {
        self.publish_and_wait(device, PAYLOAD_QUERY).await
    }
}

async fn subscribe_topics(client: &AsyncClient, topics: &[String]) -> anyhow::Result<()> {
    for topic in topics {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("failed to subscribe {topic}"))?;
    }
    Ok(())
}

/// The request queue is drained only by the event loop, so subscribing from
/// inside it would block forever once the queue fills during an outage.
fn spawn_subscribe(client: AsyncClient, topics: Arc<[String]>) {
    tokio::spawn(async move {
        if let Err(err) = subscribe_topics(&client, &topics).await {
            warn!("mqtt subscribe failed: {err:#}");
        }
    });
}

fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    topics: Arc<[String]>,
    replies: broadcast::Sender<PowerReply>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let reply = PowerReply {
                        topic: message.topic,
                        payload: String::from_utf8_lossy(&message.payload).into_owned(),
                    };
                    // No receivers simply means nobody is waiting on a reply.
                    let _ = replies.send(reply);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    spawn_subscribe(client.clone(), topics.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        debug!("mqtt event loop stopped");
    });
}

/// In-memory plug used for dry runs and tests. Unknown plugs start Off.
#[derive(Debug, Default)]
pub struct SimulatedPlug {
    states: Mutex<HashMap<String, DeviceIntent>>,
    failing: Mutex<HashSet<String>>,
    commands: Mutex<Vec<(String, DeviceIntent)>>,
    queries: AtomicUsize,
    latency: Duration,
}

impl SimulatedPlug {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn preset(&self, device_id: &str, intent: DeviceIntent) {
        lock(&self.states).insert(device_id.to_string(), intent);
    }

    #[cfg(test)]
    pub fn set_failing(&self, device_id: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(device_id.to_string());
        } else {
            set.remove(device_id);
        }
    }

    pub fn state(&self, device_id: &str) -> Option<DeviceIntent> {
        lock(&self.states).get(device_id).copied()
    }

    #[cfg(test)]
    pub fn commands(&self) -> Vec<(String, DeviceIntent)> {
        lock(&self.commands).clone()
    }

    #[cfg(test)]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    async fn simulate_io(&self, device: &DeviceConfig) -> Result<(), DeviceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if lock(&self.failing).contains(&device.device_id) {
            return Err(DeviceError::Unreachable(format!(
                "simulated failure for {}",
                device.label()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PlugPort for SimulatedPlug {
    async fn set_state(
        &self,
        device: &DeviceConfig,
        intent: DeviceIntent,
    ) -> Result<(), DeviceError> {
        self.simulate_io(device).await?;
        lock(&self.commands).push((device.device_id.clone(), intent));
        lock(&self.states).insert(device.device_id.clone(), intent);
        info!(device = %device.label(), intent = intent.as_str(), "simulated plug switched");
        Ok(())
    }

    async fn get_state(&self, device: &DeviceConfig) -> Result<DeviceIntent, DeviceError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.simulate_io(device).await?;
        Ok(self
            .state(&device.device_id)
            .unwrap_or(DeviceIntent::Off))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use tokio::net::TcpListener;

    use super::*;

    fn device() -> DeviceConfig {
        DeviceConfig {
            device_id: "plug-1".to_string(),
            device_ip: "10.0.0.5".to_string(),
            topic: None,
            dp_id: 1,
        }
    }

    /// Minimal MQTT 3.1.1 broker that behaves like Tasmota plugs: a command
    /// on `cmnd/<base>/POWER` is answered on `stat/<base>/POWER`, but only to
    /// connections that subscribed to it.
    mod broker {
        use std::{
            collections::{HashMap, HashSet},
            sync::{Arc, Mutex},
        };

        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::{TcpListener, TcpStream},
        };

        #[derive(Default)]
        pub struct FakeBroker {
            pub(super) relays: Mutex<HashMap<String, String>>,
            /// Relay ignores commands and always reports OFF.
            pub stuck_off: bool,
            /// Publish ON to every other subscribed topic before replying.
            pub noisy: bool,
        }

        pub fn spawn(listener: TcpListener, broker: FakeBroker) {
            let broker = Arc::new(broker);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, broker).await;
                    });
                }
            });
        }

        async fn serve(mut stream: TcpStream, broker: Arc<FakeBroker>) -> std::io::Result<()> {
            let mut subscribed: HashSet<String> = HashSet::new();
            loop {
                let (header, body) = read_packet(&mut stream).await?;
                match header >> 4 {
                    // CONNECT
                    1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?,
                    // PUBLISH
                    3 => {
                        let qos = (header >> 1) & 0x03;
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                        let mut offset = 2 + topic_len;
                        if qos > 0 {
                            stream.write_all(&encode(0x40, &body[offset..offset + 2])).await?;
                            offset += 2;
                        }
                        let payload = String::from_utf8_lossy(&body[offset..]).into_owned();

                        let Some(base) = topic.strip_prefix("cmnd/") else {
                            continue;
                        };
                        let reply_topic = format!("stat/{base}");
                        let value = broker.switch(&reply_topic, &payload);

                        if broker.noisy {
                            for other in subscribed.iter().filter(|t| **t != reply_topic) {
                                stream.write_all(&publish(other, "ON")).await?;
                            }
                        }
                        if subscribed.contains(&reply_topic) {
                            stream.write_all(&publish(&reply_topic, &value)).await?;
                        }
                    }
                    // SUBSCRIBE
                    8 => {
                        let mut ack = body[..2].to_vec();
                        let mut rest = &body[2..];
                        while rest.len() >= 3 {
                            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                            subscribed
                                .insert(String::from_utf8_lossy(&rest[2..2 + len]).into_owned());
                            ack.push(0x01);
                            rest = &rest[3 + len..];
                        }
                        stream.write_all(&encode(0x90, &ack)).await?;
                    }
                    // PINGREQ
                    12 => stream.write_all(&[0xD0, 0x00]).await?,
                    // DISCONNECT
                    14 => return Ok(()),
                    _ => {}
                }
            }
        }

        impl FakeBroker {
            fn switch(&self, reply_topic: &str, payload: &str) -> String {
                let mut relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
                if payload == "ON" || payload == "OFF" {
                    relays.insert(reply_topic.to_string(), payload.to_string());
                }
                if self.stuck_off {
                    return "OFF".to_string();
                }
                relays
                    .get(reply_topic)
                    .cloned()
                    .unwrap_or_else(|| "OFF".to_string())
            }
        }

        async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
            let header = stream.read_u8().await?;
            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await?;
                len |= usize::from(byte & 0x7f) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; len];
            stream.read_exact(&mut body).await?;
            Ok((header, body))
        }

        fn encode(header: u8, body: &[u8]) -> Vec<u8> {
            let mut out = vec![header];
            let mut len = body.len();
            loop {
                let mut byte = (len % 128) as u8;
                len /= 128;
                if len > 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if len == 0 {
                    break;
                }
            }
            out.extend_from_slice(body);
            out
        }

        fn publish(topic: &str, payload: &str) -> Vec<u8> {
            let mut body = (topic.len() as u16).to_be_bytes().to_vec();
            body.extend_from_slice(topic.as_bytes());
            body.extend_from_slice(payload.as_bytes());
            encode(0x30, &body)
        }
    }

    fn mqtt_config(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: format!("smartplug-test-{port}"),
            ..MqttConfig::default()
        }
    }

    fn mqtt_device(id: &str) -> DeviceConfig {
        DeviceConfig {
            device_id: id.to_string(),
            device_ip: String::new(),
            topic: None,
            dp_id: 1,
        }
    }

    async fn start_broker(broker: broker::FakeBroker) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let port = listener.local_addr().expect("broker addr").port();
        broker::spawn(listener, broker);
        port
    }

    /// Subscriptions go out asynchronously after ConnAck, so early requests
    /// may go unanswered. Retries until the plug replies at all.
    async fn first_reply<T, F, Fut>(mut call: F) -> Result<T, DeviceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Ok(result) = tokio::time::timeout(Duration::from_millis(500), call()).await {
                return result;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "plug never answered"
            );
        }
    }

    #[tokio::test]
    async fn mqtt_plug_switches_and_reads_back() {
        let port = start_broker(broker::FakeBroker::default()).await;
        let cancel = CancellationToken::new();
        let device = mqtt_device("desk");
        let plug = MqttPlug::connect(&mqtt_config(port), [&device], cancel.clone());

        assert_eq!(
            first_reply(|| plug.get_state(&device)).await,
            Ok(DeviceIntent::Off)
        );
        assert_eq!(plug.set_state(&device, DeviceIntent::On).await, Ok(()));
        assert_eq!(plug.get_state(&device).await, Ok(DeviceIntent::On));
        cancel.cancel();
    }

    #[tokio::test]
    async fn mqtt_plug_reports_relay_that_did_not_follow() {
        let port = start_broker(broker::FakeBroker {
            stuck_off: true,
            ..Default::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let device = mqtt_device("stuck");
        let plug = MqttPlug::connect(&mqtt_config(port), [&device], cancel.clone());

        assert_eq!(
            first_reply(|| plug.set_state(&device, DeviceIntent::On)).await,
            Err(DeviceError::Rejected {
                requested: "ON",
                reported: "OFF",
            })
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn mqtt_plug_ignores_replies_for_other_plugs() {
        let port = start_broker(broker::FakeBroker {
            noisy: true,
            ..Default::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let desk = mqtt_device("desk");
        let couch = mqtt_device("couch");
        let plug = MqttPlug::connect(&mqtt_config(port), [&desk, &couch], cancel.clone());

        // Subscriptions go out in order, so once couch answers desk is live too.
        assert_eq!(
            first_reply(|| plug.get_state(&couch)).await,
            Ok(DeviceIntent::Off)
        );
        // The broker shouts ON on couch's topic before answering for desk.
        assert_eq!(plug.get_state(&desk).await, Ok(DeviceIntent::Off));
        cancel.cancel();
    }

    #[tokio::test]
    async fn mqtt_plug_recovers_after_outage_with_full_request_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let cancel = CancellationToken::new();
        let device = mqtt_device("desk");
        let plug = Arc::new(MqttPlug::connect(
            &mqtt_config(port),
            [&device],
            cancel.clone(),
        ));

        // Nothing is listening: every request piles up until the queue is full.
        let mut pending = Vec::new();
        for _ in 0..REQUEST_CAPACITY + 8 {
            let plug = plug.clone();
            let device = device.clone();
            pending.push(tokio::spawn(async move {
                let _ = tokio::time::timeout(Duration::from_millis(300), plug.get_state(&device))
                    .await;
            }));
        }
        for task in pending {
            task.await.expect("join");
        }

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("rebind broker port");
        broker::spawn(listener, broker::FakeBroker::default());

        assert_eq!(
            first_reply(|| plug.get_state(&device)).await,
            Ok(DeviceIntent::Off)
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn simulated_plug_tracks_state_and_commands() {
        let plug = SimulatedPlug::new();
        assert_eq!(plug.get_state(&device()).await, Ok(DeviceIntent::Off));

        plug.set_state(&device(), DeviceIntent::On)
            .await
            .expect("simulated set");
        assert_eq!(plug.get_state(&device()).await, Ok(DeviceIntent::On));
        assert_eq!(
            plug.commands(),
            vec![("plug-1".to_string(), DeviceIntent::On)]
        );
        assert_eq!(plug.query_count(), 2);
    }

    #[tokio::test]
    async fn simulated_plug_failure_injection() {
        let plug = SimulatedPlug::new();
        plug.set_failing("plug-1", true);

        assert!(matches!(
            plug.set_state(&device(), DeviceIntent::On).await,
            Err(DeviceError::Unreachable(_))
        ));
        assert!(plug.commands().is_empty());

        plug.set_failing("plug-1", false);
        assert!(plug.set_state(&device(), DeviceIntent::On).await.is_ok());
    }
}
