//! MQTT command surface and door-latch publisher.
//!
//! Home Assistant buttons publish to `<prefix>/button/<action>/set`. Each
//! recognised topic becomes a `Command` on the dispatcher channel. The latch
//! itself is driven by a serial bridge listening on `<prefix>/lock/door/set`.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::dispatch::{Command, CommandKind};
use crate::lock::DoorLock;
use crate::transport::MqttEndpoint;

pub const DEFAULT_TOPIC_PREFIX: &str = "homeassistant";

/// Payload Home Assistant buttons send when pressed without a value.
const BUTTON_PRESS: &str = "PRESS";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Topic to command table for one prefix.
#[derive(Clone, Debug)]
pub struct CommandTopics {
    routes: Vec<(String, CommandKind)>,
}

impl CommandTopics {
    pub fn from_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let routes = vec![
            (
                format!("{prefix}/button/learn_new_face/set"),
                CommandKind::LearnNewFace,
            ),
            (
                format!("{prefix}/button/recognize_face/set"),
                CommandKind::RecognizeFace,
            ),
            (
                format!("{prefix}/button/unlock_door/set"),
                CommandKind::Unlock,
            ),
        ];
        Self { routes }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(topic, _)| topic.as_str())
    }

    /// Map a publish to a command. Unknown topics yield `None`.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Option<Command> {
        let kind = self
            .routes
            .iter()
            .find(|(route, _)| route == topic)
            .map(|(_, kind)| *kind)?;
        Some(match kind {
            CommandKind::LearnNewFace => Command::LearnNewFace {
                name: name_from_payload(payload),
            },
            CommandKind::RecognizeFace => Command::RecognizeFace,
            CommandKind::Unlock => Command::Unlock,
        })
    }
}

fn name_from_payload(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case(BUTTON_PRESS) {
        return None;
    }
    Some(text.to_string())
}

/// Broker connection parameters.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_path: Option<PathBuf>,
}

pub fn connect_mqtt(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = &settings.endpoint;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    options.set_transport(endpoint.transport(settings.ca_path.as_deref())?);

    let (client, connection) = Client::new(options, 10);
    log::info!(
        "mqtt client configured for {}:{} (tls: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

/// Drive the connection, forwarding recognised publishes as commands.
///
/// Subscribes on every ConnAck. Connection errors are retried after a fixed
/// delay. Returns when `shutdown` is set and the connection errors out, or
/// when the command receiver is gone.
pub fn run_command_loop(
    client: &Client,
    connection: &mut Connection,
    topics: &CommandTopics,
    commands: &Sender<Command>,
    shutdown: &AtomicBool,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("mqtt connected");
                for topic in topics.topics() {
                    if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce) {
                        log::error!("mqtt subscribe to {} failed: {}", topic, err);
                    } else {
                        log::info!("subscribed to {}", topic);
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic,
                    Err(err) => {
                        log::warn!("skipping publish with invalid topic: {}", err);
                        continue;
                    }
                };
                match topics.parse(topic, &publish.payload) {
                    Some(command) => {
                        if commands.send(command).is_err() {
                            log::info!("command channel closed; leaving mqtt loop");
                            return;
                        }
                    }
                    None => log::debug!("ignoring publish on {}", topic),
                }
            }
            Ok(_) => {}
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("mqtt connection error: {}. reconnecting...", err);
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
    log::info!("mqtt loop stopped");
}

/// Publishes `unlock` to the latch topic.
#[derive(Clone)]
pub struct MqttDoorLock {
    client: Client,
    topic: String,
}

impl MqttDoorLock {
    pub fn new(client: Client, prefix: &str) -> Self {
        Self {
            client,
            topic: Self::topic_for(prefix),
        }
    }

    pub fn topic_for(prefix: &str) -> String {
        format!("{}/lock/door/set", prefix.trim_end_matches('/'))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl DoorLock for MqttDoorLock {
    fn unlock(&self) -> Result<()> {
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, b"unlock".to_vec())
            .with_context(|| format!("publish unlock to {}", self.topic))?;
        log::info!("door unlock published to {}", self.topic);
        Ok(())
    }
}
