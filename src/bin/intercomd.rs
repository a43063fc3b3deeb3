//! intercomd - doorbell intercom face identification daemon
//!
//! This daemon:
//! 1. Ingests the camera's MJPEG stream and keeps it alive with a watchdog
//! 2. Serves the current frame and stream health over HTTP
//! 3. Listens for Home Assistant button presses over MQTT
//! 4. Runs enrollment and recognition on request and unlocks on a match

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use intercom_faceid::transport::{
    connect_mqtt, parse_mqtt_endpoint, run_command_loop, validate_loopback_addr, CommandTopics,
    MqttDoorLock, MqttSettings, DEFAULT_TOPIC_PREFIX,
};
use intercom_faceid::{
    embed, Command, CommandDispatcher, DoorLock, IdentityStore, Intercom, IntercomConfig,
    LogDoorLock, RelayServer, StreamIngestor, WatchdogMonitor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Doorbell intercom face identification daemon")]
struct Args {
    /// MQTT broker address (`host:port`, `mqtt://`, `mqtts://`).
    /// Only loopback brokers are accepted unless --allow-remote-mqtt is set.
    #[arg(long, env = "MQTT_BROKER", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow a broker on another host, e.g. the Home Assistant `core-mosquitto` add-on.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// PEM CA certificate for `mqtts://` brokers (system roots when unset).
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "intercom_faceid")]
    mqtt_client_id: String,

    /// Prefix of the button and latch topics.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,

    /// Run without MQTT: no remote commands, unlocks are only logged.
    #[arg(long, env = "INTERCOM_NO_MQTT")]
    no_mqtt: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = IntercomConfig::load()?;

    log::info!("intercomd starting");
    log::info!("  stream: {}", cfg.stream.url);
    log::info!("  identities: {}", cfg.store_path.display());
    log::info!(
        "  thresholds: recognition {}, dedup {}",
        cfg.recognition_threshold,
        cfg.dedup_threshold
    );
    if cfg.unlock_on_enroll {
        log::warn!("  unlock_on_enroll is enabled: a successful enrollment opens the door");
    }

    let store = IdentityStore::load_or_quarantine(&cfg.store_path)?;
    let embedder = embed::from_config(&cfg)?;
    if embedder.is_none() {
        log::warn!("  recognition and enrollment are disabled; manual unlock and relay only");
    }

    let stream = Arc::new(StreamIngestor::new(cfg.stream.clone())?);
    if let Err(err) = stream.start() {
        log::error!("initial stream start failed: {:#}", err);
    }
    let watchdog = WatchdogMonitor::new(stream.clone(), cfg.watchdog).spawn()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();

    let mut mqtt_client = None;
    let lock: Arc<dyn DoorLock> = if args.no_mqtt {
        log::warn!("mqtt disabled; unlocks are logged only");
        drop(command_tx);
        Arc::new(LogDoorLock)
    } else {
        let endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr)?;
        if !args.allow_remote_mqtt {
            validate_loopback_addr(&endpoint, &args.mqtt_broker_addr)?;
        } else {
            log::warn!("remote MQTT enabled - ensure broker is in a trusted network");
        }
        let settings = MqttSettings {
            endpoint,
            client_id: args.mqtt_client_id.clone(),
            username: args.mqtt_username.clone(),
            password: args.mqtt_password.clone(),
            ca_path: args.mqtt_tls_ca_path.clone(),
        };
        let (client, mut connection) = connect_mqtt(&settings)?;
        let topics = CommandTopics::from_prefix(&args.topic_prefix);
        let loop_client = client.clone();
        let loop_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("mqtt-commands".to_string())
            .spawn(move || {
                run_command_loop(
                    &loop_client,
                    &mut connection,
                    &topics,
                    &command_tx,
                    &loop_shutdown,
                )
            })
            .context("spawn mqtt thread")?;
        let lock = MqttDoorLock::new(client.clone(), &args.topic_prefix);
        log::info!("  latch topic: {}", lock.topic());
        mqtt_client = Some(client);
        Arc::new(lock)
    };

    let intercom = Arc::new(match embedder {
        Some(embedder) => Intercom::new(
            stream.clone(),
            store,
            embedder,
            lock,
            cfg.intercom_settings(),
        ),
        None => Intercom::without_recognition(stream.clone(), store, lock, cfg.intercom_settings()),
    });
    log::info!("  enrolled identities: {}", intercom.identity_count());

    let relay = RelayServer::new(cfg.relay_config(), intercom.clone()).spawn()?;

    let worker_intercom = intercom.clone();
    std::thread::Builder::new()
        .name("command-worker".to_string())
        .spawn(move || CommandDispatcher::for_intercom().run(&worker_intercom, command_rx))
        .context("spawn command worker")?;

    let (signal_tx, signal_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("intercomd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = signal_rx.recv();
    log::info!("shutdown signal received, stopping...");

    shutdown.store(true, Ordering::SeqCst);
    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect() {
            log::warn!("mqtt disconnect failed: {}", err);
        }
    }
    watchdog.stop();
    relay.stop()?;
    stream.stop();
    log::info!("intercomd stopped");
    Ok(())
}
