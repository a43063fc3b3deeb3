//! Broker address parsing and transport selection.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::Path;

/// Where the broker lives and whether to speak TLS to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    pub fn is_loopback(&self) -> bool {
        if self.host == "localhost" {
            return true;
        }
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Plain TCP, TLS against system roots, or TLS against a pinned CA.
    pub fn transport(&self, ca_path: Option<&Path>) -> Result<Transport> {
        match (self.use_tls, ca_path) {
            (false, None) => Ok(Transport::tcp()),
            (false, Some(_)) => Err(anyhow!(
                "MQTT CA certificate given but TLS is disabled; use an mqtts:// broker address"
            )),
            (true, None) => Ok(Transport::tls_with_default_config()),
            (true, Some(path)) => {
                let ca = std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT CA '{}'", path.display()))?;
                Ok(Transport::tls(ca, None, None))
            }
        }
    }
}

/// Parse a broker address.
///
/// Accepts `host:port`, `[v6]:port`, and the `mqtt://`, `tcp://`, `mqtts://`
/// and `ssl://` schemes. The Home Assistant add-on name `core-mosquitto`
/// without a port gets 1883.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, addr)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))
}

/// Refuse non-loopback brokers unless explicitly allowed.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    if endpoint.is_loopback() {
        return Ok(());
    }
    Err(anyhow!(
        "MQTT broker is not loopback: {} (use --allow-remote-mqtt for a trusted network)",
        original
    ))
}
