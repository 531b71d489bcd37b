// Ingest service configuration. A YAML document named on the command line
// is the source of truth; a couple of bind addresses can be overridden from
// the environment for local development.
use anyhow::{Context, Result, bail};
use fleetline_pipeline::{AckConfig, RateLimitConfig};
use fleetline_transport::TransportConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:4443";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_ACK_QUEUE_CAPACITY: usize = 64;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_INFLIGHT_TTL_SECS: u64 = 30;
const DEFAULT_ACK_SWEEP_SECS: u64 = 5;
const DEFAULT_ACK_CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 100;
const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PRODUCER_QUEUE_DEPTH: usize = 1024;
const DEFAULT_RATE_CAPACITY: u32 = 100;
const DEFAULT_RATE_REFILL_PER_SEC: f64 = 50.0;
const DEFAULT_RATE_IDLE_EVICTION_SECS: u64 = 900;
const DEFAULT_RATE_SWEEP_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// QUIC listener bind address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Prometheus scrape endpoint bind address.
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: SocketAddr,
    pub tls: TlsConfig,
    /// Topic/subject prefix isolating environments on shared backends.
    pub namespace: String,
    /// Emit decoded JSON payloads instead of raw protobuf bytes.
    #[serde(default)]
    pub transmit_decoded_records: bool,
    /// Record type tag to ordered producer fan-out list.
    #[serde(default)]
    pub records: HashMap<String, Vec<String>>,
    /// Record type tag to the single producer whose acceptance acks the
    /// vehicle.
    #[serde(default)]
    pub reliable_ack_sources: HashMap<String, String>,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub ack: AckSection,
    #[serde(default)]
    pub producers: ProducersSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    /// CA bundle that vehicle client certificates must chain to.
    pub client_ca: PathBuf,
    #[serde(default)]
    pub identity_source: IdentitySource,
}

/// Which certificate field carries the device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    #[default]
    CommonName,
    SanUri,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub idle_eviction_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_RATE_CAPACITY,
            refill_per_sec: DEFAULT_RATE_REFILL_PER_SEC,
            idle_eviction_secs: DEFAULT_RATE_IDLE_EVICTION_SECS,
            sweep_interval_secs: DEFAULT_RATE_SWEEP_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub max_frame_bytes: usize,
    pub ack_queue_capacity: usize,
    pub drain_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            ack_queue_capacity: DEFAULT_ACK_QUEUE_CAPACITY,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AckSection {
    pub inflight_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for AckSection {
    fn default() -> Self {
        Self {
            inflight_ttl_secs: DEFAULT_INFLIGHT_TTL_SECS,
            sweep_interval_secs: DEFAULT_ACK_SWEEP_SECS,
            channel_capacity: DEFAULT_ACK_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducersSection {
    pub publish_timeout_ms: u64,
    pub close_timeout_secs: u64,
    pub queue_depth: usize,
    pub kafka: Option<KafkaSection>,
    pub nats: Option<NatsSection>,
    pub mqtt: Option<MqttSection>,
    pub file: Option<FileSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSection {
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsSection {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// What to do when the broker session drops.
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,
}

/// Severity of a backend session drop. `Reconnect` keeps retrying with
/// backoff; `Error` reports every drop through the producer error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    #[default]
    Reconnect,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSection {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub service_name: String,
    /// OTLP collector endpoint for trace export; local logging only when
    /// unset.
    pub otlp_endpoint: Option<String>,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            service_name: "fleetline-ingest".to_string(),
            otlp_endpoint: None,
        }
    }
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN.parse().expect("default listen addr")
}

fn default_metrics_bind() -> SocketAddr {
    DEFAULT_METRICS_BIND.parse().expect("default metrics addr")
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "fleetline-ingest".to_string()
}

impl IngestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut config: IngestConfig =
            serde_yaml::from_str(&contents).context("parse config yaml")?;
        if let Ok(value) = std::env::var("FLEETLINE_LISTEN") {
            config.listen = value.parse().context("parse FLEETLINE_LISTEN")?;
        }
        if let Ok(value) = std::env::var("FLEETLINE_METRICS_BIND") {
            config.metrics_bind = value.parse().context("parse FLEETLINE_METRICS_BIND")?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("namespace must not be empty");
        }
        if self.connection.max_frame_bytes == 0 {
            bail!("connection.max_frame_bytes must be positive");
        }
        for (type_tag, producer) in &self.reliable_ack_sources {
            let in_fanout = self
                .records
                .get(type_tag)
                .map(|names| names.iter().any(|n| n == producer))
                .unwrap_or(false);
            if !in_fanout {
                bail!(
                    "reliable_ack_sources[{type_tag}] = {producer} is not in that tag's records list"
                );
            }
        }
        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.rate_limit.enabled,
            capacity: self.rate_limit.capacity,
            refill_per_sec: self.rate_limit.refill_per_sec,
            idle_ttl: Duration::from_secs(self.rate_limit.idle_eviction_secs),
        }
    }

    pub fn ack_config(&self) -> AckConfig {
        AckConfig {
            inflight_ttl: Duration::from_secs(self.ack.inflight_ttl_secs),
            sweep_interval: Duration::from_secs(self.ack.sweep_interval_secs),
            channel_capacity: self.ack.channel_capacity,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            keep_alive_interval: Duration::from_secs(self.connection.keep_alive_secs),
            max_idle_timeout: Duration::from_secs(self.connection.idle_timeout_secs),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.drain_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.producers.publish_timeout_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.producers.close_timeout_secs.max(1))
    }
}

impl Default for ProducersSection {
    fn default() -> Self {
        Self {
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            queue_depth: DEFAULT_PRODUCER_QUEUE_DEPTH,
            kafka: None,
            nats: None,
            mqtt: None,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
namespace: tesla_telemetry
tls:
  server_cert: /etc/fleetline/server.pem
  server_key: /etc/fleetline/server.key
  client_ca: /etc/fleetline/fleet-ca.pem
records:
  V: [kafka, file]
  alerts: [kafka]
reliable_ack_sources:
  V: kafka
producers:
  kafka:
    brokers: ["127.0.0.1:9092"]
  file:
    path: /var/log/fleetline/records.jsonl
"#;

    #[test]
    fn minimal_document_applies_defaults() {
        let config: IngestConfig = serde_yaml::from_str(MINIMAL).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!(config.connection.ack_queue_capacity, 64);
        assert_eq!(config.ack.inflight_ttl_secs, 30);
        assert_eq!(config.producers.publish_timeout_ms, 100);
        assert!(!config.transmit_decoded_records);
        assert!(config.monitoring.otlp_endpoint.is_none());
        assert_eq!(config.tls.identity_source, IdentitySource::CommonName);
        assert_eq!(config.records["V"], vec!["kafka", "file"]);
        assert_eq!(config.reliable_ack_sources["V"], "kafka");
    }

    #[test]
    fn ack_source_outside_fanout_fails_validation() {
        let mut config: IngestConfig = serde_yaml::from_str(MINIMAL).expect("parse");
        config
            .reliable_ack_sources
            .insert("alerts".to_string(), "file".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_namespace_fails_validation() {
        let mut config: IngestConfig = serde_yaml::from_str(MINIMAL).expect("parse");
        config.namespace.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn identity_source_parses_san_uri() {
        let doc = MINIMAL.replace(
            "  client_ca: /etc/fleetline/fleet-ca.pem",
            "  client_ca: /etc/fleetline/fleet-ca.pem\n  identity_source: san_uri",
        );
        let config: IngestConfig = serde_yaml::from_str(&doc).expect("parse");
        assert_eq!(config.tls.identity_source, IdentitySource::SanUri);
    }
}
