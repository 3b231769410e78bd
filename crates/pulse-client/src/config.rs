//! Client configuration: defaults, file loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pulse_transport::IngressEndpoints;
use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryConfig, FailedOfferPolicy};
use crate::error::{ClientError, Result};

/// Which transport backend the client talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Framed session protocol over TCP.
    Tcp,
    /// In-process simulated cluster.
    Sim,
}

/// What happens to a message whose offer exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailedOfferPolicyKind {
    /// Log and move on.
    Drop,
    /// Keep it and offer it again first on the next message tick.
    Redeliver,
}

/// Client settings. Loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport working directory; must exist.
    pub transport_dir: PathBuf,
    /// Channel the cluster replies on.
    pub egress_channel: String,
    /// Channel requests are sent on.
    pub ingress_channel: String,
    /// Cluster members as `id=host:port,...`.
    pub ingress_endpoints: String,
    /// Transport backend.
    pub transport: TransportKind,
    /// Delivery loop period.
    pub tick_interval_ms: u64,
    /// Keep-alive period.
    pub keep_alive_interval_ms: u64,
    /// Message period.
    pub message_interval_ms: u64,
    /// Messages per message tick.
    pub batch_size: usize,
    /// Offer attempts per message.
    pub offer_retry_limit: u32,
    /// What to do with a message whose offer exhausted its retries.
    pub failed_offer_policy: FailedOfferPolicyKind,
    /// Retained message bound for the redeliver policy.
    pub max_pending: usize,
    /// Bound on each connect wait; unbounded when absent.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport_dir: PathBuf::new(),
            egress_channel: String::from(
                "aeron:udp?alias=heartbeat-client-response|endpoint=localhost:0",
            ),
            ingress_channel: String::from("aeron:udp?alias=heartbeat-client-request"),
            ingress_endpoints: String::from("0=localhost:9002,1=localhost:9102,2=localhost:9202"),
            transport: TransportKind::Tcp,
            tick_interval_ms: 1,
            keep_alive_interval_ms: 2000,
            message_interval_ms: 1,
            batch_size: 1,
            offer_retry_limit: 3,
            failed_offer_policy: FailedOfferPolicyKind::Drop,
            max_pending: 1024,
            connect_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Reads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ClientError::Config {
                msg: format!("{}: {}", path.display(), e),
            }),
            "json" => serde_json::from_str(&contents).map_err(|e| ClientError::Config {
                msg: format!("{}: {}", path.display(), e),
            }),
            _ => Err(ClientError::Config {
                msg: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Checks every setting; the transport directory must exist.
    pub fn validate(&self) -> Result<()> {
        if self.transport_dir.as_os_str().is_empty() {
            return Err(ClientError::Config {
                msg: "MEM_DIR environment variable is required".to_string(),
            });
        }
        if !self.transport_dir.exists() {
            return Err(ClientError::TransportDirMissing {
                path: self.transport_dir.clone(),
            });
        }
        if !self.transport_dir.is_dir() {
            return Err(ClientError::Config {
                msg: format!("{} is not a directory", self.transport_dir.display()),
            });
        }
        for (name, value) in [
            ("tick_interval_ms", self.tick_interval_ms),
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("message_interval_ms", self.message_interval_ms),
        ] {
            if value == 0 {
                return Err(ClientError::Config {
                    msg: format!("{} must be positive", name),
                });
            }
        }
        if self.batch_size == 0 {
            return Err(ClientError::Config {
                msg: "batch_size must be positive".to_string(),
            });
        }
        if self.offer_retry_limit == 0 {
            return Err(ClientError::Config {
                msg: "offer_retry_limit must be positive".to_string(),
            });
        }
        if self.failed_offer_policy == FailedOfferPolicyKind::Redeliver && self.max_pending == 0 {
            return Err(ClientError::Config {
                msg: "max_pending must be positive with the redeliver policy".to_string(),
            });
        }
        self.ingress_endpoints()?;
        Ok(())
    }

    /// Parsed ingress endpoints.
    pub fn ingress_endpoints(&self) -> Result<IngressEndpoints> {
        Ok(self.ingress_endpoints.parse()?)
    }

    /// Delivery loop period.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Connect wait bound, if any.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Timing and retry settings for the delivery loop.
    pub fn delivery_config(&self) -> DeliveryConfig {
        let failed_offer_policy = match self.failed_offer_policy {
            FailedOfferPolicyKind::Drop => FailedOfferPolicy::Drop,
            FailedOfferPolicyKind::Redeliver => FailedOfferPolicy::Redeliver {
                max_pending: self.max_pending,
            },
        };
        DeliveryConfig {
            tick_interval: self.tick_interval(),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            message_interval: Duration::from_millis(self.message_interval_ms),
            batch_size: self.batch_size,
            offer_retry_limit: self.offer_retry_limit,
            failed_offer_policy,
        }
    }
}
