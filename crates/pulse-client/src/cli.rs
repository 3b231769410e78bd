//! Command-line surface of the `pulse-client` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ClientConfig, FailedOfferPolicyKind, TransportKind};
use crate::error::Result;

/// Heartbeat client for a leader-based cluster.
#[derive(Debug, Parser)]
#[command(name = "pulse-client")]
#[command(about = "Keeps a cluster session alive and streams sequenced requests", long_about = None)]
pub struct Cli {
    /// Config file (TOML or JSON); flags and env vars override it.
    #[arg(short, long, env = "PULSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport working directory.
    #[arg(long, env = "MEM_DIR")]
    pub mem_dir: Option<PathBuf>,

    /// Channel the cluster replies on.
    #[arg(long, env = "PULSE_EGRESS_CHANNEL")]
    pub egress_channel: Option<String>,

    /// Channel requests are sent on.
    #[arg(long, env = "PULSE_INGRESS_CHANNEL")]
    pub ingress_channel: Option<String>,

    /// Cluster members as `id=host:port,...`.
    #[arg(long, env = "PULSE_INGRESS_ENDPOINTS")]
    pub ingress_endpoints: Option<String>,

    /// Transport backend.
    #[arg(long, value_enum, env = "PULSE_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// Delivery loop period in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Keep-alive period in milliseconds.
    #[arg(long)]
    pub keep_alive_ms: Option<u64>,

    /// Message period in milliseconds.
    #[arg(long)]
    pub message_interval_ms: Option<u64>,

    /// Messages per message tick.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Offer attempts per message.
    #[arg(long)]
    pub offer_retries: Option<u32>,

    /// What to do with a message whose offer exhausted its retries.
    #[arg(long, value_enum)]
    pub failed_offer_policy: Option<FailedOfferPolicyKind>,

    /// Bound on retained messages with the redeliver policy.
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Give up if no session opens within this many milliseconds.
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Loads the config file if one was given, then applies flags and env vars.
    pub fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };

        if let Some(dir) = self.mem_dir {
            config.transport_dir = dir;
        }
        if let Some(channel) = self.egress_channel {
            config.egress_channel = channel;
        }
        if let Some(channel) = self.ingress_channel {
            config.ingress_channel = channel;
        }
        if let Some(endpoints) = self.ingress_endpoints {
            config.ingress_endpoints = endpoints;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(ms) = self.tick_ms {
            config.tick_interval_ms = ms;
        }
        if let Some(ms) = self.keep_alive_ms {
            config.keep_alive_interval_ms = ms;
        }
        if let Some(ms) = self.message_interval_ms {
            config.message_interval_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(retries) = self.offer_retries {
            config.offer_retry_limit = retries;
        }
        if let Some(policy) = self.failed_offer_policy {
            config.failed_offer_policy = policy;
        }
        if let Some(max) = self.max_pending {
            config.max_pending = max;
        }
        if self.connect_timeout_ms.is_some() {
            config.connect_timeout_ms = self.connect_timeout_ms;
        }

        Ok(config)
    }
}
