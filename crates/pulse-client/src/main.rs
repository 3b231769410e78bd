#![warn(missing_docs)]

//! Pulse client: keeps a cluster session alive and streams sequenced requests

use anyhow::Context;
use clap::Parser;
use pulse_client::{
    Cli, ClientConfig, DeliveryLoop, LoggingListener, SessionClient, TransportKind,
};
use pulse_transport::{
    BackoffIdleStrategy, ClusterTransport, SimCluster, SimClusterConfig, TcpTransport,
    TcpTransportConfig,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run<T: ClusterTransport>(
    transport: T,
    config: &ClientConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut session = SessionClient::new(transport, Box::new(BackoffIdleStrategy::default()))
        .with_connect_timeout(config.connect_timeout());

    let connected = match session.connect(&cancel).await {
        Ok(connected) => connected.clone(),
        Err(pulse_client::ClientError::Cancelled) => return Ok(()),
        Err(err) => return Err(err).context("initial connect failed"),
    };
    tracing::info!(
        session_id = ?connected.session_id,
        leader_member_id = ?connected.leader_member_id,
        "connected to cluster"
    );

    let mut delivery = DeliveryLoop::new(session, config.delivery_config(), Instant::now());
    delivery.run(&cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.into_config()?;
    tracing::info!(config = %serde_json::to_string(&config)?, "pulse client starting");
    config.validate()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });

    let listener = LoggingListener::new();
    let listener_stats = listener.stats();

    match config.transport {
        TransportKind::Tcp => {
            let transport = TcpTransport::spawn(
                config.ingress_endpoints()?,
                TcpTransportConfig::default(),
                Box::new(listener),
            )?;
            run(transport, &config, cancel).await?;
        }
        TransportKind::Sim => {
            let cluster = SimCluster::new(SimClusterConfig {
                members: config.ingress_endpoints()?.len() as u32,
                payload_history: 0,
                ..Default::default()
            });
            run(cluster.transport(Box::new(listener)), &config, cancel).await?;
        }
    }

    let stats = listener_stats.snapshot();
    tracing::info!(
        connects = stats.connects,
        disconnects = stats.disconnects,
        leader_changes = stats.leader_changes,
        errors = stats.errors,
        "pulse client stopped"
    );
    Ok(())
}
