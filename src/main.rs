use std::{
    process,
    sync::{Arc, OnceLock},
};

use relaybee::{
    config::Config,
    core::{readiness::Readiness, soak::SoakRunner},
    logger::LoggerManager,
    print_error,
};
use relaybee_client::{transport::memory::MemoryNetwork, ConnectionBuilder, ConnectionEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Builds the cluster: one node per seed server, the gossip-only peers, and the stream.
fn build_network(cfg: &Config) -> MemoryNetwork {
    let network = MemoryNetwork::new();

    for server in cfg.client.servers.iter().chain(&cfg.soak.gossip_peers) {
        match network.add_node(server) {
            Ok(addr) => debug!("Cluster node {addr} up"),
            Err(e) => {
                error!("Failed to add cluster node {server}: {e}");
                process::exit(1);
            }
        }
    }

    let subjects: Vec<&str> = cfg.soak.stream_subjects.iter().map(String::as_str).collect();
    network.add_stream(&cfg.soak.stream, &subjects);
    network
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connected { server } => info!("Event: connected to {server}"),
        ConnectionEvent::Disconnected { reason } => warn!("Event: disconnected ({reason})"),
        ConnectionEvent::Reconnected { server } => info!("Event: reconnected to {server}"),
        ConnectionEvent::Closed => warn!("Event: connection closed"),
        ConnectionEvent::AsyncError { sid, error } => match sid {
            Some(sid) => warn!("Event: async error on subscription {sid}: {error}"),
            None => warn!("Event: async error: {error}"),
        },
        ConnectionEvent::ServersDiscovered { servers } => {
            info!("Event: discovered servers {}", servers.join(", "))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting relaybee version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.client);
    info!("Log level: {}", cfg.logger.level);

    let network = build_network(cfg);
    let readiness = Readiness::default();

    let conn = ConnectionBuilder::new(cfg.client.clone())
        .transport(network.clone())
        .on_connected(log_event)
        .on_disconnected(log_event)
        .on_reconnected(log_event)
        .on_closed(log_event)
        .on_async_error(log_event)
        .on_servers_discovered(log_event)
        .connect()
        .await
        .unwrap_or_else(|e| {
            error!("Failed to connect: {}", e);
            process::exit(1);
        });
    readiness.start_listening(conn.subscribe_state());

    if let (Some(seed), false) = (cfg.client.servers.first(), cfg.soak.gossip_peers.is_empty()) {
        let peers: Vec<&str> = cfg.soak.gossip_peers.iter().map(String::as_str).collect();
        network.announce(seed, &peers);
    }

    let cancel = CancellationToken::new();
    let runner = SoakRunner::new(
        conn.clone(),
        network,
        Arc::new(cfg.soak.clone()),
        readiness,
    );
    let mut soak = tokio::spawn(runner.run(cancel.clone()));

    info!("Starting soak workload...");

    let result = tokio::select! {
        result = &mut soak => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            cancel.cancel();
            soak.await
        }
    };

    conn.close().await;

    match result {
        Ok(Ok(report)) => {
            info!("Shutdown complete: {report}");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Soak failed: {}", e);
            process::exit(2);
        }
        Err(e) => {
            error!("Soak task aborted: {}", e);
            process::exit(2);
        }
    }
}
