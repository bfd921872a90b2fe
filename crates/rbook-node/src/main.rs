mod maintenance;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tracing::warn;

use rbook_coordinator::Coordinator;
use rbook_replication::{PeerRegistry, Replicator};
use rbook_server::AppState;
use rbook_storage::{MemTable, RecordStore, RedisCache};
use rbook_types::Peer;

use maintenance::MaintenanceConfig;

#[derive(clap::Parser, Debug)]
#[command(name = "rbook-node", about = "Rollbook replicated student store node")]
struct Cli {
    #[arg(long)]
    node_id: u64,
    /// Raft RPC address of this node.
    #[arg(long, default_value = "127.0.0.1:9301")]
    raft_addr: String,
    /// Port of the client HTTP surface.
    #[arg(long, default_value_t = 8080)]
    http_port: u16,
    /// Peer specs: "id=raft_addr=http_port", repeatable. Empty means this
    /// node bootstraps the cluster.
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StoreConfig {
    data_dir: String,
}

#[derive(Debug, Deserialize)]
struct CacheConfig {
    addr: String,
    password: String,
    db: i64,
}

#[derive(Debug, Deserialize)]
struct MemoryConfig {
    capacity: usize,
    evict_ratio: f64,
}

#[derive(Debug, Deserialize)]
struct PreheatConfig {
    load_ratio: f64,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    reload_interval_secs: u64,
    periodic_delete_interval_secs: u64,
    examine_size: usize,
}

#[derive(Debug, Deserialize)]
struct SnapshotConfig {
    dir: String,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    store: StoreConfig,
    cache: CacheConfig,
    memory: MemoryConfig,
    preheat: PreheatConfig,
    server: ServerConfig,
    snapshot: SnapshotConfig,
    observability: ObservabilityConfig,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.memory.evict_ratio > 0.0 && self.memory.evict_ratio <= 1.0) {
            anyhow::bail!("memory.evict_ratio must be in (0, 1], got {}", self.memory.evict_ratio);
        }
        if !(0.0..=1.0).contains(&self.preheat.load_ratio) {
            anyhow::bail!("preheat.load_ratio must be in [0, 1], got {}", self.preheat.load_ratio);
        }
        Ok(())
    }
}

/// Parse a peer spec of the form `id=raft_addr=http_port`.
fn parse_peer(spec: &str) -> anyhow::Result<Peer> {
    let mut parts = spec.splitn(3, '=');
    let (Some(id), Some(raft_addr), Some(http_port)) =
        (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("peer spec {spec:?} is not id=raft_addr=http_port");
    };
    Ok(Peer {
        node_id: id.parse().with_context(|| format!("bad peer id in {spec:?}"))?,
        raft_addr: raft_addr.to_string(),
        http_port: http_port.parse().with_context(|| format!("bad peer port in {spec:?}"))?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }
    let config: Config = figment
        .merge(Env::prefixed("ROLLBOOK_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate()?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(config.observability.log_level.as_str())
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(config.observability.log_level.as_str())
                .init();
        }
    }

    tracing::info!(
        node_id = cli.node_id,
        raft_addr = %cli.raft_addr,
        http_port = cli.http_port,
        "node starting"
    );

    let node = Peer {
        node_id: cli.node_id,
        raft_addr: cli.raft_addr.clone(),
        http_port: cli.http_port,
    };
    let initial_peers = cli
        .peers
        .iter()
        .map(|spec| parse_peer(spec))
        .collect::<anyhow::Result<Vec<Peer>>>()?;

    let store = RecordStore::open(Path::new(&config.store.data_dir))
        .context("failed to open the store of record")?;
    let cache = RedisCache::connect(&config.cache.addr, &config.cache.password, config.cache.db)
        .await
        .context("failed to connect to the shared cache")?;
    let mem = MemTable::new(config.memory.capacity, config.memory.evict_ratio);
    let peers = Arc::new(PeerRegistry::new(initial_peers));

    let coordinator = Arc::new(Coordinator::new(mem, cache, store, peers.clone()));
    let replicator = Replicator::start(
        node,
        peers,
        coordinator.clone(),
        Path::new(&config.snapshot.dir),
    )
    .await
    .context("failed to start the consensus node")?;

    let client_addr: SocketAddr = format!("0.0.0.0:{}", cli.http_port)
        .parse()
        .with_context(|| format!("invalid http port {}", cli.http_port))?;
    let cluster_addr: SocketAddr = cli
        .raft_addr
        .parse()
        .with_context(|| format!("invalid raft_addr: {}", cli.raft_addr))?;

    // Both listeners must be accepting before the join request goes out:
    // admitting a node makes the leader replicate to this node's raft_addr,
    // so bootstrapping with the cluster port still closed would deadlock.
    let client_listener = tokio::net::TcpListener::bind(client_addr)
        .await
        .with_context(|| format!("failed to bind {client_addr}"))?;
    let cluster_listener = tokio::net::TcpListener::bind(cluster_addr)
        .await
        .with_context(|| format!("failed to bind {cluster_addr}"))?;

    let state = AppState { coordinator: coordinator.clone(), replicator: replicator.clone() };
    let client_task = tokio::spawn(rbook_server::serve_client(client_listener, state));
    let cluster_task =
        tokio::spawn(rbook_server::serve_cluster(cluster_listener, replicator.raft().clone()));

    replicator.bootstrap().await.context("cluster bootstrap failed")?;

    // Preheat the memory tier from the cache; fall back to the store's hot
    // set when the cache scan fails.
    let capacity = config.memory.capacity;
    let load_ratio = config.preheat.load_ratio;
    if let Err(e) = coordinator.load_cache_to_memory(capacity, load_ratio).await {
        warn!(error = %e, "cache preheat failed, loading from the store instead");
        if let Err(e) = coordinator.load_database_to_memory(capacity, load_ratio).await {
            warn!(error = %e, "store preheat failed, starting cold");
        }
    }

    maintenance::spawn_timers(
        replicator.clone(),
        MaintenanceConfig {
            reload_interval: Duration::from_secs(config.server.reload_interval_secs),
            periodic_delete_interval: Duration::from_secs(
                config.server.periodic_delete_interval_secs,
            ),
            examine_size: config.server.examine_size,
        },
    );

    let (client_result, cluster_result) =
        tokio::try_join!(client_task, cluster_task).context("server task failed")?;
    client_result?;
    cluster_result?;

    Ok(())
}
