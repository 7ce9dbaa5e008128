//! `atolld` — the Atoll daemon.
//!
//! Runs one node of the cluster, proxy or target:
//!
//! ```text
//! atolld start                                   # standalone primary proxy
//! atolld start -c atoll.toml                     # with a config file
//! atolld start --role target --join http://p:9080
//! atolld status                                  # print the cluster map
//! ```
//!
//! A proxy terminates client S3 over its public listener and serves the
//! control plane on the intra listener; the first proxy with no join
//! candidates bootstraps as primary. A target serves the object data
//! path, the transform-copy engine, and the QUIC data mover.

mod config;
mod handler;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use atoll_cluster::{BmdOwner, CpClient, SmapOwner};
use atoll_meta::MetaCache;
use atoll_net::{
    cluster_alpn, AddressBook, DataMover, MoverEndpoint, NetError, QuicMover, RecvHandler,
};
use atoll_s3::target::{TargetInner, TargetServer, TargetState};
use atoll_s3::{GatewayInner, GatewayState, S3Gateway};
use atoll_store::{FileStore, MemoryStore, ObjectStore};
use atoll_types::clock::MonoClock;
use atoll_types::{Bmd, Node, NodeId, NodeRole, NodeState, Smap};
use atoll_xcopy::{IdentityTransform, MoverConnector, XcopyConfig, XcopyEngine};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use config::CliConfig;
use handler::{refresh_address_book, CtlInner, CtlState};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "atolld", version, about = "Atoll distributed object storage daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node.
    Start {
        /// Override the node role ("proxy" or "target").
        #[arg(long)]
        role: Option<String>,

        /// Override the data directory.
        #[arg(short = 'd', long)]
        data_dir: Option<PathBuf>,

        /// Join an existing cluster via this control URL.
        #[arg(long)]
        join: Option<String>,

        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,
    },

    /// Show the cluster map of a running node.
    Status {
        /// Control URL of any node.
        #[arg(long, default_value = "http://127.0.0.1:9080")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start {
            role,
            data_dir,
            join,
            memory,
        } => {
            if let Some(role) = role {
                config.node.role = role;
            }
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(url) = join {
                config.cluster.discovery_url = url;
            }
            telemetry::init(&config.log.level);
            start(config, memory).await
        }
        Commands::Status { url } => {
            telemetry::init("warn");
            status(&url).await
        }
    }
}

async fn status(url: &str) -> Result<()> {
    let cp = CpClient::new();
    let smap = cp.fetch_smap(url).await.context("fetching cluster map")?;
    println!("cluster map v{}", smap.version);
    println!("primary: {}", smap.primary);
    println!("proxies: {}", smap.pmap.len());
    println!(
        "targets: {} ({} active)",
        smap.tmap.len(),
        smap.count_active_targets()
    );
    for node in smap.all_nodes() {
        println!("  {:?} {} @ {}", node.role, node.id, node.pub_url());
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Startup
// -----------------------------------------------------------------------

async fn start(config: CliConfig, memory: bool) -> Result<()> {
    let meta = Arc::new(if memory {
        MetaCache::in_memory()
    } else {
        MetaCache::open(config.node.data_dir.join("meta"))?
    });

    let role = match config.node.role.as_str() {
        "proxy" => NodeRole::Proxy,
        "target" => NodeRole::Target,
        other => bail!("unknown role {other:?} (expected proxy or target)"),
    };

    // Node identity is assigned once and survives restarts.
    let node_id = match meta.get_node_id()? {
        Some(id) => id,
        None => {
            let prefix = match role {
                NodeRole::Proxy => 'p',
                NodeRole::Target => 't',
            };
            let id = NodeId::new(format!(
                "{prefix}-{}",
                &Uuid::new_v4().simple().to_string()[..8]
            ));
            meta.put_node_id(&id)?;
            id
        }
    };
    info!(%node_id, ?role, "starting node");

    // Join candidates, in order: the primary recorded in the cached map,
    // the discovery URL, the original-primary URL.
    let mut candidates = Vec::new();
    if let Some(cached) = meta.get_smap()? {
        if let Some(primary) = cached.primary_node() {
            candidates.push(primary.intra_url.clone());
        }
    }
    candidates.push(config.cluster.discovery_url.clone());
    candidates.push(config.cluster.original_primary_url.clone());
    candidates.retain(|c| !c.is_empty());

    match role {
        NodeRole::Proxy => run_proxy(config, meta, node_id, candidates).await,
        NodeRole::Target => run_target(config, meta, node_id, candidates, memory).await,
    }
}

async fn serve_router(router: axum::Router, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "control listener up");
    axum::serve(listener, router).await
}

// -----------------------------------------------------------------------
// Proxy
// -----------------------------------------------------------------------

async fn run_proxy(
    config: CliConfig,
    meta: Arc<MetaCache>,
    node_id: NodeId,
    candidates: Vec<String>,
) -> Result<()> {
    let cp = CpClient::new();
    let node = Node {
        id: node_id.clone(),
        role: NodeRole::Proxy,
        pub_urls: config.node.pub_urls.clone(),
        intra_url: config.node.intra_url.clone(),
        mover_id: None,
        mover_addrs: vec![],
        state: NodeState::Active,
    };

    let (smap, bmd) = if candidates.is_empty() {
        // No one to join: bootstrap as primary, resuming a cached map if
        // this node already was the primary of one.
        match meta.get_smap()? {
            Some(cached) if cached.is_primary(&node_id) => {
                info!(version = cached.version, "resuming cached cluster map as primary");
                (cached, meta.get_bmd()?.unwrap_or_default())
            }
            _ => {
                info!("bootstrapping new cluster as primary");
                (Smap::initial(node.clone()), Bmd::default())
            }
        }
    } else {
        let reply = cp.discover_and_join(&candidates, &node).await?;
        (reply.smap, reply.bmd)
    };
    meta.put_smap(&smap)?;
    meta.put_bmd(&bmd)?;

    let smap = Arc::new(SmapOwner::new(smap));
    let bmd = Arc::new(BmdOwner::new(bmd));
    let cluster_features = config.feature_bits()?;

    let gateway = S3Gateway::new(GatewayState(Arc::new(GatewayInner {
        node_id: node_id.clone(),
        smap: smap.clone(),
        bmd: bmd.clone(),
        cp: cp.clone(),
        clock: MonoClock::new(),
        cluster_features,
        head_via_redirect: config.s3.head_via_redirect,
    })));

    let ctl = handler::proxy_router(CtlState(Arc::new(CtlInner {
        node_id,
        role: NodeRole::Proxy,
        smap,
        bmd,
        cp,
        meta,
        address_book: None,
        engine: None,
        store: None,
    })));

    let (pub_addr, intra_addr) = (config.node.listen_pub.clone(), config.node.listen_intra.clone());
    tokio::try_join!(gateway.serve(&pub_addr), serve_router(ctl, &intra_addr))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Target
// -----------------------------------------------------------------------

/// Bridges the engine's connector trait to the QUIC mover endpoint.
struct QuicConnector {
    endpoint: Arc<MoverEndpoint>,
    local: NodeId,
    book: AddressBook,
}

#[async_trait::async_trait]
impl MoverConnector for QuicConnector {
    async fn open(&self, job_uuid: &str, pdu: bool) -> Result<Arc<dyn DataMover>, NetError> {
        Ok(Arc::new(QuicMover::new(
            self.endpoint.clone(),
            job_uuid,
            self.local.clone(),
            self.book.clone(),
            pdu,
        )))
    }

    async fn register(&self, job_uuid: &str, handler: Arc<dyn RecvHandler>) {
        self.endpoint.register(job_uuid, handler).await;
    }

    async fn unregister(&self, job_uuid: &str) {
        self.endpoint.unregister(job_uuid).await;
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn run_target(
    config: CliConfig,
    meta: Arc<MetaCache>,
    node_id: NodeId,
    candidates: Vec<String>,
    memory: bool,
) -> Result<()> {
    if candidates.is_empty() {
        bail!("a target needs a cluster to join (set --join or [cluster] discovery_url)");
    }

    let store: Arc<dyn ObjectStore> = if memory || config.store.backend == "memory" {
        Arc::new(MemoryStore::new(2, config.store.memory_max_bytes))
    } else {
        Arc::new(FileStore::new(config.mountpaths())?)
    };

    // The mover identity derives from the node identity, so it is stable
    // across restarts and the cluster map stays valid.
    let secret = iroh::SecretKey::from_bytes(
        blake3::hash(format!("{}/{}", config.cluster.name, node_id).as_bytes()).as_bytes(),
    );
    let endpoint = MoverEndpoint::bind(
        secret,
        iroh::RelayMode::Disabled,
        cluster_alpn(&config.cluster.name),
    )
    .await
    .map_err(|e| anyhow::anyhow!("mover bind: {e}"))?;
    endpoint.spawn_accept_loop();
    let mover_id = encode_hex(endpoint.endpoint_id().as_bytes());

    let node = Node {
        id: node_id.clone(),
        role: NodeRole::Target,
        pub_urls: config.node.pub_urls.clone(),
        intra_url: config.node.intra_url.clone(),
        mover_id: Some(mover_id),
        mover_addrs: config.node.mover_addrs.clone(),
        state: NodeState::Active,
    };

    let cp = CpClient::new();
    let reply = cp.discover_and_join(&candidates, &node).await?;
    meta.put_smap(&reply.smap)?;
    meta.put_bmd(&reply.bmd)?;

    let smap = Arc::new(SmapOwner::new(reply.smap));
    let bmd = Arc::new(BmdOwner::new(reply.bmd));
    let book: AddressBook = Arc::new(RwLock::new(Default::default()));
    refresh_address_book(&book, &smap.get()).await;

    let engine = XcopyEngine::new(
        node_id.clone(),
        smap.clone(),
        store.clone(),
        Arc::new(QuicConnector {
            endpoint,
            local: node_id.clone(),
            book: book.clone(),
        }),
        XcopyConfig {
            max_in_parallel: config.xcopy.max_in_parallel,
            cplane_period: config.cplane_period(),
            send_file_timeout: config.send_file_timeout(),
            etl_parallel: config.xcopy.etl_parallel,
            disk_util_high: config.xcopy.disk_util_high,
        },
    );
    engine.register_etl(Arc::new(IdentityTransform));

    let cluster_features = config.feature_bits()?;
    let data_path = TargetServer::new(TargetState(Arc::new(TargetInner {
        node_id: node_id.clone(),
        store: store.clone(),
        smap: smap.clone(),
        bmd: bmd.clone(),
        cp: cp.clone(),
        cluster_features,
        uploads: RwLock::new(Default::default()),
        max_request_age: config.max_request_age(),
    })));

    let ctl = handler::target_router(CtlState(Arc::new(CtlInner {
        node_id,
        role: NodeRole::Target,
        smap,
        bmd,
        cp,
        meta,
        address_book: Some(book),
        engine: Some(engine),
        store: Some(store),
    })));

    let (pub_addr, intra_addr) = (config.node.listen_pub.clone(), config.node.listen_intra.clone());
    tokio::try_join!(data_path.serve(&pub_addr), serve_router(ctl, &intra_addr))?;
    Ok(())
}
