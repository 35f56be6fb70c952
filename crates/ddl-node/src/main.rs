//! DDL Node -- federation instance of the Decentralised Discovery Link.
//!
//! Usage:
//!   ddl-node                                  # Serve the federation API
//!   ddl-node --config path.toml run           # Serve with a custom config
//!   ddl-node init net-1 --instance-id alpha   # Create a network
//!   ddl-node keygen --out network.pem         # Generate a network key
//!   ddl-node challenge                        # Print join challenge words
//!   ddl-node score 0.4 --records 10 --max 20  # Evaluate the scorer
//!   ddl-node check https://beta.example       # Check another node

use ddl_node::config::NodeConfig;
use ddl_node::{build_federation, expand_tilde, install_network_key, maintenance, open_storage, write_private_key};

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use ddl_api::AppState;
use ddl_crypto::NetworkKeyPair;
use ddl_federation::Federation;
use ddl_governor::Scorer;
use ddl_protocol::{challenge, Network};
use ddl_storage::{MemoryStorage, Storage};

#[derive(Parser)]
#[command(name = "ddl-node", about = "Decentralised Discovery Link federation node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.ddl/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the federation API (default)
    Run,
    /// Create a network this instance belongs to
    Init {
        network_id: String,
        /// Display name of the network
        #[arg(long)]
        name: Option<String>,
        /// This instance's node ID inside the network
        #[arg(long)]
        instance_id: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Generate a PEM network key
    Keygen {
        #[arg(long, default_value_t = 2048)]
        bits: usize,
        /// Write the private key here instead of stdout
        #[arg(long)]
        out: Option<String>,
    },
    /// Print a fresh join challenge
    Challenge {
        #[arg(long, default_value_t = challenge::DEFAULT_CHALLENGE_WORDS)]
        words: usize,
    },
    /// Score one exchange with the configured weights
    Score {
        /// Seconds the exchange took; negative for a failure
        #[arg(allow_negative_numbers = true)]
        elapsed: f64,
        #[arg(long, requires = "max")]
        records: Option<u64>,
        #[arg(long, requires = "records")]
        max: Option<u64>,
    },
    /// Check whether another node answers its health endpoint
    Check { url: String },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ddl_node=info,ddl_federation=info,ddl_api=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_node(cfg).await,
        Commands::Init {
            network_id,
            name,
            instance_id,
            description,
        } => {
            let storage = open_storage(&cfg.node)?;
            if storage.load_network(&network_id).is_ok() {
                anyhow::bail!("network {network_id} already exists");
            }
            let mut network = Network::new(&network_id, name.unwrap_or_else(|| network_id.clone()), instance_id);
            network.description = description;
            storage.store_network(&network)?;
            install_network_key(storage.as_ref(), &expand_tilde(&cfg.node.network_key))?;
            println!("network {network_id} created, instance {}", network.instance_id);
            Ok(())
        }
        Commands::Keygen { bits, out } => {
            let keys = NetworkKeyPair::generate_with_bits(bits)?;
            match out {
                Some(out) => {
                    let path = expand_tilde(&out);
                    write_private_key(&path, &keys.private_key_pem()?)?;
                    println!("private key written to {}", path.display());
                }
                None => print!("{}", keys.private_key_pem()?),
            }
            print!("{}", keys.public_key_pem()?);
            Ok(())
        }
        Commands::Challenge { words } => {
            println!("{}", challenge::generate_challenge(words).join(" "));
            Ok(())
        }
        Commands::Score { elapsed, records, max } => {
            let scorer = Scorer::new(cfg.ddl.score_params());
            println!("{:.4}", scorer.score(elapsed, records, max)?);
            Ok(())
        }
        Commands::Check { url } => {
            // Check from a throwaway network so nothing is persisted.
            let storage = Arc::new(MemoryStorage::new());
            storage.store_network(&Network::new("check", "check", "check"))?;
            let federation = Arc::new(build_federation(&cfg, storage)?);
            let reachable = federation.interface("check")?.check_connectivity(&url).await;
            if !reachable {
                anyhow::bail!("{url} is not reachable");
            }
            println!("{url} is reachable");
            Ok(())
        }
    }
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let storage = open_storage(&cfg.node)?;
    install_network_key(storage.as_ref(), &expand_tilde(&cfg.node.network_key))?;
    let networks = storage.list_networks()?;
    if networks.is_empty() {
        tracing::warn!("node: no networks configured, run `ddl-node init` first");
    }
    for network in &networks {
        tracing::info!(network_id = %network.network_id, instance_id = %network.instance_id, "node: serving network");
    }

    let federation: Arc<Federation> = Arc::new(build_federation(&cfg, storage)?);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Spawn maintenance loop
    let maintenance_handle = {
        let federation = federation.clone();
        let shutdown = shutdown_tx.subscribe();
        let retry = Duration::from_secs(cfg.pending.retry_interval_secs.max(1));
        let members = Duration::from_secs(cfg.membership.sync_interval_secs);
        let poll = cfg.pending.poll_members;
        tokio::spawn(async move {
            maintenance::run_maintenance_loop(federation, retry, members, poll, shutdown).await;
        })
    };

    // Start API server
    let router = ddl_api::router(Arc::new(AppState::new(federation.clone())));
    let listener = tokio::net::TcpListener::bind(&cfg.node.listen_addr).await?;
    tracing::info!(
        addr = %cfg.node.listen_addr,
        url = %cfg.ddl.url,
        path = %cfg.node.federation_path,
        "node: API listening"
    );
    let api_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let mut shutdown = shutdown;
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("node: shutting down");
    federation.shutdown();
    let _ = shutdown_tx.send(());

    let _ = maintenance_handle.await;
    let _ = api_handle.await;
    tracing::info!("node: stopped");
    Ok(())
}
