//! Coordination node binary

use clap::{Parser, Subcommand};
use rdbcoord::common::{format_millis, parse_duration, timestamp_now_millis};
use rdbcoord::coordinator::{CoordinationStore, SqliteStore};
use rdbcoord::{Config, CoordinationEvent, CoordinationStrategy};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rdbcoord")]
#[command(about = "Leader election and membership over a shared database")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the coordination group and run until Ctrl-C
    Serve {
        /// Node ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Database file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Coordination group
        #[arg(long)]
        group: Option<String>,

        /// Heartbeat interval, e.g. 5s or 500ms
        #[arg(long)]
        heartbeat_interval: Option<String>,
    },
    /// Print the leadership and heartbeat rows as JSON
    Status {
        /// Database file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Coordination group
        #[arg(long)]
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            db,
            group,
            heartbeat_interval,
        } => {
            // CLI arguments take priority over the file and environment
            let cluster = &mut config.cluster;
            cluster.enabled = true;
            if id.is_some() {
                cluster.node_id = id;
            }
            if let Some(db) = db {
                cluster.database.path = db;
            }
            if let Some(group) = group {
                cluster.group_id = group;
            }
            if let Some(interval) = heartbeat_interval {
                cluster.strategy_config.heartbeat_interval_ms =
                    parse_duration(&interval)?.as_millis() as u64;
            }

            let Some(coord) = CoordinationStrategy::activate(cluster)? else {
                anyhow::bail!(
                    "coordination strategy {:?} is not available",
                    cluster.coordination_strategy_class
                );
            };
            coord.subscribe(log_event);
            coord.start().await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down {}", coord.node_id());
            coord.stop().await?;
        }
        Commands::Status { db, group } => {
            let cluster = &config.cluster;
            let store = SqliteStore::open(
                db.unwrap_or_else(|| cluster.database.path.clone()),
                group.unwrap_or_else(|| cluster.group_id.clone()),
                cluster.strategy_config.store_timeout(),
            )?;
            print_status(&store).await?;
        }
    }

    Ok(())
}

fn log_event(event: &CoordinationEvent) {
    match event {
        CoordinationEvent::LeaderChanged {
            leader: Some(leader),
            term,
        } => tracing::info!("Leader changed to {} (term {})", leader, term),
        CoordinationEvent::LeaderChanged { leader: None, term } => {
            tracing::info!("No leader known (term {})", term)
        }
        CoordinationEvent::MemberJoined { node_id } => tracing::info!("Member joined: {}", node_id),
        CoordinationEvent::MemberLeft { node_id } => tracing::info!("Member left: {}", node_id),
        CoordinationEvent::SelfDegraded {
            consecutive_failures,
        } => tracing::warn!(
            "This node cannot reach the store ({} failed cycles)",
            consecutive_failures
        ),
        CoordinationEvent::SelfRecovered => tracing::info!("This node reaches the store again"),
    }
}

async fn print_status(store: &SqliteStore) -> anyhow::Result<()> {
    let now = timestamp_now_millis();
    let leadership = store.read_leadership().await?.map(|lease| {
        serde_json::json!({
            "leader_id": lease.leader_id,
            "term": lease.term,
            "lease_expiry": format_millis(lease.lease_expiry),
            "expired": lease.lease_expiry < now,
        })
    });
    let heartbeats: Vec<_> = store
        .read_all_heartbeats()
        .await?
        .into_iter()
        .map(|hb| {
            serde_json::json!({
                "node_id": hb.node_id,
                "last_updated": format_millis(hb.last_updated),
                "age_ms": now - hb.last_updated,
                "generation": hb.generation,
            })
        })
        .collect();

    let status = serde_json::json!({
        "group_id": store.group_id(),
        "leadership": leadership,
        "heartbeats": heartbeats,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
