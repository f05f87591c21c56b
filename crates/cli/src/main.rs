use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    chrono::Utc,
    clap::{Parser, Subcommand},
    sqlx::SqlitePool,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    fleetpass_common::NodeDescriptor,
    fleetpass_config::FleetConfig,
    fleetpass_ledger::{Ledger, SqliteLedger},
    fleetpass_panel::{PanelApi, PanelClient},
    fleetpass_pool::{ClientFactory, ProvisioningDefaults, SessionPool},
    fleetpass_reconcile::{LogNotifier, ReconcileEngine, SweepSchedules, build_scheduler},
};

#[derive(Parser)]
#[command(name = "fleetpass", about = "Subscription-driven access provisioning for a panel fleet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: discover fleetpass.{toml,yaml,json}).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log into the fleet and run the scheduled sweeps until interrupted.
    Serve,
    /// Log into the fleet once and print per-node status.
    Nodes,
    /// Push every active subscription to every reachable node.
    Sync,
    /// Print connection links for a user.
    Link {
        user_id: i64,
        /// Restrict to one node.
        #[arg(long)]
        node: Option<String>,
    },
    /// Print per-node traffic counters for a user.
    Traffic { user_id: i64 },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

struct App {
    config: FleetConfig,
    ledger: Arc<SqliteLedger>,
    pool: Arc<SessionPool>,
}

async fn build_app(cli: &Cli) -> anyhow::Result<App> {
    let config = match &cli.config {
        Some(path) => fleetpass_config::load_config(path)?,
        None => fleetpass_config::discover_and_load(),
    };

    let db = SqlitePool::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    SqliteLedger::init(&db).await?;
    let ledger = Arc::new(SqliteLedger::new(db));

    let configured: Vec<NodeDescriptor> = config
        .nodes
        .iter()
        .map(|entry| entry.to_descriptor())
        .collect::<anyhow::Result<_>>()?;
    anyhow::ensure!(!configured.is_empty(), "no nodes configured");
    let nodes = ledger.merge_nodes(configured).await?;

    let factory: ClientFactory = Arc::new(|descriptor: &NodeDescriptor| {
        let client: Arc<dyn PanelApi> = Arc::new(PanelClient::new(descriptor)?);
        Ok(client)
    });

    let defaults = ProvisioningDefaults {
        inbound_id: config.provisioning.inbound_id,
        ip_limit: config.provisioning.ip_limit,
        flow: config.provisioning.flow.clone(),
    };

    let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
    let pool = SessionPool::new(nodes, ledger_dyn, factory, defaults);
    Ok(App {
        config,
        ledger,
        pool,
    })
}

async fn cmd_serve(app: App) -> anyhow::Result<()> {
    let snapshot = app.pool.refresh().await;
    info!(
        nodes = snapshot.len(),
        active = snapshot.iter().filter(|s| s.is_active()).count(),
        "fleet online"
    );

    let ledger: Arc<dyn Ledger> = app.ledger.clone();
    let engine = ReconcileEngine::new(Arc::clone(&app.pool), ledger, Arc::new(LogNotifier));
    let schedules = SweepSchedules {
        expiry: app.config.sweeps.expiry.clone(),
        near_expiry: app.config.sweeps.near_expiry.clone(),
        health: app.config.sweeps.health.clone(),
    };
    let scheduler = build_scheduler(engine, &schedules)?;
    info!(jobs = ?scheduler.job_names(), "scheduler starting");
    let _handles = scheduler.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn cmd_nodes(app: App) -> anyhow::Result<()> {
    let snapshot = app.pool.refresh().await;
    for session in snapshot.iter() {
        let d = &session.descriptor;
        let status = if session.is_active() { "active" } else { "unreachable" };
        println!(
            "{:<24} {:<12} uptime {:>8}s  last seen {}",
            d.id,
            status,
            d.uptime_secs,
            d.last_seen_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into()),
        );
    }
    Ok(())
}

async fn cmd_sync(app: App) -> anyhow::Result<()> {
    app.pool.refresh().await;
    let ledger: Arc<dyn Ledger> = app.ledger.clone();
    let engine = ReconcileEngine::new(Arc::clone(&app.pool), ledger, Arc::new(LogNotifier));

    let now = Utc::now();
    let active = app.ledger.active_subscriptions(now).await?;
    let total = active.len();
    for (identity, sub) in active {
        let applied = engine.subscription_upserted(&identity, &sub, now).await;
        info!(user = identity.user_id, nodes = applied, "synced");
    }
    info!(subscriptions = total, "full reconciliation complete");
    Ok(())
}

async fn cmd_link(app: App, user_id: i64, node: Option<String>) -> anyhow::Result<()> {
    app.pool.refresh().await;
    let identity = app
        .ledger
        .identity_for_user(user_id)
        .await?
        .with_context(|| format!("unknown user {user_id}"))?;
    let inbound_id = app.config.provisioning.inbound_id;
    let key = identity.external_key();

    match node {
        Some(node_id) => match app.pool.link_for_node(inbound_id, &key, &node_id).await {
            Some(link) => println!("{link}"),
            None => anyhow::bail!("no credential for user {user_id} on node {node_id}"),
        },
        None => {
            let links = app.pool.links_for_identity(inbound_id, &key).await;
            anyhow::ensure!(!links.is_empty(), "no credential for user {user_id} on any node");
            for (descriptor, link) in links {
                println!("{:<24} {link}", descriptor.id);
            }
        },
    }
    Ok(())
}

async fn cmd_traffic(app: App, user_id: i64) -> anyhow::Result<()> {
    let snapshot = app.pool.refresh().await;
    let stats = app.pool.traffic_for_identity(&user_id.to_string()).await;
    for (session, slot) in snapshot.iter().zip(stats) {
        match slot {
            Some((up, down)) => println!(
                "{:<24} up {:>12}  down {:>12}",
                session.descriptor.id, up, down
            ),
            None => println!("{:<24} no data", session.descriptor.id),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "fleetpass starting");

    let app = build_app(&cli).await?;
    match cli.command {
        Commands::Serve => cmd_serve(app).await,
        Commands::Nodes => cmd_nodes(app).await,
        Commands::Sync => cmd_sync(app).await,
        Commands::Link { user_id, node } => cmd_link(app, user_id, node).await,
        Commands::Traffic { user_id } => cmd_traffic(app, user_id).await,
    }
}
