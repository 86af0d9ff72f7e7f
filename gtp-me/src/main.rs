//! gtp-me (Measure Engine) - Measure planning and variance service
//!
//! Owns measure links, target/actual data points, variance computation,
//! replanning, and cross-context impact aggregation for the GTP backend.

use anyhow::Result;
use clap::Parser;
use gtp_common::config::{database_path, load_module_config, resolve_root_folder};
use gtp_common::db::init::init_database;
use gtp_common::db::settings::get_setting_or;
use gtp_common::events::EventBus;
use gtp_me::alignment::AlignmentClient;
use gtp_me::{build_router, AppContext};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gtp-me", about = "GTP measure planning & variance engine")]
struct Args {
    /// Root data folder (overrides GTP_ROOT_FOLDER and config file)
    #[arg(long)]
    root_folder: Option<String>,

    /// Listen port (overrides module_config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(
        "Starting GTP Measure Engine (gtp-me) v{}",
        env!("CARGO_PKG_VERSION")
    );

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "GTP_ROOT_FOLDER")?;
    let db_path = database_path(&root_folder);
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path).await?;

    let module = load_module_config(&pool, "measure_engine").await?;
    let host = module.host.clone();
    let port = args.port.unwrap_or(module.port);

    let capacity = get_setting_or(&pool, "event_bus_capacity", 1000usize).await;
    let events = Arc::new(EventBus::new(capacity));

    let alignment = AlignmentClient::from_module_config(&pool).await;

    let ctx = AppContext::new(pool, events, alignment);
    let app = build_router(ctx);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gtp-me listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
