use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use std::sync::Arc;
use std::time::Duration;

use entitlement_engine::config::Config;
use entitlement_engine::db::{AppState, create_pool, init_db, queries};
use entitlement_engine::handlers;
use entitlement_engine::models::{
    BillingInfo, CreateTransaction, ReconciliationFilters, Tier,
};
use entitlement_engine::payments::GatewayRegistry;
use entitlement_engine::reconcile;
use entitlement_engine::tokens;
use entitlement_engine::util::compute_tax;

#[derive(Parser, Debug)]
#[command(name = "entitlement-engine")]
#[command(about = "Payment and entitlement reconciliation engine")]
struct Cli {
    /// Seed a sample entitlement and an initiated transaction (dev mode only)
    #[arg(long)]
    seed: bool,

    /// Print a reconciliation report as JSON and exit. Requires --start-date and --end-date.
    #[arg(long, requires_all = ["start_date", "end_date"])]
    reconcile: bool,

    /// First UTC date (YYYY-MM-DD) included in the report
    #[arg(long)]
    start_date: Option<String>,

    /// Last UTC date (YYYY-MM-DD) included in the report
    #[arg(long)]
    end_date: Option<String>,

    /// Downgrade every lapsed pro entitlement once and exit
    #[arg(long)]
    sweep_expired: bool,
}

/// Sample data for poking at the API locally.
fn seed_dev_data(state: &AppState) {
    let mut conn = state.db.get().expect("Failed to get db connection for seeding");

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let issued = tokens::issue(
        &mut conn,
        &state.config,
        "dev-user",
        Some("dev@example.local"),
        "dev-solution",
        Tier::Registered,
    )
    .expect("Failed to issue dev token");

    let base_amount = 29_900;
    let transaction = queries::create_transaction(
        &conn,
        &CreateTransaction {
            id: None,
            user_id: "dev-user".to_string(),
            user_email: Some("dev@example.local".to_string()),
            solution_id: "dev-solution".to_string(),
            tier: Tier::Pro,
            gateway: state.config.default_gateway,
            base_amount,
            tax_amount: compute_tax(base_amount, state.config.tax_rate_bps)
                .expect("seed price is small"),
            currency: state.config.default_currency.clone(),
            billing_info: Some(BillingInfo {
                name: Some("Dev User".to_string()),
                country: Some("IN".to_string()),
                ..Default::default()
            }),
        },
    )
    .expect("Failed to create dev transaction");

    tracing::info!("Entitlement: dev-user / dev-solution ({})", issued.tier);
    tracing::info!(
        "Transaction: {} ({} {}, {})",
        transaction.id,
        transaction.total_amount,
        transaction.currency,
        transaction.gateway
    );

    println!();
    println!("--- COPY FROM HERE ---");
    println!("  token: {}", issued.token);
    println!("  transaction_id: {}", transaction.id);
    println!("--- END COPY ---");
    println!();
}

fn run_sweep(state: &AppState) -> Result<usize, entitlement_engine::error::AppError> {
    let mut conn = state.db.get()?;
    tokens::sweep_expired(&mut conn, &state.config, chrono::Utc::now().timestamp())
}

/// Periodically downgrade lapsed pro entitlements. Validation does the same
/// lazily; this keeps the table honest for reports.
fn spawn_expiry_sweep(state: AppState, every_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(every_secs);

        loop {
            tokio::time::sleep(interval).await;

            match run_sweep(&state) {
                Ok(count) => {
                    if count > 0 {
                        tracing::debug!("Expiry sweep downgraded {} entitlements", count);
                    }
                }
                Err(e) => {
                    tracing::warn!("Expiry sweep failed: {}", e);
                }
            }
        }
    });

    tracing::info!("Background expiry sweep started (every {}s)", every_secs);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entitlement_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let gateways = GatewayRegistry::from_config(&config).expect("Failed to build gateway clients");
    tracing::info!("Configured gateways: {:?}", gateways.configured());

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client");

    let state = AppState {
        db: db_pool,
        config: Arc::new(config.clone()),
        gateways,
        http_client,
    };

    if cli.reconcile {
        let (Some(start), Some(end)) = (cli.start_date.as_deref(), cli.end_date.as_deref()) else {
            eprintln!("--reconcile requires --start-date and --end-date");
            std::process::exit(2);
        };
        match reconcile::run_report(&state, start, end, &ReconciliationFilters::default()).await {
            Ok(report) => match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Failed to render report: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Reconciliation failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.sweep_expired {
        match run_sweep(&state) {
            Ok(count) => println!("Downgraded {} lapsed pro entitlements", count),
            Err(e) => {
                eprintln!("Expiry sweep failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set APP_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    if config.expiry_sweep_interval_secs > 0 {
        spawn_expiry_sweep(state.clone(), config.expiry_sweep_interval_secs);
    }

    let app: Router = handlers::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Entitlement engine listening on {}", addr);

    // Connect info feeds the per-IP rate limits and the PayU source check
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
