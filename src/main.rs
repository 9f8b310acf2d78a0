use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::config::Config;
use paygate::db::{create_pool, init_db, queries, AppState};
use paygate::handlers;
use paygate::models::CreateUser;
use paygate::providers::ProviderRegistry;

#[derive(Parser, Debug)]
#[command(name = "paygate")]
#[command(about = "Multi-network subscription billing gateway")]
struct Cli {
    /// Seed the database with dev data (users, plans, regional pricing)
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM plans", [], |row| row.get(0))
        .expect("Failed to count plans");
    if existing > 0 {
        tracing::info!("Plans already exist, skipping seed");
        return;
    }

    let basic = queries::create_plan(&conn, "basic", "Basic", "basic").expect("seed plan");
    let gold = queries::create_plan(&conn, "gold", "Gold", "gold").expect("seed plan");

    // Regional pricing in minor units: tiyin for UZ, cents elsewhere.
    queries::create_plan_pricing(&conn, &basic.id, "UZ", "UZS", 50_000_00, None)
        .expect("seed pricing");
    queries::create_plan_pricing(&conn, &basic.id, "US", "USD", 4_99, Some("price_basic_usd"))
        .expect("seed pricing");
    queries::create_plan_pricing(&conn, &gold.id, "UZ", "UZS", 120_000_00, None)
        .expect("seed pricing");
    queries::create_plan_pricing(&conn, &gold.id, "US", "USD", 9_99, Some("price_gold_usd"))
        .expect("seed pricing");

    let user = queries::create_user(
        &conn,
        &CreateUser {
            email: "dev@example.com".to_string(),
            name: "Dev User".to_string(),
            phone: Some("998901234567".to_string()),
            country_code: "UZ".to_string(),
        },
    )
    .expect("seed user");

    tracing::info!("Seeded dev data: plans=[basic, gold], user={}", user.id);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paygate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = pool.get().expect("Failed to get database connection");
        init_db(&conn).expect("Failed to initialize database schema");
    }

    let state = AppState {
        db: pool,
        providers: Arc::new(ProviderRegistry::from_config(&config)),
    };

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed requested outside dev mode, skipping");
        } else {
            seed_dev_data(&state);
        }
    }

    let app = Router::new()
        .merge(handlers::webhooks::router())
        .merge(handlers::subscriptions::router())
        .merge(handlers::payments::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    tracing::info!("paygate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");

    if cli.ephemeral && config.dev_mode {
        let _ = std::fs::remove_file(&config.database_path);
        tracing::info!("Removed ephemeral database {}", config.database_path);
    }
}
