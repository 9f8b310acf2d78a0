mod schema;
pub mod from_row;
pub mod queries;

pub use schema::init_db;

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::providers::ProviderRegistry;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding the database pool and the provider registry.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub providers: Arc<ProviderRegistry>,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    // Concurrent webhook deliveries contend on IMMEDIATE transactions;
    // a busy timeout lets the loser wait instead of erroring.
    let manager = SqliteConnectionManager::file(database_path)
        .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(5)));
    Pool::builder().max_size(10).build(manager)
}
