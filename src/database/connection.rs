use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Build a connection pool from configuration
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    config.validate()?;

    info!(
        max_connections = config.max_connections,
        "Connecting queue engine connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Verify database connectivity with a round trip
pub async fn health_check(pool: &PgPool) -> bool {
    match sqlx::query("SELECT 1 AS health").fetch_one(pool).await {
        Ok(row) => {
            let health: i32 = row.get("health");
            debug!("Database health check passed");
            health == 1
        }
        Err(e) => {
            error!(error = %e, "Database health check failed");
            false
        }
    }
}
