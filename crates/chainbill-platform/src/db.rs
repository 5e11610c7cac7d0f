use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::pg_store::PgRecordStore;

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;

    Ok(pool)
}

pub async fn connect_record_store(database_url: &str) -> Result<PgRecordStore> {
    Ok(PgRecordStore::new(connect_database(database_url).await?))
}
