//! Pool utilities beyond the basic init_pool() in mod.rs.

use crate::Result;

/// Health check for the database connection.
pub async fn health_check(pool: &super::DbPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Open an in-memory pool with the schema applied. Test support.
pub async fn init_test_pool() -> Result<super::DbPool> {
    let pool = super::init_pool(":memory:").await?;
    super::initialize_schema(&pool).await?;
    Ok(pool)
}
