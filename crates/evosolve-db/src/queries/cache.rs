//! Database query functions for the `enrichment_cache` table.
//!
//! The cache is shared across jobs and write-once: the first writer of a
//! key wins and later writers are silently ignored.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{BusinessCase, CacheEntryRow};

/// Look up a cached business case by content hash.
pub async fn get_cached(pool: &PgPool, cache_key: &str) -> Result<Option<BusinessCase>> {
    let row = sqlx::query_as::<_, CacheEntryRow>(
        "SELECT * FROM enrichment_cache WHERE cache_key = $1",
    )
    .bind(cache_key)
    .fetch_optional(pool)
    .await
    .context("failed to read enrichment cache")?;

    Ok(row.map(|r| r.business_case.0))
}

/// Store a business case under its content hash. Write-once: returns `true`
/// when this call inserted the entry, `false` when it already existed.
pub async fn put_cached(
    pool: &PgPool,
    cache_key: &str,
    business_case: &BusinessCase,
    model: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO enrichment_cache (cache_key, business_case, model) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (cache_key) DO NOTHING",
    )
    .bind(cache_key)
    .bind(Json(business_case))
    .bind(model)
    .execute(pool)
    .await
    .context("failed to write enrichment cache")?;

    Ok(result.rows_affected() > 0)
}
