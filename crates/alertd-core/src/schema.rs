//! Embedded DDL for the two alert-engine tables
//! (`alert_messages`, `public_keys`), gated behind the `auto_migrate`
//! config flag ("Auto-migration is optional and off in
//! production"). Intended for the SQLite dev/test path — a production
//! Postgres/MySQL deployment applies its own migrations out of band and
//! leaves `auto_migrate` false.

use sqlx::AnyPool;

/// Create `{prefix}alert_messages` and `{prefix}public_keys` if they do
/// not already exist. Idempotent; safe to call on every startup.
pub async fn ensure_schema(pool: &AnyPool, table_prefix: &str) -> Result<(), sqlx::Error> {
    let alert_messages = format!(
        "CREATE TABLE IF NOT EXISTS {prefix}alert_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence INTEGER NOT NULL UNIQUE,
            hash TEXT NOT NULL,
            raw TEXT NOT NULL,
            processed BOOLEAN NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP
        )",
        prefix = table_prefix
    );
    sqlx::query(&alert_messages).execute(pool).await?;

    let public_keys = format!(
        "CREATE TABLE IF NOT EXISTS {prefix}public_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT 0,
            last_update_hash TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        prefix = table_prefix
    );
    sqlx::query(&public_keys).execute(pool).await?;

    Ok(())
}
