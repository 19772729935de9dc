//! Database schema definitions.

use sqlx::SqlitePool;

use crate::storage::StoreError;

/// SQL statement for creating the events table (document table).
///
/// `body` holds the full JSON document; `updated_at` (unix micros) and
/// `version` are denormalized for ordering and conditional writes.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY NOT NULL,
    updated_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL DEFAULT 1,
    body        TEXT NOT NULL,
    stored_at   INTEGER NOT NULL
);
"#;

/// SQL statement for creating the area membership table.
///
/// One row per distinct area code of an event, rewritten with the event.
pub const EVENT_AREAS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS event_areas (
    event_id TEXT NOT NULL,
    code     TEXT NOT NULL,
    PRIMARY KEY (event_id, code)
);
"#;

/// Index DDL.
pub const INDEXES_DDL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_events_updated_at ON events (updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_event_areas_code ON event_areas (code)",
];

/// Initialize the database schema.
///
/// Creates all tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(EVENTS_TABLE_DDL).execute(pool).await?;
    sqlx::query(EVENT_AREAS_TABLE_DDL).execute(pool).await?;
    for ddl in INDEXES_DDL {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_init_schema_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('events', 'event_areas')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count.0, 2);
    }
}
