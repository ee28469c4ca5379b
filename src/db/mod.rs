use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILENAME: &str = "kol-feed-cache.db";
const DEFAULT_DATA_DIR: &str = "data";

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn resolve_db_filename() -> String {
    env_or("APP_DB_FILENAME", DEFAULT_DB_FILENAME)
}

fn resolve_db_path() -> Result<PathBuf, AppError> {
    let mut base_dir = PathBuf::from(env_or("APP_DATA_DIR", DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&base_dir)?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Opens the local cache mirror at `APP_DATA_DIR/APP_DB_FILENAME`.
pub async fn initialize_pool() -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path()?;
    initialize_pool_from_path(&db_path).await
}

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should initialize");
    run_migrations(&pool)
        .await
        .expect("migrations should apply to an empty database");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_db_path() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir().join(format!("kol-feed-sync-{timestamp}.db"))
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path();

        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let cache_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&pool)
            .await
            .expect("cache_entries table must exist and be queryable");

        assert_eq!(cache_rows, 0);

        drop(pool);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn db_filename_has_a_default() {
        assert!(!resolve_db_filename().is_empty());
    }
}
