use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};

pub mod message;

/// Opens (creating if needed) the SQLite database at `path` and runs migrations.
///
/// WAL mode plus a busy timeout lets several pools, in this process or in
/// others, share the file; writers queue on the database lock instead of
/// failing with `SQLITE_BUSY`.
pub async fn connect(path: impl AsRef<str>) -> eyre::Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(10))
        .optimize_on_close(true, None);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::debug!(path = path.as_ref(), "database ready");

    Ok(pool)
}
