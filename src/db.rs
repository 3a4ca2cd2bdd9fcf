use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Configure SQLite pragmas for each new connection.
async fn configure_sqlite_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Executor;

    // WAL mode: concurrent reads during writes
    conn.execute("PRAGMA journal_mode = WAL").await?;

    conn.execute("PRAGMA synchronous = NORMAL").await?;

    // Negative value = KB, so -65536 = 64MB cache
    conn.execute("PRAGMA cache_size = -65536").await?;

    // 5 second timeout for busy connections (prevents "database locked" errors)
    conn.execute("PRAGMA busy_timeout = 5000").await?;

    conn.execute("PRAGMA temp_store = MEMORY").await?;

    conn.execute("PRAGMA foreign_keys = ON").await?;

    Ok(())
}

/// Open (or create) the scan database at `data_dir/scans.db`, apply
/// migrations and return the connection pool.
pub async fn init_db(data_dir: &Path) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir).context(format!(
        "failed to create data dir: {}",
        data_dir.display()
    ))?;

    let db_path = data_dir.join("scans.db");
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

    log::info!("Database URL: {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                configure_sqlite_pragmas(conn).await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await
        .context(format!(
            "failed to connect to database at {}",
            db_path.display()
        ))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    log::info!("Database initialized at {}", db_path.display());

    Ok(pool)
}
