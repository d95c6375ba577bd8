use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
    Sqlite,
};

/// Opens (creating if needed) the SQLite database and applies per-connection pragmas.
pub async fn create_pool(url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    if !Sqlite::database_exists(url).await.unwrap_or(false) {
        tracing::info!("Creating SQLite database at {}", url);
        Sqlite::create_database(url).await?;
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout=10000;").execute(&mut *conn).await?;
                if let Err(e) = sqlx::query("PRAGMA temp_store=MEMORY;").execute(&mut *conn).await {
                    tracing::warn!("Failed to set temp_store: {}", e);
                }
                Ok::<(), sqlx::Error>(())
            })
        })
        .connect(url)
        .await?;
    Ok(pool)
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    // Pragmas for better durability/performance
    if let Err(e) = sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await {
        tracing::warn!("Failed to set WAL journal mode: {}", e);
    }
    if let Err(e) = sqlx::query("PRAGMA synchronous=NORMAL;").execute(pool).await {
        tracing::warn!("Failed to set synchronous mode: {}", e);
    }
    // Foreign keys are critical - fail if this doesn't work
    sqlx::query("PRAGMA foreign_keys=ON;").execute(pool).await?;
    if let Err(e) = sqlx::query("PRAGMA busy_timeout=10000;").execute(pool).await {
        tracing::warn!("Failed to set busy_timeout: {}", e);
    }

    let tables = [
        r#"CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            full_name TEXT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            is_active INTEGER NOT NULL DEFAULT 1,
            email_verified_at TEXT NULL,
            last_login_at TEXT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            access_token_hash TEXT NOT NULL UNIQUE,
            refresh_token_hash TEXT NOT NULL UNIQUE,
            access_expires_at INTEGER NOT NULL,
            refresh_expires_at INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            revoked_at TEXT NULL,
            rotated_from TEXT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS auth_tokens (
            token_hash TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            purpose TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            used_at TEXT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS vehicles (
            id TEXT PRIMARY KEY,
            make TEXT NOT NULL,
            model TEXT NOT NULL,
            year INTEGER NOT NULL,
            price INTEGER NOT NULL,
            mileage INTEGER NOT NULL DEFAULT 0,
            fuel_type TEXT NULL,
            transmission TEXT NULL,
            body_type TEXT NULL,
            color TEXT NULL,
            condition TEXT NOT NULL DEFAULT 'used',
            status TEXT NOT NULL DEFAULT 'draft',
            featured INTEGER NOT NULL DEFAULT 0,
            vin TEXT NULL,
            description TEXT NULL,
            created_by TEXT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            deleted_at TEXT NULL,
            FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE SET NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS vehicle_images (
            id TEXT PRIMARY KEY,
            vehicle_id TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            url TEXT NOT NULL,
            alt_text TEXT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            is_primary INTEGER NOT NULL DEFAULT 0,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            FOREIGN KEY(vehicle_id) REFERENCES vehicles(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS inquiries (
            id TEXT PRIMARY KEY,
            vehicle_id TEXT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT NULL,
            message TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            FOREIGN KEY(vehicle_id) REFERENCES vehicles(id) ON DELETE SET NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event TEXT NOT NULL,
            actor_id TEXT NULL,
            actor_email TEXT NULL,
            ip TEXT NULL,
            target TEXT NULL,
            details TEXT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        )"#,
    ];
    for ddl in tables {
        sqlx::query(ddl).execute(pool).await?;
    }

    // Columns added after the first release
    for (table, column) in [("sessions", "rotated_from")] {
        let query = format!("ALTER TABLE {} ADD COLUMN {} TEXT NULL", table, column);
        if let Err(e) = sqlx::query(&query).execute(pool).await {
            match &e {
                sqlx::Error::Database(db_err) => {
                    let msg = db_err.message().to_lowercase();
                    if !msg.contains("duplicate") && !msg.contains("already exists") {
                        return Err(anyhow::anyhow!("Migration failed adding {}.{}: {}", table, column, e));
                    }
                }
                _ => return Err(anyhow::anyhow!("Migration failed adding {}.{}: {}", table, column, e)),
            }
        }
    }

    let indexes = [
        ("idx_sessions_user", "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)"),
        ("idx_sessions_rotated", "CREATE INDEX IF NOT EXISTS idx_sessions_rotated ON sessions(rotated_from)"),
        ("idx_auth_tokens_user", "CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id, purpose)"),
        (
            "idx_vehicles_listing",
            "CREATE INDEX IF NOT EXISTS idx_vehicles_listing ON vehicles(deleted_at, status, created_at DESC)",
        ),
        ("idx_vehicles_make", "CREATE INDEX IF NOT EXISTS idx_vehicles_make ON vehicles(make COLLATE NOCASE)"),
        ("idx_vehicles_price", "CREATE INDEX IF NOT EXISTS idx_vehicles_price ON vehicles(price)"),
        (
            "idx_images_vehicle",
            "CREATE INDEX IF NOT EXISTS idx_images_vehicle ON vehicle_images(vehicle_id, position)",
        ),
        ("idx_inquiries_status", "CREATE INDEX IF NOT EXISTS idx_inquiries_status ON inquiries(status, created_at DESC)"),
        ("idx_audit_created", "CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at DESC)"),
    ];

    for (name, query) in indexes {
        if let Err(e) = sqlx::query(query).execute(pool).await {
            tracing::warn!("Failed to create index {}: {}", name, e);
        }
    }

    Ok(())
}

/// Millisecond UTC timestamp in the same shape as the schema defaults.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Deletes sessions whose refresh token has expired or that were revoked a while ago,
/// and auth tokens past their expiry. Returns the number of removed rows.
pub async fn purge_expired(pool: &SqlitePool) -> anyhow::Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let sessions = sqlx::query(
        "DELETE FROM sessions WHERE refresh_expires_at < ?1 OR (revoked_at IS NOT NULL AND revoked_at < strftime('%Y-%m-%dT%H:%M:%SZ','now','-1 day'))",
    )
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    let tokens = sqlx::query("DELETE FROM auth_tokens WHERE expires_at < ?1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(sessions + tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_pool;

    #[tokio::test]
    async fn init_is_idempotent() {
        let pool = memory_pool().await;
        init_db(&pool).await.unwrap();
        init_db(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            names,
            vec!["audit_log", "auth_tokens", "inquiries", "sessions", "users", "vehicle_images", "vehicles"]
        );
    }

    #[tokio::test]
    async fn emails_are_unique_case_insensitively() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO users (id, email, password_hash) VALUES ('1', 'Sales@Mikki.example', 'x')")
            .execute(&pool)
            .await
            .unwrap();
        let dup = sqlx::query("INSERT INTO users (id, email, password_hash) VALUES ('2', 'sales@mikki.example', 'x')")
            .execute(&pool)
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn purge_removes_expired_tokens() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO users (id, email, password_hash) VALUES ('u', 'a@b.example', 'x')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO auth_tokens (token_hash, user_id, purpose, expires_at) VALUES ('old', 'u', 'password_reset', 1), ('new', 'u', 'password_reset', ?1)",
        )
        .bind(chrono::Utc::now().timestamp() + 600)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(purge_expired(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_pool_creates_file_and_enables_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mikki.db");
        let pool = create_pool(&format!("sqlite://{}", path.display()), 2).await.unwrap();
        assert!(path.exists());

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(&pool).await.unwrap();
        assert_eq!(fk, 1);
        init_db(&pool).await.unwrap();
        // Re-running the column migration on an up-to-date schema is a no-op
        init_db(&pool).await.unwrap();
        pool.close().await;
    }
}
