//! Postgres pool setup and schema migrations.

use std::time::Duration;

use serde::Deserialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared Postgres pool used by every repository.
pub type DbPool = PgPool;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// The `[database]` settings section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolSettings {
    /// Postgres URL; commands that need the database fail without one.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl PoolSettings {
    /// Pick the URL (`url_override` wins) and parse it, checking the pool bounds.
    pub fn connect_options(&self, url_override: Option<&str>) -> Result<PgConnectOptions, DbError> {
        let Some(url) = url_override.or(self.url.as_deref()) else {
            return Err(DbError::Config(
                "no database configured; set --database-url, DATABASE_URL or database.url".into(),
            ));
        };
        if self.max_connections == 0 {
            return Err(DbError::Config("database.max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::Config(format!(
                "database.min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        url.parse::<PgConnectOptions>()
            .map_err(|err| DbError::Config(format!("invalid database url: {err}")))
    }
}

/// Open a pool. The URL never reaches the logs; only host and database do.
pub async fn connect(settings: &PoolSettings, url_override: Option<&str>) -> Result<DbPool, DbError> {
    let options = settings.connect_options(url_override)?;
    info!(
        host = options.get_host(),
        database = options.get_database().unwrap_or("-"),
        max_connections = settings.max_connections,
        "connecting to database"
    );
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply pending migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!(known = MIGRATOR.iter().count(), "applying database migrations");
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_url_wins_over_settings() {
        let settings = PoolSettings {
            url: Some("postgres://app@settings-host/flows".into()),
            ..PoolSettings::default()
        };
        let options = settings
            .connect_options(Some("postgres://app@override-host:6543/other"))
            .unwrap();
        assert_eq!(options.get_host(), "override-host");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("other"));

        let options = settings.connect_options(None).unwrap();
        assert_eq!(options.get_host(), "settings-host");
    }

    #[test]
    fn missing_url_and_bad_bounds_are_config_errors() {
        let none = PoolSettings::default().connect_options(None).unwrap_err();
        assert!(matches!(none, DbError::Config(ref m) if m.contains("DATABASE_URL")));

        let url = Some("postgres://localhost/flows");
        let zero = PoolSettings {
            max_connections: 0,
            ..PoolSettings::default()
        };
        assert!(matches!(zero.connect_options(url), Err(DbError::Config(_))));

        let inverted = PoolSettings {
            min_connections: 8,
            max_connections: 2,
            ..PoolSettings::default()
        };
        assert!(matches!(inverted.connect_options(url), Err(DbError::Config(_))));
    }

    #[test]
    fn migrations_are_embedded() {
        assert!(MIGRATOR.iter().any(|m| m.version == 1));
    }
}
