//! Store selection from the environment.

use tracing::warn;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const USE_PERSISTENT_STORES_ENV: &str = "USE_PERSISTENT_STORES";
pub const DB_MAX_CONNECTIONS_ENV: &str = "JOBWRIGHT_DB_MAX_CONNECTIONS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Postgres only when `USE_PERSISTENT_STORES=true` and a database URL
    /// is present. Anything else runs in memory.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let use_persistent = lookup(USE_PERSISTENT_STORES_ENV)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        let backend = match (use_persistent, lookup(DATABASE_URL_ENV)) {
            (true, Some(database_url)) => StoreBackend::Postgres { database_url },
            (true, None) => {
                warn!("{USE_PERSISTENT_STORES_ENV}=true but {DATABASE_URL_ENV} is not set, falling back to in-memory");
                StoreBackend::InMemory
            }
            (false, _) => StoreBackend::InMemory,
        };

        let max_connections = match lookup(DB_MAX_CONNECTIONS_ENV) {
            Some(raw) => raw.parse::<u32>().unwrap_or_else(|e| {
                warn!(key = DB_MAX_CONNECTIONS_ENV, value = %raw, error = %e, "invalid value, using default");
                defaults.max_connections
            }),
            None => defaults.max_connections,
        };

        Self {
            backend,
            max_connections: max_connections.max(1),
        }
    }
}
