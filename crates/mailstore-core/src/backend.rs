//! Backend context shared by every listener and session

use crate::auth::{AuthBackend, DatabaseAuth};
use crate::delivery::Delivery;
use crate::relay::{Relay, SmtpRelay};
use crate::sort::{KeepAll, SieveSort, SortBackend};
use mailstore_common::{Config, Error, Result};
use mailstore_storage::{DatabasePool, MemoryStore, Store};
use std::sync::Arc;
use tracing::info;

/// Storage, authentication and sorting, selected once at startup
#[derive(Clone)]
pub struct Backends {
    pub config: Arc<Config>,
    pub store: Store,
    pub auth: Arc<dyn AuthBackend>,
    pub sort: Arc<dyn SortBackend>,
    pub delivery: Arc<Delivery>,
}

impl Backends {
    /// Connect the configured drivers. Unknown driver names fail with
    /// `Error::Backend`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = match config.database.backend.as_str() {
            "postgres" | "postgresql" => {
                let pool = DatabasePool::new(&config.database).await?;
                if config.database.migrate {
                    pool.migrate().await?;
                }
                Store::postgres(pool)
            }
            "memory" => Store::memory(Arc::new(MemoryStore::new())),
            other => {
                return Err(Error::Backend(format!("unknown database backend '{}'", other)))
            }
        };
        Self::with_store(config, store)
    }

    /// Build the remaining drivers on top of an existing store
    pub fn with_store(config: Config, store: Store) -> Result<Self> {
        let auth: Arc<dyn AuthBackend> = match config.auth.driver.as_str() {
            "database" | "sql" => Arc::new(DatabaseAuth::new(store.clone())),
            other => return Err(Error::Backend(format!("unknown auth driver '{}'", other))),
        };

        let sort: Arc<dyn SortBackend> = match config.sort.driver.as_str() {
            "none" | "" => Arc::new(KeepAll),
            "sieve" => Arc::new(SieveSort::new(store.clone())),
            other => return Err(Error::Backend(format!("unknown sort driver '{}'", other))),
        };

        info!(
            database = store.backend_name(),
            auth = auth.name(),
            sort = sort.name(),
            "Backends ready"
        );

        let mut delivery = Delivery::new(
            store.clone(),
            auth.clone(),
            sort.clone(),
            config.delivery.clone(),
        );
        if let Some(relay) = SmtpRelay::from_config(&config.delivery.relay)? {
            info!(relay = relay.name(), port = config.delivery.relay.port, "Outbound relay ready");
            delivery = delivery.with_relay(Arc::new(relay));
        }
        let delivery = Arc::new(delivery);

        Ok(Self {
            config: Arc::new(config),
            store,
            auth,
            sort,
            delivery,
        })
    }

    /// In-memory backends for tests
    #[cfg(test)]
    pub(crate) fn memory() -> (Arc<MemoryStore>, Self) {
        let backing = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.database.backend = "memory".to_string();
        let backends = match Self::with_store(config, Store::memory(backing.clone())) {
            Ok(b) => b,
            Err(e) => panic!("memory backends: {}", e),
        };
        (backing, backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backends() {
        let mut config = Config::default();
        config.database.backend = "memory".to_string();
        config.sort.driver = "sieve".to_string();
        let backends = Backends::from_config(config).await.unwrap();
        assert_eq!(backends.store.backend_name(), "memory");
        assert_eq!(backends.sort.name(), "sieve");
        assert_eq!(backends.auth.name(), "database");
    }

    #[tokio::test]
    async fn test_unknown_drivers_are_fatal() {
        let mut config = Config::default();
        config.database.backend = "oracle".to_string();
        let err = Backends::from_config(config).await.err().unwrap();
        assert!(err.is_fatal());

        let mut config = Config::default();
        config.sort.driver = "procmail".to_string();
        let err = Backends::with_store(config, Store::memory(Arc::new(MemoryStore::new())))
            .err()
            .unwrap();
        assert_eq!(err.code(), "BACKEND_ERROR");

        let mut config = Config::default();
        config.auth.driver = "ldap".to_string();
        let err = Backends::with_store(config, Store::memory(Arc::new(MemoryStore::new())))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
