//! Database facade
//!
//! Wires the storage manager, catalog, lock manager and transaction manager
//! together over one data directory, and hands out per-connection query
//! executors. The surrounding server owns one `Database` and gives each
//! handler thread its own session.

use std::sync::Arc;

use tracing::info;

use crate::catalog::{Catalog, Schema};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::storage::disk::StorageManager;
use crate::transaction::{LockManager, TransactionManager};

/// Catalog filename inside the data directory
pub const CATALOG_FILENAME: &str = "catalog.dat";

/// An open database over one data directory
pub struct Database {
    storage: Arc<StorageManager>,
    catalog: Arc<Catalog>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
}

impl Database {
    /// Open (or create) a database under the configured data directory
    pub fn open(config: EngineConfig) -> Result<Database> {
        let storage = Arc::new(StorageManager::new(&config.data_dir)?);
        let catalog = Arc::new(Catalog::open(config.data_dir.join(CATALOG_FILENAME))?);
        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));

        info!(data_dir = %config.data_dir.display(), "database opened");
        Ok(Database {
            storage,
            catalog,
            lock_manager,
            txn_manager,
        })
    }

    /// Open using `DATA_DIR` from the environment, or the default directory
    pub fn open_from_env() -> Result<Database> {
        Self::open(EngineConfig::from_env())
    }

    /// A new executor sharing this database's state. One per connection;
    /// executors are not thread-safe themselves.
    pub fn session(&self) -> QueryExecutor {
        QueryExecutor::new(
            self.catalog.clone(),
            self.storage.clone(),
            self.lock_manager.clone(),
            self.txn_manager.clone(),
        )
    }

    /// Names of every table in the catalog
    pub fn list_tables(&self) -> Vec<String> {
        self.catalog.list_tables()
    }

    /// Schema of a table, if it exists
    pub fn get_schema(&self, table: &str) -> Option<Schema> {
        self.catalog.table_schema(table)
    }

    /// The shared catalog
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The shared storage manager
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();

        let mut session = db.session();
        let result = session.execute_sql("CREATE TABLE t (id BIGINT, name TEXT)");
        assert!(result.is_ok(), "{:?}", result.error);

        assert_eq!(db.list_tables(), vec!["t".to_string()]);
        let schema = db.get_schema("t").unwrap();
        assert_eq!(schema.column_names(), vec!["id", "name"]);
        assert!(db.get_schema("missing").is_none());
    }

    #[test]
    fn test_sessions_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();

        let mut a = db.session();
        let mut b = db.session();

        assert!(a.execute_sql("CREATE TABLE t (v BIGINT)").is_ok());
        assert!(a.execute_sql("INSERT INTO t VALUES (7)").is_ok());

        // the second session reads what the first wrote
        let result = b.execute_sql("SELECT v FROM t");
        assert!(result.is_ok());
        assert_eq!(result.row_count(), 1);
    }
}
