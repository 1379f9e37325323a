//! System catalog for NimbusDB
//!
//! The catalog binds table names to object ids, column metadata and on-disk
//! filenames. It is read-mostly and shared across executors; every mutation
//! is eagerly persisted to `catalog.dat`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::schema::Schema;
use super::types::DataType;
use crate::error::{Error, Result};

/// Object id assigned to tables and indexes
pub type Oid = u32;

/// Catalog file magic, "CATL"
pub const CATALOG_MAGIC: u32 = 0x4341_544C;

/// Catalog file format version
pub const CATALOG_VERSION: u32 = 1;

/// Header bytes preceding the serialized body
const CATALOG_HEADER_SIZE: usize = 28;

/// Index access methods. Only BTree is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    BTree,
    Hash,
    GiST,
    Gin,
    Brin,
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
    pub position: u16,
    pub max_length: u32,
    pub nullable: bool,
    pub is_primary_key: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType, position: u16) -> Self {
        let max_length = match data_type {
            DataType::Varchar(n) => n,
            _ => 0,
        };
        Self {
            name: name.into(),
            data_type,
            position,
            max_length,
            nullable: true,
            is_primary_key: false,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set primary key flag. Primary keys are implicitly NOT NULL.
    pub fn primary_key(mut self, pk: bool) -> Self {
        self.is_primary_key = pk;
        if pk {
            self.nullable = false;
        }
        self
    }
}

/// Index metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index_id: Oid,
    pub name: String,
    pub table_id: Oid,
    pub column_positions: Vec<u16>,
    pub index_type: IndexType,
    pub is_unique: bool,
    pub is_primary: bool,
    pub filename: String,
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_id: Oid,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub num_rows: u64,
    pub filename: String,
    pub created_at: u64,
    pub modified_at: u64,
}

impl TableInfo {
    /// Get column by name (first match)
    pub fn get_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of columns
    pub fn num_columns(&self) -> u16 {
        self.columns.len() as u16
    }

    /// Build the runtime schema for this table
    pub fn schema(&self) -> Schema {
        let mut schema = Schema::new();
        for col in &self.columns {
            schema.add_column(col.name.clone(), col.data_type.clone());
        }
        schema
    }
}

/// Database-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub database_id: Oid,
    pub name: String,
    pub created_at: u64,
}

impl Default for DatabaseInfo {
    fn default() -> Self {
        Self {
            database_id: 1,
            name: "nimbus".to_string(),
            created_at: unix_now(),
        }
    }
}

/// Serialized body following the binary header
#[derive(Serialize, Deserialize)]
struct CatalogBody {
    tables: Vec<TableInfo>,
    database: DatabaseInfo,
}

#[derive(Debug)]
struct CatalogInner {
    next_table_id: Oid,
    next_index_id: Oid,
    tables: BTreeMap<Oid, TableInfo>,
    database: DatabaseInfo,
}

/// System catalog
#[derive(Debug)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
    /// Backing file; None keeps the catalog memory-only (tests)
    path: Option<PathBuf>,
}

impl Catalog {
    /// Create a new empty, memory-only catalog
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner {
                next_table_id: 1,
                next_index_id: 1,
                tables: BTreeMap::new(),
                database: DatabaseInfo::default(),
            }),
            path: None,
        }
    }

    /// Open a catalog backed by a file, loading existing contents
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut catalog = if path.exists() {
            Self::load(&path)?
        } else {
            Self::new()
        };
        catalog.path = Some(path);
        Ok(catalog)
    }

    /// Create a new table. The heap filename is derived from the name.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnInfo>) -> Result<Oid> {
        let oid = {
            let mut inner = self.inner.write().unwrap();
            if inner.tables.values().any(|t| t.name == name) {
                return Err(Error::TableAlreadyExists(name.to_string()));
            }
            let oid = inner.next_table_id;
            inner.next_table_id += 1;

            let now = unix_now();
            let table = TableInfo {
                table_id: oid,
                name: name.to_string(),
                columns,
                indexes: Vec::new(),
                num_rows: 0,
                filename: format!("{}.heap", name),
                created_at: now,
                modified_at: now,
            };
            inner.tables.insert(oid, table);
            oid
        };
        info!(table = name, oid, "created table");
        self.save()?;
        Ok(oid)
    }

    /// Drop a table by oid, taking its index metadata with it
    pub fn drop_table(&self, oid: Oid) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            inner.tables.remove(&oid).is_some()
        };
        if removed {
            debug!(oid, "dropped table");
            self.save()?;
        }
        Ok(removed)
    }

    /// Get a table by oid
    pub fn get_table(&self, oid: Oid) -> Option<TableInfo> {
        self.inner.read().unwrap().tables.get(&oid).cloned()
    }

    /// Get a table by name
    pub fn get_table_by_name(&self, name: &str) -> Option<TableInfo> {
        self.inner
            .read()
            .unwrap()
            .tables
            .values()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Check if a table exists by name
    pub fn table_exists(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .tables
            .values()
            .any(|t| t.name == name)
    }

    /// All table names, in oid order
    pub fn list_tables(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .tables
            .values()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Runtime schema for a table
    pub fn table_schema(&self, name: &str) -> Option<Schema> {
        self.get_table_by_name(name).map(|t| t.schema())
    }

    /// Register an index on a table. Only metadata changes here; building
    /// the physical tree is the executor's decision.
    pub fn create_index(
        &self,
        name: &str,
        table_id: Oid,
        column_positions: Vec<u16>,
        index_type: IndexType,
        is_unique: bool,
    ) -> Result<Oid> {
        let oid = {
            let mut inner = self.inner.write().unwrap();
            if inner
                .tables
                .values()
                .flat_map(|t| &t.indexes)
                .any(|i| i.name == name)
            {
                return Err(Error::IndexAlreadyExists(name.to_string()));
            }
            let table_name = inner
                .tables
                .get(&table_id)
                .ok_or_else(|| Error::TableNotFound(format!("oid {}", table_id)))?
                .name
                .clone();
            for &pos in &column_positions {
                let table = inner.tables.get(&table_id).unwrap();
                if pos as usize >= table.columns.len() {
                    return Err(Error::ColumnNotFound(format!(
                        "position {} of table '{}'",
                        pos, table_name
                    )));
                }
            }

            let oid = inner.next_index_id;
            inner.next_index_id += 1;

            let index = IndexInfo {
                index_id: oid,
                name: name.to_string(),
                table_id,
                column_positions,
                index_type,
                is_unique,
                is_primary: false,
                filename: format!("{}_{}.idx", table_name, name),
            };
            let table = inner.tables.get_mut(&table_id).unwrap();
            table.indexes.push(index);
            table.modified_at = unix_now();
            oid
        };
        info!(index = name, oid, "created index");
        self.save()?;
        Ok(oid)
    }

    /// Update the row-count statistic for a table
    pub fn update_table_stats(&self, oid: Oid, num_rows: u64) -> Result<()> {
        {
            let mut inner = self.inner.write().unwrap();
            let table = inner
                .tables
                .get_mut(&oid)
                .ok_or_else(|| Error::TableNotFound(format!("oid {}", oid)))?;
            table.num_rows = num_rows;
            table.modified_at = unix_now();
        }
        self.save()
    }

    /// Database-level metadata
    pub fn database(&self) -> DatabaseInfo {
        self.inner.read().unwrap().database.clone()
    }

    /// Persist the catalog. Memory-only catalogs skip this silently.
    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.read().unwrap();

        let num_indexes: usize = inner.tables.values().map(|t| t.indexes.len()).sum();
        let mut bytes = Vec::with_capacity(CATALOG_HEADER_SIZE);
        bytes.extend_from_slice(&CATALOG_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
        bytes.extend_from_slice(&unix_now().to_le_bytes());
        bytes.extend_from_slice(&inner.next_table_id.to_le_bytes());
        bytes.extend_from_slice(&inner.next_index_id.to_le_bytes());
        bytes.extend_from_slice(&(inner.tables.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(num_indexes as u16).to_le_bytes());
        debug_assert_eq!(bytes.len(), CATALOG_HEADER_SIZE);

        let body = CatalogBody {
            tables: inner.tables.values().cloned().collect(),
            database: inner.database.clone(),
        };
        let encoded =
            bincode::serialize(&body).map_err(|e| Error::CorruptedCatalog(e.to_string()))?;
        bytes.extend_from_slice(&encoded);

        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < CATALOG_HEADER_SIZE {
            return Err(Error::CorruptedCatalog("file too short".to_string()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != CATALOG_MAGIC {
            return Err(Error::CorruptedCatalog(format!(
                "bad magic 0x{:08X}",
                magic
            )));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != CATALOG_VERSION {
            return Err(Error::CorruptedCatalog(format!(
                "unsupported version {}",
                version
            )));
        }
        let next_table_id = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let next_index_id = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

        let body: CatalogBody = bincode::deserialize(&bytes[CATALOG_HEADER_SIZE..])
            .map_err(|e| Error::CorruptedCatalog(e.to_string()))?;

        let tables = body
            .tables
            .into_iter()
            .map(|t| (t.table_id, t))
            .collect::<BTreeMap<_, _>>();

        debug!(tables = tables.len(), "loaded catalog");
        Ok(Self {
            inner: RwLock::new(CatalogInner {
                next_table_id,
                next_index_id,
                tables,
                database: body.database,
            }),
            path: None,
        })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_name_columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("id", DataType::Int64, 0).primary_key(true),
            ColumnInfo::new("name", DataType::Varchar(100), 1),
        ]
    }

    #[test]
    fn test_create_and_get_table() {
        let catalog = Catalog::new();
        let oid = catalog.create_table("users", id_name_columns()).unwrap();

        let table = catalog.get_table(oid).unwrap();
        assert_eq!(table.name, "users");
        assert_eq!(table.filename, "users.heap");
        assert_eq!(table.num_columns(), 2);
        assert!(table.get_column("id").unwrap().is_primary_key);
        assert!(!table.get_column("id").unwrap().nullable);

        assert_eq!(catalog.get_table_by_name("users").unwrap().table_id, oid);
        assert!(catalog.get_table_by_name("nope").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let catalog = Catalog::new();
        catalog.create_table("t", id_name_columns()).unwrap();
        assert!(matches!(
            catalog.create_table("t", id_name_columns()),
            Err(Error::TableAlreadyExists(_))
        ));
    }

    #[test]
    fn test_oids_monotonic() {
        let catalog = Catalog::new();
        let a = catalog.create_table("a", id_name_columns()).unwrap();
        let b = catalog.create_table("b", id_name_columns()).unwrap();
        catalog.drop_table(a).unwrap();
        let c = catalog.create_table("c", id_name_columns()).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_create_index_metadata() {
        let catalog = Catalog::new();
        let oid = catalog.create_table("users", id_name_columns()).unwrap();

        catalog
            .create_index("users_name_idx", oid, vec![1], IndexType::BTree, false)
            .unwrap();

        let table = catalog.get_table(oid).unwrap();
        assert_eq!(table.indexes.len(), 1);
        assert_eq!(table.indexes[0].filename, "users_users_name_idx.idx");
        assert_eq!(table.indexes[0].column_positions, vec![1]);

        // duplicate index name rejected
        assert!(matches!(
            catalog.create_index("users_name_idx", oid, vec![0], IndexType::BTree, false),
            Err(Error::IndexAlreadyExists(_))
        ));
        // out-of-range column rejected
        assert!(catalog
            .create_index("bad", oid, vec![9], IndexType::BTree, false)
            .is_err());
    }

    #[test]
    fn test_update_stats() {
        let catalog = Catalog::new();
        let oid = catalog.create_table("t", id_name_columns()).unwrap();
        catalog.update_table_stats(oid, 42).unwrap();
        assert_eq!(catalog.get_table(oid).unwrap().num_rows, 42);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.dat");

        let oid = {
            let catalog = Catalog::open(&path).unwrap();
            let oid = catalog.create_table("users", id_name_columns()).unwrap();
            catalog
                .create_index("users_name_idx", oid, vec![1], IndexType::BTree, true)
                .unwrap();
            catalog.update_table_stats(oid, 3).unwrap();
            oid
        };

        let reopened = Catalog::open(&path).unwrap();
        let table = reopened.get_table(oid).unwrap();
        assert_eq!(table.name, "users");
        assert_eq!(table.num_rows, 3);
        assert_eq!(table.indexes.len(), 1);
        assert!(table.indexes[0].is_unique);

        // oid allocation continues past the reload
        let next = reopened.create_table("more", id_name_columns()).unwrap();
        assert!(next > oid);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.dat");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(
            Catalog::open(&path),
            Err(Error::CorruptedCatalog(_))
        ));
    }
}
