//! Catalog module
//!
//! System catalog, schema definitions, and data types.

pub mod catalog;
pub mod schema;
pub mod types;

pub use catalog::{
    Catalog, ColumnInfo, DatabaseInfo, IndexInfo, IndexType, Oid, TableInfo,
};
pub use schema::{Column, Schema};
pub use types::DataType;
