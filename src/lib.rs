//! NimbusDB - a single-node relational database engine written in Rust
//!
//! This library provides the core components for a SQL database:
//! - SQL parsing (lexer, parser, AST)
//! - Paged heap storage and B+ tree indexes
//! - Volcano-style query execution
//! - System catalog with on-disk persistence
//! - Transactions with row locks and undo logging
//!
//! The wire protocol server and CLI live outside this crate; they open a
//! [`Database`] and drive [`QueryExecutor`] sessions.

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use config::EngineConfig;
pub use database::Database;
pub use error::{Error, Result};
pub use executor::{QueryExecutor, QueryResult};
