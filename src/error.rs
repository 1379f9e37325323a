//! Error types for NimbusDB
//!
//! This module defines all error types used throughout the database engine.

use thiserror::Error;

/// The main error type for NimbusDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Lexer Errors ==========
    #[error("Lexer error: unexpected character '{0}' at line {1}, column {2}")]
    UnexpectedCharacter(char, u32, u32),

    #[error("Lexer error: unterminated string literal starting at line {0}, column {1}")]
    UnterminatedString(u32, u32),

    #[error("Lexer error: invalid number format at line {0}, column {1}")]
    InvalidNumber(u32, u32),

    // ========== Parser Errors ==========
    #[error("Parse error: unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Parse error: unexpected end of input, expected {0}")]
    UnexpectedEof(String),

    // ========== Catalog Errors ==========
    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Catalog error: column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Catalog error: corrupted catalog file: {0}")]
    CorruptedCatalog(String),

    // ========== Type Errors ==========
    #[error("Type error: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Type error: null value not allowed for column '{0}'")]
    NullNotAllowed(String),

    #[error("Execution error: division by zero")]
    DivisionByZero,

    // ========== Constraint Errors ==========
    #[error("Execution error: constraint violation - {0}")]
    ConstraintViolation(String),

    // ========== Storage Errors ==========
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Storage error: tuple of {0} bytes does not fit in a page")]
    TupleTooLarge(usize),

    #[error("Storage error: corrupted page {0}")]
    CorruptedPage(u32),

    // ========== Execution Errors ==========
    #[error("Execution error: {0}")]
    ExecutionError(String),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Transaction Errors ==========
    #[error("Transaction error: transaction already in progress")]
    TransactionAlreadyActive,

    #[error("Transaction error: no transaction in progress")]
    NoActiveTransaction,

    #[error("Transaction error: transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Transaction error: could not acquire lock on {0}")]
    LockNotAcquired(String),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for NimbusDB operations
pub type Result<T> = std::result::Result<T, Error>;
