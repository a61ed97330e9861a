//! Core types for the mywire MySQL protocol engine.
//!
//! This crate holds the pieces shared between the engine and its callers:
//!
//! - `Error` and its kinds, with vendor code and SQLSTATE for server errors
//! - `Value` and the MySQL temporal types
//! - `Row` / `ColumnInfo` for owned result rows
//! - `SpilledColumn` for oversized columns streamed to disk
//! - `Outcome` / `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DataError, DataErrorKind, Error,
    ProtocolError, QueryError, QueryErrorKind, Result,
};
pub use row::{ColumnInfo, Row};
pub use value::{Date, DateTime, SpilledColumn, Time, Value};
