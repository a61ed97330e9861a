//! Non-blocking MySQL client wire protocol engine.
//!
//! The engine is a sans-I/O state machine: a [`Scheduler`] runs one task at
//! a time (handshake, query, prepare, execute, simple commands) against a
//! byte stream it never touches itself. [`MySqlConnection`] is the async
//! driver that owns a transport and feeds the scheduler.
//!
//! - Packet framing with sequence checks and multi-frame payloads
//! - Authentication plugins (mysql_native_password, caching_sha2_password,
//!   sha256_password, mysql_clear_password) with auth switch
//! - Optional TLS upgrade through a caller-supplied [`TlsUpgrade`]
//! - Text and binary result sets, multi-result chaining, cursor fetch
//! - Long data parameters and LOCAL INFILE streamed in bounded chunks
//! - Oversized columns spilled to temp files
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{ConnectOptions, MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .user("app")
//!     .password("secret")
//!     .database("shop");
//!
//! let stream = Box::new(asupersync::net::TcpStream::connect("localhost:3306").await?);
//! let mut conn = MySqlConnection::connect(&cx, stream, config, ConnectOptions::default()).await;
//! let results = conn.query(&cx, "SELECT id, name FROM items").await;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod infile;
pub mod long_data;
pub mod protocol;
pub mod result_set;
pub mod scheduler;
pub mod spill;
pub mod tasks;
pub mod tls;
pub mod types;

pub use config::{MySqlConfig, SslMode, ZeroDatePolicy};
pub use connection::{ConnectOptions, MySqlConnection, ResultStream};
pub use infile::{DirectoryInfileHandler, InfileHandler};
pub use long_data::{BytesSource, ChunkSource, FileSource, ProducerSource, ReaderSource};
pub use protocol::prepared::PreparedStatement;
pub use result_set::{
    ChannelSink, CollectSink, CurrentRow, QueryResult, ResultEvent, ResultSink, ResultState,
};
pub use scheduler::{Scheduler, Session, Task};
pub use spill::{TempDirProvider, TempFileProvider};
pub use tasks::{
    CancelToken, ExecuteTask, HandshakeTask, Param, PrepareTask, QueryTask, SimpleCommand,
    SimpleCommandTask,
};
pub use tls::{TlsUpgrade, Transport};
pub use types::{ColumnDef, FieldType};

pub use mywire_core::{Cx, Error, Outcome, Result, Row, Value};
