//! Error types for MySQL protocol operations.
//!
//! Every error is cheap to clone: a transport failure has to be delivered to
//! the active task and every queued task, so sources are held behind `Arc`.

use std::fmt;
use std::sync::Arc;

type Source = Arc<dyn std::error::Error + Send + Sync>;

/// The primary error type for all protocol engine operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Transport and authentication failures (fatal to the connection)
    Connection(ConnectionError),
    /// Server ERR packets (connection stays usable)
    Query(QueryError),
    /// Wire-level framing errors (fatal to the connection)
    Protocol(ProtocolError),
    /// Data and resource errors attached to a single task
    Data(DataError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(Arc<std::io::Error>),
    /// Operation was cancelled at a row boundary
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
}

/// An ERR packet returned by the server.
#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Vendor error code (e.g. 1062 for a duplicate key)
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock or lock wait timeout
    Deadlock,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a MySQL vendor error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1064 | 1149 => QueryErrorKind::Syntax,
            1022 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 => {
                QueryErrorKind::Constraint
            }
            1051 | 1054 | 1146 | 1049 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 | 1227 => QueryErrorKind::Permission,
            1205 | 1213 => QueryErrorKind::Deadlock,
            _ => QueryErrorKind::Database,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Source>,
}

/// A resource or data error raised while serving one task.
#[derive(Debug, Clone)]
pub struct DataError {
    pub kind: DataErrorKind,
    pub message: String,
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataErrorKind {
    /// An all-zero DATE/DATETIME/TIMESTAMP under the `Exception` policy
    ZeroDate,
    /// Writing an oversized column to its temp file failed
    Spill,
    /// Reading a LOCAL INFILE source failed
    Infile,
    /// A parameter or infile exceeded max_allowed_packet
    PacketTooLarge,
    /// A long-data parameter source failed
    LongData,
    /// A value could not be decoded for its declared column type
    Decode,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Source>,
}

impl Error {
    /// Does this error leave the connection unusable?
    ///
    /// Transport failures, authentication failures and framing errors all
    /// poison the connection; server errors, data errors and cancellation
    /// do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        self.is_fatal()
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the MySQL vendor error code if this is a server error.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            _ => None,
        }
    }

    /// Get the data error kind, if any.
    pub fn data_kind(&self) -> Option<DataErrorKind> {
        match self {
            Error::Data(d) => Some(d.kind),
            _ => None,
        }
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::connection(ConnectionErrorKind::Authentication, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    pub fn data(kind: DataErrorKind, message: impl Into<String>) -> Self {
        Error::Data(DataError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl DataError {
    /// Attach the underlying I/O error.
    pub fn with_source(mut self, err: std::io::Error) -> Self {
        self.source = Some(Arc::new(err));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Data(e) => write!(f, "Data error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = match self {
            Error::Connection(e) => e.source.as_ref(),
            Error::Protocol(e) => e.source.as_ref(),
            Error::Data(e) => e.source.as_ref(),
            Error::Config(e) => e.source.as_ref(),
            Error::Io(e) => return Some(e.as_ref()),
            _ => None,
        };
        source.map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(sqlstate) => write!(f, "[{}] ({}) {}", self.code, sqlstate, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<DataError> for Error {
    fn from(err: DataError) -> Self {
        Error::Data(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for protocol engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::from_code(1062),
            code: 1062,
            sqlstate: Some("23000".to_string()),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
        };

        assert_eq!(query.kind, QueryErrorKind::Constraint);
        assert!(query.is_duplicate_key());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.code(), Some(1062));
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Query error: [1062] (23000) Duplicate entry '1' for key 'PRIMARY'"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::protocol("packet sequence mismatch").is_fatal());
        assert!(Error::auth("access denied").is_fatal());
        assert!(Error::from(std::io::Error::other("reset")).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::data(DataErrorKind::ZeroDate, "zero date").is_fatal());
    }

    #[test]
    fn clones_share_source() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer reset",
        ));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(std::error::Error::source(&copy).is_some());
    }

    #[test]
    fn data_error_source() {
        let err: Error = DataError {
            kind: DataErrorKind::Spill,
            message: "disk full".to_string(),
            source: None,
        }
        .with_source(std::io::Error::other("ENOSPC"))
        .into();
        assert_eq!(err.data_kind(), Some(DataErrorKind::Spill));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_code_classification() {
        assert_eq!(QueryErrorKind::from_code(1064), QueryErrorKind::Syntax);
        assert_eq!(QueryErrorKind::from_code(1146), QueryErrorKind::NotFound);
        assert_eq!(QueryErrorKind::from_code(1045), QueryErrorKind::Permission);
        assert_eq!(QueryErrorKind::from_code(1213), QueryErrorKind::Deadlock);
        assert_eq!(QueryErrorKind::from_code(9999), QueryErrorKind::Database);
    }
}
