//! Connection configuration.
//!
//! `MySqlConfig` is a read-only provider for credentials and tunables.
//! Loading it from files or URLs is left to the caller.

use std::collections::BTreeMap;
use std::fmt;

use crate::auth::{PluginFactory, names};
use crate::protocol::{capabilities, collation};

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never upgrade
    #[default]
    Disable,
    /// Upgrade when the server offers TLS
    Preferred,
    /// Fail unless the server offers TLS
    Required,
    /// Required, and the upgrader verifies the CA
    VerifyCa,
    /// Required, and the upgrader verifies the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// What to do with `0000-00-00` dates in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroDatePolicy {
    /// Null the value and report a data error once the result ends
    #[default]
    Exception,
    /// Replace with 0001-01-01, keeping any time part
    Round,
    /// Yield NULL
    ConvertToNull,
}

/// Smallest chunk a long-data parameter is split into.
pub const MIN_LONG_DATA_CHUNK: usize = 1024;

/// Connection configuration.
#[derive(Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Schema selected at connect time
    pub database: Option<String>,
    /// Collation id sent in the handshake response
    pub collation: u8,
    pub ssl_mode: SslMode,
    /// PEM-encoded server RSA key for sha256/caching_sha2 without TLS
    pub server_public_key: Option<Vec<u8>>,
    pub allow_public_key_retrieval: bool,
    /// Let mysql_clear_password run without TLS
    pub allow_cleartext_password: bool,
    /// Plugin used when the server names one we cannot run
    pub default_auth_plugin: String,
    pub disabled_auth_plugins: Vec<String>,
    /// Extra plugins consulted before the built-ins
    pub extra_auth_plugins: Vec<(&'static str, PluginFactory)>,
    /// Connection attributes added to the built-in `_client_*` set
    pub attributes: BTreeMap<String, String>,
    /// Advertise CLIENT_LOCAL_FILES
    pub local_infile: bool,
    /// Max packet size announced in the handshake
    pub max_packet_size: u32,
    /// Server-side max_allowed_packet bound for streamed parameters
    pub max_allowed_packet: u64,
    /// Preferred long-data chunk size before clamping
    pub long_data_chunk_size: usize,
    /// Columns longer than this spill to disk; `None` disables spilling
    pub spill_threshold: Option<u64>,
    pub zero_date_policy: ZeroDatePolicy,
    /// Rows per COM_STMT_FETCH when a cursor is used
    pub fetch_size: u32,
    /// Allow `;`-separated statements in one COM_QUERY
    pub multi_statements: bool,
}

impl fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("default_auth_plugin", &self.default_auth_plugin)
            .field("max_allowed_packet", &self.max_allowed_packet)
            .field("spill_threshold", &self.spill_threshold)
            .field("zero_date_policy", &self.zero_date_policy)
            .finish_non_exhaustive()
    }
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            collation: collation::DEFAULT,
            ssl_mode: SslMode::default(),
            server_public_key: None,
            allow_public_key_retrieval: false,
            allow_cleartext_password: false,
            default_auth_plugin: names::CACHING_SHA2_PASSWORD.to_string(),
            disabled_auth_plugins: Vec::new(),
            extra_auth_plugins: Vec::new(),
            attributes: BTreeMap::new(),
            local_infile: false,
            max_packet_size: 16 * 1024 * 1024,
            max_allowed_packet: 64 * 1024 * 1024,
            long_data_chunk_size: 1024 * 1024,
            spill_threshold: None,
            zero_date_policy: ZeroDatePolicy::default(),
            fetch_size: 100,
            multi_statements: true,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn collation(mut self, collation: u8) -> Self {
        self.collation = collation;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Provide the server's RSA public key (PEM).
    pub fn server_public_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.server_public_key = Some(pem.into());
        self
    }

    pub fn allow_public_key_retrieval(mut self, allow: bool) -> Self {
        self.allow_public_key_retrieval = allow;
        self
    }

    /// Permit mysql_clear_password over an unencrypted channel.
    ///
    /// # Security Warning
    /// The password then crosses the network in plain text.
    pub fn allow_cleartext_password(mut self, allow: bool) -> Self {
        self.allow_cleartext_password = allow;
        self
    }

    pub fn default_auth_plugin(mut self, name: impl Into<String>) -> Self {
        self.default_auth_plugin = name.into();
        self
    }

    pub fn disable_auth_plugin(mut self, name: impl Into<String>) -> Self {
        self.disabled_auth_plugins.push(name.into());
        self
    }

    /// Register an additional auth plugin factory.
    pub fn auth_plugin(mut self, name: &'static str, factory: PluginFactory) -> Self {
        self.extra_auth_plugins.push((name, factory));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Enable or disable LOAD DATA LOCAL INFILE.
    ///
    /// # Security Warning
    /// The server chooses which file is requested; only enable this
    /// against trusted servers and pair it with a restrictive handler.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn max_allowed_packet(mut self, size: u64) -> Self {
        self.max_allowed_packet = size;
        self
    }

    pub fn long_data_chunk_size(mut self, size: usize) -> Self {
        self.long_data_chunk_size = size;
        self
    }

    pub fn spill_threshold(mut self, bytes: u64) -> Self {
        self.spill_threshold = Some(bytes);
        self
    }

    pub fn zero_date_policy(mut self, policy: ZeroDatePolicy) -> Self {
        self.zero_date_policy = policy;
        self
    }

    pub fn fetch_size(mut self, rows: u32) -> Self {
        self.fetch_size = rows.max(1);
        self
    }

    pub fn multi_statements(mut self, enabled: bool) -> Self {
        self.multi_statements = enabled;
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Capability flags requested from the server.
    pub fn capability_flags(&self) -> u32 {
        use capabilities::{
            CLIENT_CONNECT_WITH_DB, CLIENT_LOCAL_FILES, CLIENT_MULTI_STATEMENTS, CLIENT_SSL,
            DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }
        if self.local_infile {
            flags |= CLIENT_LOCAL_FILES;
        }
        if !self.multi_statements {
            flags &= !CLIENT_MULTI_STATEMENTS;
        }
        flags
    }

    /// Built-in attributes merged with the configured ones.
    pub fn connection_attributes(&self) -> Vec<(String, String)> {
        let mut attrs = BTreeMap::new();
        attrs.insert("_client_name".to_string(), "mywire".to_string());
        attrs.insert(
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        attrs.insert("_os".to_string(), std::env::consts::OS.to_string());
        attrs.insert("_platform".to_string(), std::env::consts::ARCH.to_string());
        attrs.insert("_pid".to_string(), std::process::id().to_string());
        for (k, v) in &self.attributes {
            attrs.insert(k.clone(), v.clone());
        }
        attrs.into_iter().collect()
    }

    pub(crate) fn password_str(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MySqlConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .ssl_mode(SslMode::Required)
            .allow_public_key_retrieval(true)
            .zero_date_policy(ZeroDatePolicy::Round)
            .spill_threshold(1 << 20)
            .attribute("program_name", "myapp");

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password_str(), "secret");
        assert_eq!(config.database.as_deref(), Some("testdb"));
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert!(config.allow_public_key_retrieval);
        assert_eq!(config.zero_date_policy, ZeroDatePolicy::Round);
        assert_eq!(config.spill_threshold, Some(1 << 20));
        assert_eq!(config.socket_addr(), "db.example.com:3307");
    }

    #[test]
    fn test_debug_hides_password() {
        let config = MySqlConfig::new().password("hunter2");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            assert!(mode.should_try_ssl());
            assert!(mode.is_required());
        }
    }

    #[test]
    fn test_capability_flags() {
        use crate::protocol::capabilities::*;

        let flags = MySqlConfig::new().database("test").local_infile(true).capability_flags();
        assert_ne!(flags & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(flags & CLIENT_LOCAL_FILES, 0);
        assert_ne!(flags & CLIENT_PROTOCOL_41, 0);
        assert_eq!(flags & CLIENT_SSL, 0);

        let flags = MySqlConfig::new().multi_statements(false).capability_flags();
        assert_eq!(flags & CLIENT_MULTI_STATEMENTS, 0);
        assert_eq!(flags & CLIENT_CONNECT_WITH_DB, 0);
    }

    #[test]
    fn test_connection_attributes_override() {
        let attrs = MySqlConfig::new()
            .attribute("_client_name", "custom")
            .attribute("program_name", "app")
            .connection_attributes();
        let get = |k: &str| attrs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("_client_name"), Some("custom"));
        assert_eq!(get("program_name"), Some("app"));
        assert!(get("_pid").is_some());
    }
}
