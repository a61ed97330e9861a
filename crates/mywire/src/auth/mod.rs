//! Pluggable authentication.
//!
//! A plugin is a small state machine: each call to
//! [`AuthPlugin::next_step`] receives the latest server challenge (the
//! scramble first, then the body of every auth-more-data packet) and
//! returns the payloads to send back. Plugins are looked up by name in a
//! static [`registry`]; unknown or disabled names fall back to the
//! configured default.

pub mod plugins;
pub mod scramble;

use mywire_core::Result;

pub use plugins::{CachingSha2Password, ClearPassword, NativePassword, Sha256Password};

/// Well-known authentication plugin names.
pub mod names {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes inside caching_sha2_password / sha256_password exchanges.
pub mod status {
    /// Auth-more-data packet header
    pub const MORE_DATA: u8 = 0x01;
    /// caching_sha2: client asks for the RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// caching_sha2: scramble matched the server cache
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// caching_sha2: server wants the full password
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
    /// sha256_password: client asks for the RSA public key
    pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;
}

/// What a plugin may consult while producing a response.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    /// The channel is TLS-protected
    pub secure: bool,
    /// Server RSA public key (PEM) configured out of band
    pub server_public_key: Option<&'a [u8]>,
    pub allow_public_key_retrieval: bool,
    pub allow_cleartext_password: bool,
}

/// A named, stateful authentication algorithm.
pub trait AuthPlugin: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Return to the initial state. Called when the plugin is switched to
    /// or retried.
    fn reset(&mut self);

    /// Consume one server challenge and produce zero or more payloads.
    fn next_step(&mut self, challenge: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>>;
}

/// Creates a fresh plugin instance.
pub type PluginFactory = fn() -> Box<dyn AuthPlugin>;

fn native_password() -> Box<dyn AuthPlugin> {
    Box::new(NativePassword::default())
}

fn caching_sha2_password() -> Box<dyn AuthPlugin> {
    Box::new(CachingSha2Password::default())
}

fn sha256_password() -> Box<dyn AuthPlugin> {
    Box::new(Sha256Password::default())
}

fn clear_password() -> Box<dyn AuthPlugin> {
    Box::new(ClearPassword::default())
}

/// Built-in plugins, looked up by name.
pub static BUILTIN_PLUGINS: &[(&str, PluginFactory)] = &[
    (names::MYSQL_NATIVE_PASSWORD, native_password),
    (names::CACHING_SHA2_PASSWORD, caching_sha2_password),
    (names::SHA256_PASSWORD, sha256_password),
    (names::MYSQL_CLEAR_PASSWORD, clear_password),
];

/// Plugin lookup honoring extra registrations and a disabled list.
pub mod registry {
    use super::{AuthPlugin, BUILTIN_PLUGINS, PluginFactory};

    /// Find `name` among `extra` then the built-ins, unless disabled.
    pub fn lookup(
        name: &str,
        extra: &[(&'static str, PluginFactory)],
        disabled: &[String],
    ) -> Option<Box<dyn AuthPlugin>> {
        if disabled.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            return None;
        }
        extra
            .iter()
            .chain(BUILTIN_PLUGINS.iter())
            .find(|(n, _)| *n == name)
            .map(|(_, factory)| factory())
    }

    /// Resolve the server-requested plugin, falling back to `default`.
    pub fn select(
        requested: &str,
        default: &str,
        extra: &[(&'static str, PluginFactory)],
        disabled: &[String],
    ) -> Option<Box<dyn AuthPlugin>> {
        lookup(requested, extra, disabled).or_else(|| {
            if requested != default {
                tracing::warn!(
                    requested = %requested,
                    fallback = %default,
                    "unknown or disabled auth plugin, using default"
                );
            }
            lookup(default, extra, disabled)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        for (name, _) in BUILTIN_PLUGINS {
            let plugin = registry::lookup(name, &[], &[]).unwrap();
            assert_eq!(plugin.name(), *name);
        }
        assert!(registry::lookup("client_ed25519", &[], &[]).is_none());
    }

    #[test]
    fn test_disabled_plugins_fall_back() {
        let disabled = vec!["MYSQL_CLEAR_PASSWORD".to_string()];
        assert!(registry::lookup(names::MYSQL_CLEAR_PASSWORD, &[], &disabled).is_none());

        let plugin = registry::select(
            names::MYSQL_CLEAR_PASSWORD,
            names::CACHING_SHA2_PASSWORD,
            &[],
            &disabled,
        )
        .unwrap();
        assert_eq!(plugin.name(), names::CACHING_SHA2_PASSWORD);
    }

    #[test]
    fn test_unknown_falls_back_to_default() {
        let plugin =
            registry::select("auth_gssapi_client", names::MYSQL_NATIVE_PASSWORD, &[], &[])
                .unwrap();
        assert_eq!(plugin.name(), names::MYSQL_NATIVE_PASSWORD);
    }

    #[test]
    fn test_extra_plugins_take_precedence() {
        fn custom() -> Box<dyn AuthPlugin> {
            Box::new(ClearPassword::default())
        }
        let extra: [(&'static str, PluginFactory); 1] = [("dialog", custom)];
        let plugin = registry::lookup("dialog", &extra, &[]).unwrap();
        assert_eq!(plugin.name(), names::MYSQL_CLEAR_PASSWORD);
    }
}
