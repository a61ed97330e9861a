//! TLS negotiation.
//!
//! The engine decides when to upgrade: the handshake task sends the SSL
//! request and asks the driver for [`Outbound::UpgradeTls`]. The handshake
//! itself belongs to a [`TlsUpgrade`] implementation supplied by the
//! application, so no TLS stack is linked here.
//!
//! [`Outbound::UpgradeTls`]: crate::scheduler::Outbound::UpgradeTls

use crate::config::SslMode;
use crate::protocol::capabilities;
use asupersync::io::{AsyncRead, AsyncWrite};
use mywire_core::Error;
use mywire_core::error::{ConnectionError, ConnectionErrorKind};
use std::future::Future;
use std::io;
use std::pin::Pin;

/// A duplex byte stream the driver can run the protocol over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Future returned by [`TlsUpgrade::upgrade`].
pub type UpgradeFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn Transport>>> + Send>>;

/// Wraps a plaintext transport in TLS.
///
/// Certificate verification according to the [`SslMode`] is the
/// implementation's job.
pub trait TlsUpgrade: Send + Sync + std::fmt::Debug {
    fn upgrade(&self, stream: Box<dyn Transport>, server_name: String, mode: SslMode) -> UpgradeFuture;
}

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Whether the handshake should upgrade, given what the server offers.
///
/// The `Required` family fails instead of continuing in plaintext.
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let offered = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(offered),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity if offered => Ok(true),
        mode => Err(tls_error(format!(
            "ssl mode {mode:?} needs TLS but the server does not offer CLIENT_SSL"
        ))),
    }
}

/// Connection error of kind `Ssl`.
pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_required_modes_fail_without_server_support() {
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = validate_ssl_mode(mode, 0).unwrap_err();
            assert!(matches!(
                err,
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Ssl,
                    ..
                })
            ));
        }
    }
}
