//! Connection phase: initial handshake, optional TLS upgrade, and the
//! authentication exchange.

use crate::auth::{AuthContext, AuthPlugin, names, registry, status};
use crate::config::MySqlConfig;
use crate::protocol::capabilities::{CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SSL};
use crate::protocol::handshake::{
    AuthSwitchRequest, HandshakeResponse, InitialHandshake, ssl_request_payload,
};
use crate::protocol::{PacketReader, malformed, server_error};
use crate::scheduler::{Responder, Session, Step, Task, TaskContext, TaskEvent};
use crate::tls::validate_ssl_mode;
use futures_channel::oneshot;
use mywire_core::error::{ConnectionError, ConnectionErrorKind};
use mywire_core::{Error, Result};
use std::sync::Arc;

/// Server frames accepted before authentication is abandoned.
pub const MAX_AUTH_ROUNDS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitHandshake,
    AwaitTls,
    Authenticating,
    Done,
}

/// Runs the connection phase and reports the negotiated [`Session`].
#[derive(Debug)]
pub struct HandshakeTask {
    state: State,
    responder: Responder<Session>,
    handshake: Option<InitialHandshake>,
    plugin: Option<Box<dyn AuthPlugin>>,
    /// Latest challenge handed to the plugin
    scramble: Vec<u8>,
    rounds: u32,
}

impl HandshakeTask {
    pub fn new() -> (Self, oneshot::Receiver<Result<Session>>) {
        let (responder, rx) = Responder::new();
        let task = Self {
            state: State::AwaitHandshake,
            responder,
            handshake: None,
            plugin: None,
            scramble: Vec::new(),
            rounds: 0,
        };
        (task, rx)
    }

    /// Name of the plugin currently answering challenges.
    pub fn plugin_name(&self) -> Option<&'static str> {
        self.plugin.as_ref().map(|p| p.name())
    }

    fn on_handshake(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        if payload.first() == Some(&0xFF) {
            return Err(wrap(
                ConnectionErrorKind::Connect,
                "server refused the connection",
                server_error(payload),
            ));
        }
        let handshake = InitialHandshake::parse(payload)?;
        if handshake.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!(
                    "server {} does not support protocol 4.1",
                    handshake.server_version
                ),
            ));
        }

        let config = ctx.config();
        let use_ssl = validate_ssl_mode(config.ssl_mode, handshake.capabilities)?;
        let mut capabilities = config.capability_flags() & handshake.capabilities;
        if !use_ssl {
            capabilities &= !CLIENT_SSL;
        }
        tracing::debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            server_caps = format_args!("{:#010x}", handshake.capabilities),
            caps = format_args!("{capabilities:#010x}"),
            plugin = %handshake.auth_plugin,
            ssl = use_ssl,
            "server handshake"
        );

        {
            let session = ctx.session_mut();
            session.capabilities = capabilities;
            session.server_capabilities = handshake.capabilities;
            session.collation = config.collation;
            session.server_version = handshake.server_version.clone();
            session.connection_id = handshake.connection_id;
            session.status_flags = handshake.status_flags;
        }
        self.scramble = handshake.auth_data.clone();
        self.handshake = Some(handshake);

        if use_ssl {
            ctx.send(&ssl_request_payload(
                capabilities,
                config.max_packet_size,
                config.collation,
            ));
            ctx.request_tls(config.host.clone());
            self.state = State::AwaitTls;
            return Ok(Step::Continue);
        }
        self.send_response(ctx)
    }

    fn send_response(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        let Some(handshake) = self.handshake.as_ref() else {
            return Err(Error::protocol("handshake response before server handshake"));
        };
        let config = ctx.config();
        let secure = ctx.session().secure;
        let capabilities = ctx.session().capabilities;

        let requested = if handshake.capabilities & CLIENT_PLUGIN_AUTH == 0
            || handshake.auth_plugin.is_empty()
        {
            names::MYSQL_NATIVE_PASSWORD
        } else {
            handshake.auth_plugin.as_str()
        };

        // sha256_password would need the plaintext password or an RSA key we
        // cannot get: open with the default plugin and no password instead.
        let withhold = requested == names::SHA256_PASSWORD
            && !secure
            && config.server_public_key.is_none()
            && !config.allow_public_key_retrieval;
        let lookup = if withhold {
            config.default_auth_plugin.as_str()
        } else {
            requested
        };

        let mut plugin = registry::select(
            lookup,
            &config.default_auth_plugin,
            &config.extra_auth_plugins,
            &config.disabled_auth_plugins,
        )
        .ok_or_else(|| {
            Error::auth(format!(
                "no usable authentication plugin for {requested} (default {})",
                config.default_auth_plugin
            ))
        })?;

        let auth_response = if withhold {
            tracing::debug!(
                plugin = plugin.name(),
                "sha256_password without TLS or public key, sending empty response"
            );
            Vec::new()
        } else {
            let steps = plugin.next_step(&self.scramble, &auth_context(config, secure))?;
            steps.into_iter().next().unwrap_or_default()
        };

        let attributes = config.connection_attributes();
        let response = HandshakeResponse {
            capabilities,
            max_packet_size: config.max_packet_size,
            collation: config.collation,
            user: &config.user,
            auth_response: &auth_response,
            database: config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &attributes,
        }
        .to_payload()?;

        tracing::debug!(user = %config.user, plugin = plugin.name(), "sending handshake response");
        ctx.send(&response);
        self.plugin = Some(plugin);
        self.state = State::Authenticating;
        Ok(Step::Continue)
    }

    fn on_auth_frame(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        self.rounds += 1;
        if self.rounds > MAX_AUTH_ROUNDS {
            return Err(Error::auth("too many authentication rounds"));
        }

        match payload.first() {
            Some(0x00) => {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet()
                    .ok_or_else(|| malformed("OK packet", payload))?;
                let session = ctx.session_mut();
                session.status_flags = ok.status_flags;
                session.authenticated = true;
                let session = session.clone();
                tracing::debug!(
                    connection_id = session.connection_id,
                    rounds = self.rounds,
                    "authenticated"
                );
                self.state = State::Done;
                self.responder.send(Ok(session));
                Ok(Step::Done)
            }
            Some(0xFF) => Err(wrap(
                ConnectionErrorKind::Authentication,
                "authentication failed",
                server_error(payload),
            )),
            Some(0xFE) => {
                let switch = AuthSwitchRequest::parse(payload)?;
                self.switch_plugin(&switch.plugin, ctx)?;
                self.scramble = switch.data;
                let challenge = self.scramble.clone();
                self.answer(&challenge, ctx)
            }
            Some(&status::MORE_DATA) => self.answer(&payload[1..], ctx),
            _ => self.answer(payload, ctx),
        }
    }

    /// A different plugin starts from a fresh instance; the same plugin is
    /// reset in place.
    fn switch_plugin(&mut self, name: &str, ctx: &TaskContext<'_>) -> Result<()> {
        let config = ctx.config();
        let current = self.plugin.as_ref().map(|p| p.name());
        tracing::debug!(from = ?current, to = %name, "auth switch");

        match self.plugin.as_mut() {
            Some(plugin) if plugin.name() == name => plugin.reset(),
            _ => {
                let mut plugin = registry::lookup(
                    name,
                    &config.extra_auth_plugins,
                    &config.disabled_auth_plugins,
                )
                .ok_or_else(|| {
                    Error::auth(format!("server requested unsupported auth plugin {name}"))
                })?;
                plugin.reset();
                self.plugin = Some(plugin);
            }
        }
        Ok(())
    }

    fn answer(&mut self, challenge: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        let config = ctx.config();
        let secure = ctx.session().secure;
        let Some(plugin) = self.plugin.as_mut() else {
            return Err(Error::protocol("auth data before handshake response"));
        };
        for step in plugin.next_step(challenge, &auth_context(config, secure))? {
            ctx.send(&step);
        }
        Ok(Step::Continue)
    }
}

fn auth_context(config: &MySqlConfig, secure: bool) -> AuthContext<'_> {
    AuthContext {
        password: config.password_str(),
        secure,
        server_public_key: config.server_public_key.as_deref(),
        allow_public_key_retrieval: config.allow_public_key_retrieval,
        allow_cleartext_password: config.allow_cleartext_password,
    }
}

/// Connection error carrying the server's ERR as its source.
fn wrap(kind: ConnectionErrorKind, what: &str, err: Error) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: format!("{what}: {err}"),
        source: Some(Arc::new(err)),
    })
}

impl Task for HandshakeTask {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn start(&mut self, _ctx: &mut TaskContext<'_>) -> Result<Step> {
        // The server speaks first.
        Ok(Step::Continue)
    }

    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        match self.state {
            State::AwaitHandshake => self.on_handshake(payload, ctx),
            State::Authenticating => self.on_auth_frame(payload, ctx),
            State::AwaitTls | State::Done => Err(malformed("frame during connection phase", payload)),
        }
    }

    fn on_event(&mut self, event: TaskEvent, ctx: &mut TaskContext<'_>) -> Result<Step> {
        match (self.state, event) {
            (State::AwaitTls, TaskEvent::TlsEstablished) => {
                tracing::debug!("TLS established");
                self.send_response(ctx)
            }
            (state, event) => Err(Error::protocol(format!(
                "unexpected {event:?} in handshake state {state:?}"
            ))),
        }
    }

    fn on_error(&mut self, error: Error) {
        self.responder.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scramble;
    use crate::protocol::PacketWriter;
    use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, DEFAULT_CLIENT_FLAGS};
    use crate::protocol::frame::read_joined_payload;
    use crate::protocol::handshake::tests::handshake_payload;
    use crate::scheduler::{Outbound, Scheduler};
    use crate::config::SslMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SCRAMBLE: [u8; 20] = *b"abcdefghijklmnopqrst";

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_bytes(payload);
        w.build_packet(seq).0
    }

    fn sent(s: &mut Scheduler) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(item) = s.take_outbound() {
            if let Outbound::Frames(bytes) = item {
                let (joined, _) = read_joined_payload(&bytes).unwrap().unwrap();
                out.push((joined.first_seq, joined.payload));
            }
        }
        out
    }

    fn connect(config: MySqlConfig) -> (Scheduler, oneshot::Receiver<Result<Session>>) {
        let mut s = Scheduler::new(Arc::new(config));
        let (task, rx) = HandshakeTask::new();
        s.submit(Box::new(task));
        (s, rx)
    }

    fn ok_payload() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    #[test]
    fn test_native_password_login() {
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .default_auth_plugin(names::MYSQL_NATIVE_PASSWORD);
        let (mut s, mut rx) = connect(config);
        assert!(sent(&mut s).is_empty());

        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS, names::MYSQL_NATIVE_PASSWORD, &SCRAMBLE),
        ));
        let out = sent(&mut s);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 1);
        let expected = scramble::native_password("secret", &SCRAMBLE);
        assert!(out[0].1.windows(expected.len()).any(|w| w == expected.as_slice()));

        s.on_bytes_received(&frame(2, &ok_payload()));
        let session = rx.try_recv().unwrap().unwrap().unwrap();
        assert!(session.authenticated);
        assert_eq!(session.connection_id, 42);
        assert_eq!(session.status_flags, 0x0002);
        assert!(session.has_capability(CLIENT_DEPRECATE_EOF));
        assert!(s.is_idle());
    }

    #[test]
    fn test_auth_switch_to_native_password() {
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .default_auth_plugin(names::CACHING_SHA2_PASSWORD);
        let (mut s, mut rx) = connect(config);
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS, names::CACHING_SHA2_PASSWORD, &SCRAMBLE),
        ));
        sent(&mut s);

        let mut switch = vec![0xFE];
        switch.extend_from_slice(names::MYSQL_NATIVE_PASSWORD.as_bytes());
        switch.push(0);
        let fresh = *b"01234567890123456789";
        switch.extend_from_slice(&fresh);
        switch.push(0);
        s.on_bytes_received(&frame(2, &switch));

        let out = sent(&mut s);
        assert_eq!(out, vec![(3, scramble::native_password("secret", &fresh))]);
        s.on_bytes_received(&frame(4, &ok_payload()));
        assert!(rx.try_recv().unwrap().unwrap().is_ok());
    }

    static COUNTING_RESETS: AtomicUsize = AtomicUsize::new(0);

    fn counting() -> Box<dyn AuthPlugin> {
        #[derive(Debug)]
        struct Counting;
        impl AuthPlugin for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn reset(&mut self) {
                COUNTING_RESETS.fetch_add(1, Ordering::SeqCst);
            }
            fn next_step(&mut self, challenge: &[u8], _ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
                Ok(vec![challenge.to_vec()])
            }
        }
        Box::new(Counting)
    }

    #[test]
    fn test_auth_switch_resets_new_plugin() {
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .default_auth_plugin(names::CACHING_SHA2_PASSWORD)
            .auth_plugin("counting", counting);
        let server_caps = DEFAULT_CLIENT_FLAGS & !CLIENT_DEPRECATE_EOF;
        let expected_caps = config.capability_flags() & server_caps;
        let (mut s, mut rx) = connect(config);
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(server_caps, names::CACHING_SHA2_PASSWORD, &SCRAMBLE),
        ));
        sent(&mut s);
        assert_eq!(COUNTING_RESETS.load(Ordering::SeqCst), 0);

        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"counting");
        switch.push(0);
        switch.extend_from_slice(b"challenge");
        s.on_bytes_received(&frame(2, &switch));
        assert_eq!(sent(&mut s), vec![(3, b"challenge".to_vec())]);
        assert_eq!(COUNTING_RESETS.load(Ordering::SeqCst), 1);

        s.on_bytes_received(&frame(4, &ok_payload()));
        let session = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(session.capabilities, expected_caps);
        assert_eq!(session.server_capabilities, server_caps);
        assert!(!session.has_capability(CLIENT_DEPRECATE_EOF));
    }

    #[test]
    fn test_server_error_is_authentication_failure() {
        let (mut s, mut rx) = connect(MySqlConfig::new().user("app"));
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS, names::CACHING_SHA2_PASSWORD, &SCRAMBLE),
        ));
        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied");
        s.on_bytes_received(&frame(2, &err));

        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                ..
            })
        ));
        assert!(s.poisoned().is_some());
    }

    #[test]
    fn test_sha256_without_key_withholds_password() {
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .default_auth_plugin(names::MYSQL_NATIVE_PASSWORD);
        let (mut s, _rx) = connect(config);
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS, names::SHA256_PASSWORD, &SCRAMBLE),
        ));
        let out = sent(&mut s);
        let payload = &out[0].1;
        // user NUL, then an empty length-encoded auth response
        let user_end = 32 + b"app".len();
        assert_eq!(payload[user_end], 0);
        assert_eq!(payload[user_end + 1], 0);
        let name = names::MYSQL_NATIVE_PASSWORD.as_bytes();
        assert!(payload.windows(name.len()).any(|w| w == name));
        assert!(!payload.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_required_ssl_without_server_support() {
        let (mut s, mut rx) = connect(MySqlConfig::new().ssl_mode(SslMode::Required));
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS & !CLIENT_SSL, names::MYSQL_NATIVE_PASSWORD, &SCRAMBLE),
        ));
        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Ssl,
                ..
            })
        ));
    }

    #[test]
    fn test_ssl_request_then_response_after_upgrade() {
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .ssl_mode(SslMode::Preferred);
        let (mut s, _rx) = connect(config);
        s.on_bytes_received(&frame(
            0,
            &handshake_payload(DEFAULT_CLIENT_FLAGS | CLIENT_SSL, names::CACHING_SHA2_PASSWORD, &SCRAMBLE),
        ));

        let Some(Outbound::Frames(bytes)) = s.take_outbound() else {
            panic!("expected SSL request");
        };
        let (joined, _) = read_joined_payload(&bytes).unwrap().unwrap();
        assert_eq!(joined.first_seq, 1);
        assert_eq!(joined.payload.len(), 32);
        let caps = u32::from_le_bytes(joined.payload[..4].try_into().unwrap());
        assert!(caps & CLIENT_SSL != 0);
        assert!(matches!(s.take_outbound(), Some(Outbound::UpgradeTls { .. })));

        s.tls_established();
        let out = sent(&mut s);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 2);
    }

    #[test]
    fn test_too_many_rounds() {
        fn chatty() -> Box<dyn AuthPlugin> {
            #[derive(Debug)]
            struct Chatty;
            impl AuthPlugin for Chatty {
                fn name(&self) -> &'static str {
                    "chatty"
                }
                fn reset(&mut self) {}
                fn next_step(&mut self, _c: &[u8], _ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
                    Ok(vec![vec![1]])
                }
            }
            Box::new(Chatty)
        }

        let config = MySqlConfig::new()
            .auth_plugin("chatty", chatty)
            .default_auth_plugin("chatty");
        let (mut s, mut rx) = connect(config);
        s.on_bytes_received(&frame(0, &handshake_payload(DEFAULT_CLIENT_FLAGS, "chatty", &SCRAMBLE)));
        let mut seq = 2u8;
        for _ in 0..=MAX_AUTH_ROUNDS {
            if s.poisoned().is_some() {
                break;
            }
            s.on_bytes_received(&frame(seq, &[0x01, 0x07]));
            seq = seq.wrapping_add(2);
        }
        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert!(err.to_string().contains("too many authentication rounds"));
    }
}
