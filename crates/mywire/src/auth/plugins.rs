//! Built-in authentication plugins.

use super::scramble;
use super::{AuthContext, AuthPlugin, names, status};
use mywire_core::{Error, Result};

/// mysql_native_password: one SHA1 scramble, nothing more.
#[derive(Debug, Default)]
pub struct NativePassword {
    answered: bool,
}

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        names::MYSQL_NATIVE_PASSWORD
    }

    fn reset(&mut self) {
        self.answered = false;
    }

    fn next_step(&mut self, challenge: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
        if self.answered {
            return Err(Error::auth(
                "unexpected extra round for mysql_native_password",
            ));
        }
        self.answered = true;
        Ok(vec![scramble::native_password(ctx.password, challenge)])
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Sha2Stage {
    #[default]
    Initial,
    /// Fast-auth scramble sent, waiting for 0x03 / 0x04
    AwaitStatus,
    /// Asked for the public key
    AwaitKey,
    /// Password sent, only OK/ERR may follow
    Done,
}

/// caching_sha2_password: fast SHA256 path with full-auth fallback.
#[derive(Debug, Default)]
pub struct CachingSha2Password {
    stage: Sha2Stage,
    seed: Vec<u8>,
}

impl CachingSha2Password {
    fn full_auth(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
        if ctx.secure {
            self.stage = Sha2Stage::Done;
            return Ok(vec![scramble::cleartext_password(ctx.password)]);
        }
        if let Some(key) = ctx.server_public_key {
            self.stage = Sha2Stage::Done;
            return Ok(vec![scramble::rsa_encrypt_password(
                ctx.password,
                &self.seed,
                key,
            )?]);
        }
        if ctx.allow_public_key_retrieval {
            self.stage = Sha2Stage::AwaitKey;
            return Ok(vec![vec![status::REQUEST_PUBLIC_KEY]]);
        }
        Err(Error::auth(
            "caching_sha2_password full authentication requires TLS or the server public key, and public key retrieval is disabled",
        ))
    }
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        names::CACHING_SHA2_PASSWORD
    }

    fn reset(&mut self) {
        self.stage = Sha2Stage::Initial;
        self.seed.clear();
    }

    fn next_step(&mut self, challenge: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
        match self.stage {
            Sha2Stage::Initial => {
                self.seed = challenge.to_vec();
                self.stage = Sha2Stage::AwaitStatus;
                Ok(vec![scramble::caching_sha2_password(ctx.password, challenge)])
            }
            Sha2Stage::AwaitStatus => match challenge.first() {
                Some(&status::FAST_AUTH_SUCCESS) => {
                    tracing::debug!("caching_sha2_password fast auth succeeded");
                    self.stage = Sha2Stage::Done;
                    Ok(Vec::new())
                }
                Some(&status::PERFORM_FULL_AUTH) => {
                    tracing::debug!(secure = ctx.secure, "caching_sha2_password full auth");
                    self.full_auth(ctx)
                }
                other => Err(Error::auth(format!(
                    "unexpected caching_sha2_password status {:?}",
                    other
                ))),
            },
            Sha2Stage::AwaitKey => {
                self.stage = Sha2Stage::Done;
                Ok(vec![scramble::rsa_encrypt_password(
                    ctx.password,
                    &self.seed,
                    challenge,
                )?])
            }
            Sha2Stage::Done => Err(Error::auth(
                "unexpected extra round for caching_sha2_password",
            )),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Sha256Stage {
    #[default]
    Initial,
    AwaitKey,
    Done,
}

/// sha256_password: password over TLS, or RSA-encrypted.
#[derive(Debug, Default)]
pub struct Sha256Password {
    stage: Sha256Stage,
    seed: Vec<u8>,
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        names::SHA256_PASSWORD
    }

    fn reset(&mut self) {
        self.stage = Sha256Stage::Initial;
        self.seed.clear();
    }

    fn next_step(&mut self, challenge: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
        match self.stage {
            Sha256Stage::Initial => {
                self.seed = challenge.to_vec();
                if ctx.password.is_empty() {
                    self.stage = Sha256Stage::Done;
                    return Ok(vec![vec![0]]);
                }
                if ctx.secure {
                    self.stage = Sha256Stage::Done;
                    return Ok(vec![scramble::cleartext_password(ctx.password)]);
                }
                if let Some(key) = ctx.server_public_key {
                    self.stage = Sha256Stage::Done;
                    return Ok(vec![scramble::rsa_encrypt_password(
                        ctx.password,
                        challenge,
                        key,
                    )?]);
                }
                if ctx.allow_public_key_retrieval {
                    self.stage = Sha256Stage::AwaitKey;
                    return Ok(vec![vec![status::SHA256_REQUEST_PUBLIC_KEY]]);
                }
                Err(Error::auth(
                    "sha256_password requires TLS or the server public key, and public key retrieval is disabled",
                ))
            }
            Sha256Stage::AwaitKey => {
                self.stage = Sha256Stage::Done;
                Ok(vec![scramble::rsa_encrypt_password(
                    ctx.password,
                    &self.seed,
                    challenge,
                )?])
            }
            Sha256Stage::Done => Err(Error::auth("unexpected extra round for sha256_password")),
        }
    }
}

/// mysql_clear_password: refuses to run over plaintext unless allowed.
#[derive(Debug, Default)]
pub struct ClearPassword {
    answered: bool,
}

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        names::MYSQL_CLEAR_PASSWORD
    }

    fn reset(&mut self) {
        self.answered = false;
    }

    fn next_step(&mut self, _challenge: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<Vec<u8>>> {
        if self.answered {
            return Err(Error::auth("unexpected extra round for mysql_clear_password"));
        }
        if !ctx.secure && !ctx.allow_cleartext_password {
            return Err(Error::auth(
                "mysql_clear_password refused: connection is not encrypted",
            ));
        }
        self.answered = true;
        Ok(vec![scramble::cleartext_password(ctx.password)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scramble::tests::TEST_PUBLIC_KEY;

    fn ctx(password: &str) -> AuthContext<'_> {
        AuthContext {
            password,
            secure: false,
            server_public_key: None,
            allow_public_key_retrieval: false,
            allow_cleartext_password: false,
        }
    }

    #[test]
    fn test_native_single_round() {
        let mut plugin = NativePassword::default();
        let out = plugin.next_step(&[1; 20], &ctx("pw")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 20);
        assert!(plugin.next_step(&[], &ctx("pw")).is_err());

        plugin.reset();
        assert!(plugin.next_step(&[1; 20], &ctx("pw")).is_ok());
    }

    #[test]
    fn test_caching_sha2_fast_path() {
        let mut plugin = CachingSha2Password::default();
        let out = plugin.next_step(&[2; 20], &ctx("pw")).unwrap();
        assert_eq!(out[0].len(), 32);
        let out = plugin.next_step(&[status::FAST_AUTH_SUCCESS], &ctx("pw")).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_caching_sha2_full_auth_over_tls() {
        let mut plugin = CachingSha2Password::default();
        let secure = AuthContext {
            secure: true,
            ..ctx("pw")
        };
        plugin.next_step(&[2; 20], &secure).unwrap();
        let out = plugin.next_step(&[status::PERFORM_FULL_AUTH], &secure).unwrap();
        assert_eq!(out, vec![b"pw\0".to_vec()]);
    }

    #[test]
    fn test_caching_sha2_full_auth_refuses_plaintext() {
        let mut plugin = CachingSha2Password::default();
        plugin.next_step(&[2; 20], &ctx("pw")).unwrap();
        let err = plugin
            .next_step(&[status::PERFORM_FULL_AUTH], &ctx("pw"))
            .unwrap_err();
        assert!(err.to_string().contains("retrieval is disabled"));
    }

    #[test]
    fn test_caching_sha2_key_retrieval() {
        let mut plugin = CachingSha2Password::default();
        let c = AuthContext {
            allow_public_key_retrieval: true,
            ..ctx("pw")
        };
        plugin.next_step(&[3; 20], &c).unwrap();
        let out = plugin.next_step(&[status::PERFORM_FULL_AUTH], &c).unwrap();
        assert_eq!(out, vec![vec![status::REQUEST_PUBLIC_KEY]]);
        let out = plugin.next_step(TEST_PUBLIC_KEY.as_bytes(), &c).unwrap();
        assert_eq!(out[0].len(), 256);
    }

    #[test]
    fn test_sha256_paths() {
        let mut plugin = Sha256Password::default();
        assert!(plugin.next_step(&[1; 20], &ctx("pw")).is_err());

        plugin.reset();
        let with_key = AuthContext {
            server_public_key: Some(TEST_PUBLIC_KEY.as_bytes()),
            ..ctx("pw")
        };
        let out = plugin.next_step(&[1; 20], &with_key).unwrap();
        assert_eq!(out[0].len(), 256);

        plugin.reset();
        let out = plugin.next_step(&[1; 20], &ctx("")).unwrap();
        assert_eq!(out, vec![vec![0]]);
    }

    #[test]
    fn test_clear_password_requires_tls() {
        let mut plugin = ClearPassword::default();
        assert!(plugin.next_step(&[], &ctx("pw")).is_err());
        let secure = AuthContext {
            secure: true,
            ..ctx("pw")
        };
        assert_eq!(plugin.next_step(&[], &secure).unwrap(), vec![b"pw\0".to_vec()]);
    }
}
