//! Password transforms used by the authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password fast path
//!
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)
//! ```
//!
//! Full authentication sends the password either in clear over TLS or
//! RSA-encrypted after XOR with the seed.

use mywire_core::{Error, Result};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// The scramble proper is 20 bytes; servers may append a NUL.
fn seed(auth_data: &[u8]) -> &[u8] {
    match auth_data {
        [head @ .., 0] if head.len() == 20 => head,
        _ if auth_data.len() > 20 => &auth_data[..20],
        _ => auth_data,
    }
}

fn xor_into<const N: usize>(mut a: [u8; N], b: &[u8; N]) -> Vec<u8> {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
    a.to_vec()
}

/// mysql_native_password response; empty for an empty password.
pub fn native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed(auth_data));
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    xor_into(stage1, &stage3)
}

/// caching_sha2_password fast-auth response; empty for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed(auth_data));
    let scramble: [u8; 32] = hasher.finalize().into();

    xor_into(hash, &scramble)
}

/// NUL-terminated password, only ever sent over a secure channel.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// `password + NUL` XOR the seed, repeated cyclically.
pub fn xor_password_with_seed(password: &str, auth_data: &[u8]) -> Vec<u8> {
    let seed = seed(auth_data);
    let mut out = cleartext_password(password);
    if seed.is_empty() {
        return out;
    }
    for (i, b) in out.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    out
}

/// Encrypt the seed-XORed password with the server's RSA public key
/// (PKCS#8 or PKCS#1 PEM) using OAEP/SHA-1 padding.
pub fn rsa_encrypt_password(password: &str, auth_data: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed(auth_data).is_empty() {
        return Err(Error::auth("cannot encrypt password: empty scramble"));
    }
    let plain = xor_password_with_seed(password, auth_data);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| Error::auth(format!("server public key is not valid PEM: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| Error::auth(format!("failed to parse server public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| Error::auth(format!("RSA encryption of password failed: {e}")))
}
