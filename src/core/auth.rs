// src/core/auth.rs

//! Signed-cookie authentication for WebSocket clients.
//!
//! The issuing backend hands the browser four cookies: an opaque `token`, the
//! `user`, the issue `time` (unix seconds) and a `digest`, which is the
//! lowercase hex MD5 of `secret ‖ user ‖ token ‖ time`. The relay shares the
//! secret and recomputes the digest during the upgrade handshake.

use md5::{Digest, Md5};
use std::time::Duration;
use thiserror::Error;

/// The cookies the handshake collects for authentication. Every other cookie
/// is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthCookies {
    pub token: Option<String>,
    pub user: Option<String>,
    pub time: Option<String>,
    pub digest: Option<String>,
}

impl AuthCookies {
    /// Stores a cookie if its name is one of the four recognized ones and its
    /// value is non-empty. Returns whether it was kept.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        let slot = match name {
            "token" => &mut self.token,
            "user" => &mut self.user,
            "time" => &mut self.time,
            "digest" => &mut self.digest,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }
}

/// Why a set of cookies was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing cookie '{0}'")]
    MissingField(&'static str),

    #[error("cookie 'time' is not a unix timestamp")]
    InvalidTime,

    #[error("token issued {age}s ago has expired")]
    Expired { age: i64 },

    #[error("token issued {ahead}s in the future")]
    FromFuture { ahead: i64 },

    #[error("digest mismatch")]
    DigestMismatch,
}

/// A token that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub token: String,
    pub issued_at: i64,
    /// Unix time after which the connection is asked to close.
    pub expires_at: i64,
}

/// Verifies auth cookies against the shared secret. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    secret: String,
    lifetime: i64,
    clock_skew: i64,
}

impl TokenAuthenticator {
    pub fn new(secret: impl Into<String>, lifetime: Duration, clock_skew: Duration) -> Self {
        Self {
            secret: secret.into(),
            lifetime: lifetime.as_secs() as i64,
            clock_skew: clock_skew.as_secs() as i64,
        }
    }

    /// Computes the digest the issuing side attaches to a token.
    pub fn sign(&self, user: &str, token: &str, time: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(user.as_bytes());
        hasher.update(token.as_bytes());
        hasher.update(time.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Checks presence of all four cookies, the token age and the digest.
    /// A token exactly `lifetime` seconds old is still accepted.
    pub fn verify(&self, cookies: &AuthCookies, now: i64) -> Result<VerifiedToken, AuthError> {
        let token = cookies.token.as_deref().ok_or(AuthError::MissingField("token"))?;
        let user = cookies.user.as_deref().ok_or(AuthError::MissingField("user"))?;
        let time = cookies.time.as_deref().ok_or(AuthError::MissingField("time"))?;
        let digest = cookies
            .digest
            .as_deref()
            .ok_or(AuthError::MissingField("digest"))?;

        let issued_at: i64 = time.parse().map_err(|_| AuthError::InvalidTime)?;
        let age = now - issued_at;
        if age > self.lifetime {
            return Err(AuthError::Expired { age });
        }
        if -age > self.clock_skew {
            return Err(AuthError::FromFuture { ahead: -age });
        }

        if self.sign(user, token, time) != digest {
            return Err(AuthError::DigestMismatch);
        }

        Ok(VerifiedToken {
            token: token.to_string(),
            issued_at,
            expires_at: issued_at + self.lifetime,
        })
    }
}
