// src/core/protocol/handshake.rs

//! Parses and validates the HTTP/1.1 upgrade request that opens every client
//! connection, and builds the matching responses.

use crate::core::auth::AuthCookies;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};

/// The GUID appended to the client key before hashing (RFC6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

static REQUEST_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^GET \S+ HTTP/1\.[0-9]$").expect("request line pattern is valid"));

/// A rejected upgrade, mapped to the HTTP status sent back before closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRejection {
    /// 400: malformed request or a missing/invalid upgrade header.
    BadRequest(&'static str),
    /// 403: the auth cookies did not verify.
    Forbidden(String),
    /// 429: the token already has a live connection.
    TooManyRequests,
}

impl HandshakeRejection {
    pub fn status(&self) -> u16 {
        match self {
            HandshakeRejection::BadRequest(_) => 400,
            HandshakeRejection::Forbidden(_) => 403,
            HandshakeRejection::TooManyRequests => 429,
        }
    }

    /// The full HTTP response for this rejection. `retry_after` is only used
    /// by the 429 response.
    pub fn response(&self, retry_after: u64) -> Bytes {
        let text = match self {
            HandshakeRejection::BadRequest(_) => {
                "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n".to_string()
            }
            HandshakeRejection::Forbidden(_) => {
                "HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n".to_string()
            }
            HandshakeRejection::TooManyRequests => format!(
                "HTTP/1.1 429 Too Many Requests\r\nRetry-After: {retry_after}\r\nConnection: close\r\n\r\n"
            ),
        };
        Bytes::from(text)
    }
}

/// The retained parts of an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    pub host: Option<String>,
    pub upgrade: Option<String>,
    pub connection: Option<String>,
    pub origin: Option<String>,
    pub key: Option<String>,
    pub version: Option<String>,
    pub cookies: AuthCookies,
}

/// Returns the length of the request head (through the blank line), if the
/// buffer already holds all of it.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

impl HandshakeRequest {
    /// Parses a complete request head. Continuation lines are folded into the
    /// preceding header before anything else is looked at.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeRejection> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeRejection::BadRequest("request head is not UTF-8"))?;
        let text = text.strip_suffix("\r\n\r\n").unwrap_or(text);
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default().trim();
        if !REQUEST_LINE.is_match(request_line) {
            return Err(HandshakeRejection::BadRequest("invalid request line"));
        }
        let path = request_line
            .split(' ')
            .nth(1)
            .unwrap_or_default()
            .to_string();

        let mut folded: Vec<String> = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with([' ', '\t']) {
                let Some(previous) = folded.last_mut() else {
                    return Err(HandshakeRejection::BadRequest(
                        "continuation line without a header",
                    ));
                };
                previous.push_str(line.trim());
                continue;
            }
            folded.push(line.to_string());
        }

        let mut request = HandshakeRequest {
            path,
            ..Default::default()
        };
        for header in &folded {
            let (name, value) = header
                .split_once(':')
                .ok_or(HandshakeRejection::BadRequest("header line without a colon"))?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "host" => request.host = Some(value.to_string()),
                "upgrade" => request.upgrade = Some(value.to_string()),
                "origin" => request.origin = Some(value.to_string()),
                "sec-websocket-key" => request.key = Some(value.to_string()),
                "sec-websocket-version" => request.version = Some(value.to_string()),
                "connection" => match request.connection.as_mut() {
                    Some(existing) => {
                        existing.push_str(", ");
                        existing.push_str(value);
                    }
                    None => request.connection = Some(value.to_string()),
                },
                "cookie" => {
                    for pair in value.split(';') {
                        if let Some((name, value)) = pair.trim().split_once('=') {
                            request.cookies.set(name, value);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(request)
    }

    /// Checks the upgrade headers against RFC6455 and the origin allow-list.
    pub fn validate(&self, allowed_origins: &[String]) -> Result<(), HandshakeRejection> {
        if self.host.as_deref().unwrap_or_default().is_empty() {
            return Err(HandshakeRejection::BadRequest("missing host"));
        }
        if self.upgrade.as_deref() != Some("websocket") {
            return Err(HandshakeRejection::BadRequest("upgrade is not 'websocket'"));
        }
        let upgrade_requested = self
            .connection
            .as_deref()
            .is_some_and(|c| c.split(',').any(|token| token.trim() == "Upgrade"));
        if !upgrade_requested {
            return Err(HandshakeRejection::BadRequest(
                "connection does not list 'Upgrade'",
            ));
        }
        match self.origin.as_deref() {
            Some(origin) if allowed_origins.iter().any(|o| o == origin) => {}
            _ => return Err(HandshakeRejection::BadRequest("origin not allowed")),
        }
        if self.key.as_deref().unwrap_or_default().is_empty() {
            return Err(HandshakeRejection::BadRequest("missing sec-websocket-key"));
        }
        if self.version.as_deref() != Some("13") {
            return Err(HandshakeRejection::BadRequest(
                "unsupported sec-websocket-version",
            ));
        }
        Ok(())
    }
}

/// Computes `Sec-WebSocket-Accept`: base64 of the SHA-1 of key ‖ GUID.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response completing the upgrade.
pub fn switching_protocols_response(key: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}
