//! HTTP/1.1 upgrade handshake that opens a framed connection.
//!
//! The header block is read up to the blank-line terminator. Any bytes that
//! arrived after the terminator in the same read belong to the frame stream
//! and are left for the caller; `parse_request` and `parse_response` report
//! how many bytes the header block used.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest header block accepted before the terminator must appear.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("header block exceeds {} bytes", MAX_HEADER_BYTES)]
    HeaderTooLarge,
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unexpected handshake status {0}")]
    BadStatus(u16),
    #[error("Sec-WebSocket-Accept does not match the key that was sent")]
    AcceptMismatch,
}

/// Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client's key, if this is a well-formed upgrade request.
    pub fn websocket_key(&self) -> Result<&str, HandshakeError> {
        if !self.method.eq_ignore_ascii_case("GET") {
            return Err(HandshakeError::Malformed("upgrade requires GET"));
        }
        self.header("sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: u16,
    headers: HashMap<String, String>,
}

impl HandshakeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Computes `base64(SHA1(key + GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Encodes 16 random bytes as a client key.
pub fn encode_client_key(nonce: [u8; 16]) -> String {
    STANDARD.encode(nonce)
}

pub fn switching_protocols(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

pub fn rejection(status: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    )
}

pub fn client_request(host: &str, path: &str, client_key: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, client_key
    )
}

/// Parses an upgrade request from the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    let Some((start, headers, used)) = parse_head(buf)? else {
        return Ok(None);
    };

    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or(HandshakeError::Malformed("empty request line"))?;
    let target = parts
        .next()
        .ok_or(HandshakeError::Malformed("missing request target"))?;
    let path = target.split('?').next().unwrap_or(target);

    Ok(Some((
        HandshakeRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        },
        used,
    )))
}

/// Parses the host's reply from the front of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>, HandshakeError> {
    let Some((start, headers, used)) = parse_head(buf)? else {
        return Ok(None);
    };

    let status = start
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(HandshakeError::Malformed("missing status code"))?;

    Ok(Some((HandshakeResponse { status, headers }, used)))
}

/// Checks that the host accepted the upgrade for `client_key`.
pub fn verify_response(
    response: &HandshakeResponse,
    client_key: &str,
) -> Result<(), HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::BadStatus(response.status));
    }
    match response.header("sec-websocket-accept") {
        Some(accept) if accept == accept_key(client_key) => Ok(()),
        _ => Err(HandshakeError::AcceptMismatch),
    }
}

type Head = (String, HashMap<String, String>, usize);

fn parse_head(buf: &[u8]) -> Result<Option<Head>, HandshakeError> {
    let Some(end) = find_terminator(buf) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(HandshakeError::HeaderTooLarge);
        }
        return Ok(None);
    };
    if end > MAX_HEADER_BYTES {
        return Err(HandshakeError::HeaderTooLarge);
    }

    let head = std::str::from_utf8(&buf[..end - TERMINATOR.len()])
        .map_err(|_| HandshakeError::Malformed("header block is not UTF-8"))?;
    let mut lines = head.split("\r\n");
    let start = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(HandshakeError::Malformed("missing start line"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(HandshakeError::Malformed("header without colon"))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(Some((start, headers, end)))
}

/// Index just past the first `\r\n\r\n`, if present.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
        .map(|pos| pos + TERMINATOR.len())
}
