//! The HTTP/1.1 opening handshake.
//!
//! A client opens a WebSocket connection with a plain HTTP GET carrying a
//! `Sec-WebSocket-Key` header. The server proves it understood the request by
//! echoing back `base64(SHA1(key + GUID))` in a fixed `101 Switching
//! Protocols` response, after which both sides speak frames.
//!
//! Header parsing here is intentionally minimal: the engine owns the raw TCP
//! stream and sees the request as one buffered blob, so the request is split
//! on CRLF and each header line on its first `:`. Header names are kept
//! case-sensitive; values may be separated by `":"` or the conventional
//! `": "`.

use std::collections::HashMap;

use base64::prelude::*;
use sha1::{Digest, Sha1};

/// Handshake GUID from RFC 6455 Section 1.3.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The request header carrying the client's nonce.
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";

/// Parses the headers of an HTTP upgrade request.
///
/// Splits on CRLF, skips the request line and the trailing element, and maps
/// each `Name: value` line into a case-sensitive `HashMap`. An incomplete
/// request (no terminating blank line) yields an empty map.
pub fn parse_request_headers(request: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let lines: Vec<&str> = request.split("\r\n").collect();
    if lines.len() < 2 {
        return headers;
    }

    for line in &lines[1..lines.len() - 1] {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        headers.insert(name.to_string(), value.to_string());
    }

    headers
}

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn derive_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Builds the complete `101 Switching Protocols` response for a client key,
/// CRLF-delimited with a blank-line terminator.
pub fn upgrade_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        derive_accept_key(key)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known key/accept pair from RFC 6455 Section 1.3.
    const KEY: &str = "x3JJHMbDL1EzLkh9GBhXDw==";
    const ACCEPT: &str = "HSmrc0sMlYUkAGmm5OPpG2HaGWk=";

    #[test]
    fn test_accept_key_vector() {
        assert_eq!(derive_accept_key(KEY), ACCEPT);
    }

    #[test]
    fn test_upgrade_response_exact() {
        let expected = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {ACCEPT}\r\n\r\n"
        );
        assert_eq!(upgrade_response(KEY), expected);
    }

    #[test]
    fn test_parse_headers() {
        let request = "GET /chat HTTP/1.1\r\n\
                       Host: example.com\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw==\r\n\
                       Sec-WebSocket-Version: 13\r\n\
                       \r\n";
        let headers = parse_request_headers(request);

        assert_eq!(headers.len(), 5);
        assert_eq!(headers["Host"], "example.com");
        assert_eq!(headers["Upgrade"], "websocket");
        assert_eq!(headers[SEC_WEBSOCKET_KEY], "x3JJHMbDL1EzLkh9GBhXDw==");
        assert_eq!(headers["Sec-WebSocket-Version"], "13");
    }

    #[test]
    fn test_parse_headers_case_sensitive() {
        let request = "GET / HTTP/1.1\r\nhost: a\r\nHost: b\r\n\r\n";
        let headers = parse_request_headers(request);
        assert_eq!(headers["host"], "a");
        assert_eq!(headers["Host"], "b");
    }

    #[test]
    fn test_parse_headers_tight_separator() {
        let request = "GET / HTTP/1.1\r\nHost:example.com\r\n\r\n";
        let headers = parse_request_headers(request);
        assert_eq!(headers["Host"], "example.com");
    }

    #[test]
    fn test_parse_headers_value_with_colon() {
        let request = "GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let headers = parse_request_headers(request);
        assert_eq!(headers["Host"], "example.com:8080");
    }

    #[test]
    fn test_incomplete_request_is_empty() {
        assert!(parse_request_headers("").is_empty());
        assert!(parse_request_headers("GET / HTTP/1.1").is_empty());
        assert!(parse_request_headers("GET / HTTP/1.1\r\nHost: example.com").is_empty());
    }
}
