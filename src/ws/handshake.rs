//! WebSocket opening handshake (RFC 6455 §4), server side.

use crate::{
    errors::ProtocolError,
    events::Headers,
    http::{codec::RequestRecord, types::Method},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Validated upgrade request, ready for a `websocket.accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The derived `Sec-WebSocket-Accept` value.
    pub(crate) accept: String,
    /// Subprotocols offered by the client, in offer order.
    pub(crate) subprotocols: Vec<String>,
}

/// Whether this request is asking to become a WebSocket at all. A `false`
/// means plain HTTP; a `true` routes into [`validate`], which may still
/// reject the handshake.
pub(crate) fn is_upgrade(record: &RequestRecord) -> bool {
    record.upgrade
        && header(record, b"upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case(b"websocket"))
}

/// Full handshake validation: version 13, a key, GET over HTTP/1.1.
pub(crate) fn validate(record: &RequestRecord) -> Result<Handshake, ProtocolError> {
    if record.method != Method::Get {
        return Err(ProtocolError::BadHandshake);
    }
    if header(record, b"sec-websocket-version") != Some(b"13") {
        return Err(ProtocolError::BadHandshake);
    }
    let key = header(record, b"sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or(ProtocolError::BadHandshake)?;

    let mut subprotocols = Vec::new();
    for (name, value) in &record.headers {
        if name == b"sec-websocket-protocol" {
            for offer in value.split(|&b| b == b',') {
                let offer = offer.trim_ascii();
                if !offer.is_empty() {
                    subprotocols.push(String::from_utf8_lossy(offer).into_owned());
                }
            }
        }
    }

    Ok(Handshake {
        accept: derive_accept(key),
        subprotocols,
    })
}

/// `base64(SHA-1(key + GUID))`.
pub(crate) fn derive_accept(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID);
    BASE64.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response completing the handshake.
pub(crate) fn serialize_response(
    accept: &str,
    subprotocol: Option<&str>,
    extra_headers: &Headers,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"upgrade: websocket\r\n");
    out.extend_from_slice(b"connection: Upgrade\r\n");
    out.extend_from_slice(b"sec-websocket-accept: ");
    out.extend_from_slice(accept.as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(subprotocol) = subprotocol {
        out.extend_from_slice(b"sec-websocket-protocol: ");
        out.extend_from_slice(subprotocol.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra_headers {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn header<'r>(record: &'r RequestRecord, name: &[u8]) -> Option<&'r [u8]> {
    record
        .headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_slice())
}

#[cfg(test)]
mod handshake {
    use super::*;
    use crate::{http::codec::parse_request, limits::HttpLimits};

    fn record(head: &str) -> RequestRecord {
        parse_request(head.as_bytes(), &HttpLimits::default())
            .unwrap()
            .unwrap()
            .0
    }

    const UPGRADE: &str = "GET /chat HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";

    #[test]
    fn rfc_sample_accept_value() {
        // Worked example from RFC 6455 §1.3.
        assert_eq!(
            derive_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn detects_upgrade_requests() {
        assert!(is_upgrade(&record(UPGRADE)));
        assert!(!is_upgrade(&record("GET / HTTP/1.1\r\nHost: x\r\n\r\n")));
        // Connection token without the Upgrade header is not an upgrade.
        assert!(!is_upgrade(&record(
            "GET / HTTP/1.1\r\nConnection: upgrade\r\n\r\n"
        )));
    }

    #[test]
    fn validates_and_derives() {
        let shake = validate(&record(UPGRADE)).unwrap();
        assert_eq!(shake.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(shake.subprotocols.is_empty());
    }

    #[test]
    fn collects_subprotocol_offers() {
        let head = UPGRADE.replace(
            "\r\n\r\n",
            "\r\nSec-WebSocket-Protocol: chat, superchat\r\nSec-WebSocket-Protocol: v2\r\n\r\n",
        );
        let shake = validate(&record(&head)).unwrap();
        assert_eq!(shake.subprotocols, ["chat", "superchat", "v2"]);
    }

    #[test]
    fn rejects_bad_handshakes() {
        #[rustfmt::skip]
        let broken = [
            UPGRADE.replace("GET", "POST"),
            UPGRADE.replace("Version: 13", "Version: 8"),
            UPGRADE.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", ""),
        ];
        for head in broken {
            assert_eq!(
                validate(&record(&head)),
                Err(ProtocolError::BadHandshake),
                "{head:?}"
            );
        }
    }

    #[test]
    fn response_bytes() {
        let out = serialize_response("ACCEPTVALUE", Some("chat"), &vec![]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("sec-websocket-accept: ACCEPTVALUE\r\n"));
        assert!(text.contains("sec-websocket-protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
