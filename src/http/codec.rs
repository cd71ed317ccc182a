//! HTTP/1.1 codec: incremental request parsing, chunked-body framing, and
//! response serialization.
//!
//! Parsing is pull-based: the connection accumulates transport bytes in a
//! growable buffer and asks the codec for progress. `parse_request` either
//! produces a complete head plus the number of bytes it consumed, or asks
//! for more input. Body framing beyond the head is handled by the caller
//! (Content-Length counting) or by [`ChunkDecoder`].

use crate::{
    errors::ProtocolError,
    events::Headers,
    http::types::{has_token, parse_hex, parse_usize, status_phrase, HttpVersion, Method},
    limits::HttpLimits,
};
use memchr::memmem;
use percent_encoding::percent_decode;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Cap on one chunk-size line (hex digits plus any extension).
const MAX_CHUNK_LINE: usize = 1024;
/// Cap on the trailer block after the zero chunk.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// A fully parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestRecord {
    pub(crate) method: Method,
    pub(crate) version: HttpVersion,
    /// Percent-decoded path.
    pub(crate) path: String,
    /// On-the-wire path bytes, query excluded.
    pub(crate) raw_path: Vec<u8>,
    /// Query bytes without the `?`.
    pub(crate) query: Vec<u8>,
    /// Ordered headers, names lowercased.
    pub(crate) headers: Headers,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) keep_alive: bool,
    /// The request carries `Connection: upgrade`.
    pub(crate) upgrade: bool,
}

/// Incremental head parse. `Ok(None)` means the terminator has not arrived
/// yet; `Ok(Some((record, consumed)))` hands back the head and how many
/// buffer bytes it covered (body bytes may follow at `consumed`).
pub(crate) fn parse_request(
    buf: &[u8],
    limits: &HttpLimits,
) -> Result<Option<(RequestRecord, usize)>, ProtocolError> {
    let Some(end) = memmem::find(buf, HEAD_TERMINATOR) else {
        // No terminator yet. Anything longer than the cap can no longer
        // become a valid head.
        if buf.len() > limits.max_header_bytes {
            return Err(ProtocolError::HeaderTooLarge);
        }
        return Ok(None);
    };

    let consumed = end + HEAD_TERMINATOR.len();
    if consumed > limits.max_header_bytes {
        return Err(ProtocolError::HeaderTooLarge);
    }
    let head = &buf[..end];

    let line_end = memmem::find(head, b"\r\n").unwrap_or(head.len());
    let (line, rest) = head.split_at(line_end);
    let record = parse_request_line(line)?;
    let header_block = rest.strip_prefix(b"\r\n").unwrap_or(rest);

    let mut record = record;
    parse_header_block(header_block, limits, &mut record)?;

    Ok(Some((record, consumed)))
}

fn parse_request_line(line: &[u8]) -> Result<RequestRecord, ProtocolError> {
    let (method, consumed) = Method::from_bytes(line)?;
    let rest = &line[consumed..];

    let space = memchr::memchr(b' ', rest).ok_or(ProtocolError::InvalidTarget)?;
    let (target, version_part) = rest.split_at(space);
    let version = HttpVersion::from_bytes(&version_part[1..])?;

    if target.first() != Some(&b'/') {
        return Err(ProtocolError::InvalidTarget);
    }

    let (raw_path, query) = match memchr::memchr(b'?', target) {
        Some(at) => (&target[..at], &target[at + 1..]),
        None => (target, &[][..]),
    };

    let path = percent_decode(raw_path)
        .decode_utf8()
        .map_err(|_| ProtocolError::InvalidTarget)?
        .into_owned();

    Ok(RequestRecord {
        method,
        version,
        path,
        raw_path: raw_path.to_vec(),
        query: query.to_vec(),
        headers: Vec::new(),
        content_length: None,
        chunked: false,
        keep_alive: version.default_keep_alive(),
        upgrade: false,
    })
}

fn parse_header_block(
    block: &[u8],
    limits: &HttpLimits,
    record: &mut RequestRecord,
) -> Result<(), ProtocolError> {
    if block.is_empty() {
        return Ok(());
    }
    for line in split_crlf(block) {
        if record.headers.len() == limits.max_headers {
            return Err(ProtocolError::TooManyHeaders);
        }
        let (name, value) = parse_header_line(line)?;
        apply_special_header(&name, &value, record)?;
        record.headers.push((name, value));
    }
    Ok(())
}

fn parse_header_line(line: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
    let colon = memchr::memchr(b':', line).ok_or(ProtocolError::InvalidHeader)?;
    let (raw_name, raw_value) = line.split_at(colon);

    // Field names allow no whitespace; obs-fold is rejected wholesale.
    if raw_name.is_empty()
        || raw_name
            .iter()
            .any(|&b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
    {
        return Err(ProtocolError::InvalidHeader);
    }

    let mut name = raw_name.to_vec();
    name.make_ascii_lowercase();
    let value = raw_value[1..].trim_ascii().to_vec();

    Ok((name, value))
}

fn apply_special_header(
    name: &[u8],
    value: &[u8],
    record: &mut RequestRecord,
) -> Result<(), ProtocolError> {
    match name {
        b"content-length" => {
            let length = parse_usize(value).ok_or(ProtocolError::InvalidContentLength)?;
            // A repeated Content-Length must agree with itself.
            if record.content_length.is_some_and(|prior| prior != length) {
                return Err(ProtocolError::InvalidContentLength);
            }
            record.content_length = Some(length);
        }
        b"transfer-encoding" => {
            if has_token(value, b"chunked") {
                // Smuggling guard: chunked and Content-Length never mix.
                if record.content_length.is_some() {
                    return Err(ProtocolError::InvalidContentLength);
                }
                record.chunked = true;
            }
        }
        b"connection" => {
            if has_token(value, b"close") {
                record.keep_alive = false;
            } else if has_token(value, b"keep-alive") {
                record.keep_alive = true;
            }
            if has_token(value, b"upgrade") {
                record.upgrade = true;
            }
        }
        _ => {}
    }
    if record.chunked && record.content_length.is_some() {
        return Err(ProtocolError::InvalidContentLength);
    }
    Ok(())
}

/// Splits a header block (no trailing terminator) at CRLF boundaries.
fn split_crlf(block: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for at in memmem::find_iter(block, b"\r\n") {
        lines.push(&block[start..at]);
        start = at + 2;
    }
    lines.push(&block[start..]);
    lines
}

// --- Chunked request bodies -------------------------------------------------

/// Output of one [`ChunkDecoder::decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunked {
    /// The buffer holds no complete piece; read more.
    NeedMore,
    /// One slice of body payload (possibly part of a larger chunk).
    Data(Vec<u8>),
    /// The zero chunk and its trailer block were consumed.
    Complete { trailers: Headers },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder. Consumes parsed bytes
/// from the front of the caller's buffer; payload is streamed out without
/// waiting for chunk boundaries.
#[derive(Debug)]
pub(crate) struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub(crate) fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Chunked, ProtocolError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(nl) = memchr::memchr(b'\n', buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ProtocolError::InvalidChunk);
                        }
                        return Ok(Chunked::NeedMore);
                    };
                    if nl == 0 || buf[nl - 1] != b'\r' || nl > MAX_CHUNK_LINE {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    let line = &buf[..nl - 1];
                    // Chunk extensions are tolerated and ignored.
                    let digits = match memchr::memchr(b';', line) {
                        Some(at) => &line[..at],
                        None => line,
                    };
                    let size = parse_hex(digits).ok_or(ProtocolError::InvalidChunk)?;
                    buf.drain(..nl + 1);
                    self.state = match size {
                        0 => ChunkState::Trailers,
                        _ => ChunkState::Data { remaining: size },
                    };
                }
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(Chunked::NeedMore);
                    }
                    let take = remaining.min(buf.len());
                    let data: Vec<u8> = buf.drain(..take).collect();
                    self.state = match remaining - take {
                        0 => ChunkState::DataCrlf,
                        left => ChunkState::Data { remaining: left },
                    };
                    return Ok(Chunked::Data(data));
                }
                ChunkState::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(Chunked::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    buf.drain(..2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    if buf.starts_with(b"\r\n") {
                        buf.drain(..2);
                        self.state = ChunkState::Done;
                        return Ok(Chunked::Complete {
                            trailers: Vec::new(),
                        });
                    }
                    let Some(end) = memmem::find(buf, HEAD_TERMINATOR) else {
                        if buf.len() > MAX_TRAILER_BYTES {
                            return Err(ProtocolError::InvalidChunk);
                        }
                        return Ok(Chunked::NeedMore);
                    };
                    let mut trailers = Vec::new();
                    for line in split_crlf(&buf[..end]) {
                        let (name, value) =
                            parse_header_line(line).map_err(|_| ProtocolError::InvalidChunk)?;
                        trailers.push((name, value));
                    }
                    buf.drain(..end + HEAD_TERMINATOR.len());
                    self.state = ChunkState::Done;
                    return Ok(Chunked::Complete { trailers });
                }
                ChunkState::Done => {
                    return Ok(Chunked::Complete {
                        trailers: Vec::new(),
                    })
                }
            }
        }
    }
}

// --- Response serialization -------------------------------------------------

/// RFC 7231 `Date` value for the current instant.
pub(crate) fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Status line plus headers plus the blank line. Appends `date` when the
/// application supplied none, `transfer-encoding: chunked` when chunk
/// framing is on, and `connection: close` when the connection will not
/// persist.
pub(crate) fn serialize_start(
    status: u16,
    headers: &Headers,
    chunked: bool,
    close: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_phrase(status).as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut saw_date = false;
    let mut saw_connection = false;
    for (name, value) in headers {
        saw_date |= name == b"date";
        saw_connection |= name == b"connection";
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if !saw_date {
        out.extend_from_slice(b"date: ");
        out.extend_from_slice(http_date().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if chunked {
        out.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }
    if close && !saw_connection {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// One body piece. With chunk framing the final call emits the zero chunk,
/// unless a trailer block follows (`trailers_follow`), in which case the
/// terminator is left to [`serialize_trailers`].
pub(crate) fn serialize_body(
    chunk: &[u8],
    more: bool,
    chunked: bool,
    trailers_follow: bool,
) -> Vec<u8> {
    if !chunked {
        return chunk.to_vec();
    }

    let mut out = Vec::with_capacity(chunk.len() + 32);
    if !chunk.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    if !more {
        match trailers_follow {
            true => out.extend_from_slice(b"0\r\n"),
            false => out.extend_from_slice(b"0\r\n\r\n"),
        }
    }
    out
}

/// Trailer block after the zero chunk.
pub(crate) fn serialize_trailers(headers: &Headers) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for (name, value) in headers {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod parse {
    use super::*;
    use crate::events::header;

    fn parse(input: &str) -> Result<Option<(RequestRecord, usize)>, ProtocolError> {
        parse_request(input.as_bytes(), &HttpLimits::default())
    }

    fn parsed(input: &str) -> RequestRecord {
        parse(input).unwrap().unwrap().0
    }

    #[test]
    fn simple_get() {
        let record = parsed("GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(record.method, Method::Get);
        assert_eq!(record.version, HttpVersion::Http11);
        assert_eq!(record.path, "/hello");
        assert_eq!(record.raw_path, b"/hello");
        assert_eq!(record.query, b"");
        assert_eq!(record.headers, vec![header("host", "x")]);
        assert!(record.keep_alive);
        assert!(!record.chunked);
        assert_eq!(record.content_length, None);
    }

    #[test]
    fn consumed_excludes_body() {
        let input = "POST /e HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (record, consumed) = parse(input).unwrap().unwrap();
        assert_eq!(consumed, input.len() - 5);
        assert_eq!(record.content_length, Some(5));
    }

    #[test]
    fn incomplete_head_asks_for_more() {
        #[rustfmt::skip]
        let cases = [
            "",
            "GET",
            "GET /hello HTTP/1.1",
            "GET /hello HTTP/1.1\r\nHost: x\r\n",
            "GET /hello HTTP/1.1\r\nHost: x\r\n\r",
        ];
        for input in cases {
            assert_eq!(parse(input), Ok(None), "{input:?}");
        }
    }

    #[test]
    fn percent_decoding() {
        let record = parsed("GET /a%20b/c%C3%A9?x=%20 HTTP/1.1\r\n\r\n");
        assert_eq!(record.path, "/a b/cé");
        assert_eq!(record.raw_path, b"/a%20b/c%C3%A9");
        assert_eq!(record.query, b"x=%20");
    }

    #[test]
    fn header_names_lowercased_order_kept() {
        let record = parsed("GET / HTTP/1.1\r\nX-B: 2\r\nHOST: h\r\nX-B: 3\r\n\r\n");
        assert_eq!(
            record.headers,
            vec![header("x-b", "2"), header("host", "h"), header("x-b", "3")]
        );
    }

    #[test]
    fn connection_and_version_keep_alive() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                          true),
            ("GET / HTTP/1.0\r\n\r\n",                          false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",     false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", true),
        ];
        for (input, keep_alive) in cases {
            assert_eq!(parsed(input).keep_alive, keep_alive, "{input:?}");
        }
    }

    #[test]
    fn chunked_transfer_encoding() {
        let record = parsed("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(record.chunked);
        assert_eq!(record.content_length, None);
    }

    #[test]
    fn malformed_lines() {
        #[rustfmt::skip]
        let cases = [
            ("BREW / HTTP/1.1\r\n\r\n",                 ProtocolError::InvalidMethod),
            ("GET/ HTTP/1.1\r\n\r\n",                   ProtocolError::InvalidMethod),
            ("GET nopath HTTP/1.1\r\n\r\n",             ProtocolError::InvalidTarget),
            ("GET /\r\n\r\n",                           ProtocolError::InvalidTarget),
            ("GET / HTTP/2.0\r\n\r\n",                  ProtocolError::UnsupportedVersion),
            ("GET / HTP/1.1\r\n\r\n",                   ProtocolError::InvalidVersion),
            ("GET / HTTP/1.1\r\nNoColonHere\r\n\r\n",   ProtocolError::InvalidHeader),
            ("GET / HTTP/1.1\r\n: novalue\r\n\r\n",     ProtocolError::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: v\r\n\r\n",   ProtocolError::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n", ProtocolError::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
                ProtocolError::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nTransfer-Encoding: chunked\r\n\r\n",
                ProtocolError::InvalidContentLength),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input), Err(expected), "{input:?}");
        }
    }

    #[test]
    fn header_block_limit_is_exact() {
        let limits = HttpLimits::default();
        let line = "GET / HTTP/1.1\r\n";
        // Build a request whose head is exactly the limit.
        let filler_len = limits.max_header_bytes - line.len() - "x: \r\n".len() - 2;
        let at_limit = format!("{line}x: {}\r\n\r\n", "v".repeat(filler_len));
        assert_eq!(at_limit.len(), limits.max_header_bytes);
        assert!(parse(&at_limit).unwrap().is_some());

        let over = format!("{line}x: {}\r\n\r\n", "v".repeat(filler_len + 1));
        assert_eq!(parse(&over), Err(ProtocolError::HeaderTooLarge));

        // Oversized buffer with no terminator in sight.
        let endless = format!("{line}x: {}", "v".repeat(limits.max_header_bytes));
        assert_eq!(parse(&endless), Err(ProtocolError::HeaderTooLarge));
    }

    #[test]
    fn too_many_headers() {
        let limits = HttpLimits::default();
        let head = format!(
            "GET / HTTP/1.1\r\n{}\r\n",
            "a: b\r\n".repeat(limits.max_headers + 1)
        );
        assert_eq!(
            parse_request(head.as_bytes(), &limits),
            Err(ProtocolError::TooManyHeaders)
        );
    }

    #[test]
    fn upgrade_flag() {
        let record =
            parsed("GET /ws HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n");
        assert!(record.upgrade);
        assert!(record.keep_alive);
    }
}
