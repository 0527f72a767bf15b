//! Incremental HTTP/1.x request and response accumulators.
//!
//! Both sides of the proxy feed raw socket reads into these types chunk by
//! chunk; a chunk may split any token, including the middle of the request
//! line or a chunked-body size field. Parsing never goes backwards: the
//! observable state only ever advances through
//! `Incomplete → FirstLineDone → HeadersDone → FullBody`, and `Bad` is
//! terminal.
//!
//! The accumulator keeps the original wire bytes untouched. Re-serialising
//! a request only ever rewrites the request line (absolute-form targets are
//! rewritten to origin form for the upstream hop), everything after the
//! first CRLF is forwarded byte for byte.

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method};
use url::Url;

/// Default upstream port when the target authority does not carry one.
pub const DEFAULT_PORT: u16 = 80;

const MAX_HEADERS: usize = 64;

/// Progressive parse state of a message accumulator.
///
/// States are ordered by progress; `Bad` is absorbing and must be checked
/// before any ordered comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseState {
    Incomplete,
    FirstLineDone,
    HeadersDone,
    FullBody,
    Bad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    /// no body at all
    None,
    /// exactly this many bytes after the header block
    Length(usize),
    /// chunked transfer coding, walked to the terminal chunk
    Chunked,
    /// body runs until the peer closes (responses only)
    UntilClose,
}

enum ChunkedState {
    Complete,
    Incomplete,
    Malformed,
}

/// A client request accumulated from socket reads.
pub struct Request {
    buf: Vec<u8>,
    state: ParseState,
    method: Option<Method>,
    target: Option<String>,
    version: u8,
    headers: HeaderMap,
    header_end: usize,
    framing: BodyFraming,
}

impl Request {
    pub fn new(part: &[u8]) -> Request {
        let mut request = Request {
            buf: Vec::with_capacity(part.len()),
            state: ParseState::Incomplete,
            method: None,
            target: None,
            version: 1,
            headers: HeaderMap::new(),
            header_end: 0,
            framing: BodyFraming::None,
        };
        request.add_part(part);
        request
    }

    /// Feed more bytes. Slices of any size are fine, token boundaries do
    /// not matter.
    pub fn add_part(&mut self, part: &[u8]) {
        if self.state == ParseState::Bad || self.state == ParseState::FullBody {
            return;
        }
        self.buf.extend_from_slice(part);
        self.advance();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Target host and port of the request.
    ///
    /// The authority of an absolute-form request line wins over the `Host`
    /// header; `CONNECT` uses its authority-form target. The port defaults
    /// to 80 when absent.
    pub fn host(&self) -> Option<(String, u16)> {
        let target = self.target.as_deref()?;

        if self.method == Some(Method::CONNECT) {
            return split_authority(target);
        }

        if target.contains("://") {
            if let Ok(url) = Url::parse(target) {
                let host = url.host_str()?.to_string();
                let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);
                return Some((host, port));
            }
        }

        let host_header = self.headers.get(http::header::HOST)?.to_str().ok()?;
        split_authority(host_header)
    }

    /// Origin-form request target for the upstream hop.
    pub fn uri(&self) -> Option<String> {
        let target = self.target.as_deref()?;
        if target.contains("://") {
            if let Ok(url) = Url::parse(target) {
                let path = if url.path().is_empty() { "/" } else { url.path() };
                return Some(match url.query() {
                    Some(query) => format!("{path}?{query}"),
                    None => path.to_string(),
                });
            }
        }
        Some(target.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Whether the client sent its own conditional request. Those are
    /// forwarded untouched instead of being revalidated from the cache.
    pub fn is_validating(&self) -> bool {
        self.headers.contains_key(http::header::IF_NONE_MATCH)
            || self.headers.contains_key(http::header::IF_MODIFIED_SINCE)
    }

    /// Wire bytes to send upstream: the original message with the request
    /// line rewritten to origin form when the client used absolute form.
    pub fn wire(&self) -> Vec<u8> {
        let absolute = self
            .target
            .as_deref()
            .map(|target| target.contains("://"))
            .unwrap_or(false);
        if !absolute {
            return self.buf.clone();
        }

        let line_end = match find_crlf(&self.buf, 0) {
            Some(end) => end + 2,
            None => return self.buf.clone(),
        };
        let method = self.method.as_ref().map(|m| m.as_str()).unwrap_or("GET");
        let uri = self.uri().unwrap_or_else(|| "/".to_string());
        let mut wire = format!("{method} {uri} HTTP/1.{}\r\n", self.version).into_bytes();
        wire.extend_from_slice(&self.buf[line_end..]);
        wire
    }

    fn advance(&mut self) {
        if self.state < ParseState::HeadersDone {
            let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut storage);
            match parsed.parse(&self.buf) {
                Err(_) => {
                    self.state = ParseState::Bad;
                    return;
                }
                Ok(httparse::Status::Partial) => {
                    if self.state == ParseState::Incomplete && find_crlf(&self.buf, 0).is_some() {
                        self.state = ParseState::FirstLineDone;
                    }
                    return;
                }
                Ok(httparse::Status::Complete(header_end)) => {
                    let method = parsed
                        .method
                        .and_then(|name| Method::from_bytes(name.as_bytes()).ok());
                    let target = parsed.path.map(str::to_owned);
                    let version = parsed.version.unwrap_or(1);
                    let headers = collect_headers(parsed.headers);

                    let (Some(method), Some(target)) = (method, target) else {
                        self.state = ParseState::Bad;
                        return;
                    };
                    let Ok(framing) = framed_body(&headers, None) else {
                        self.state = ParseState::Bad;
                        return;
                    };

                    self.method = Some(method);
                    self.target = Some(target);
                    self.version = version;
                    self.headers = headers;
                    self.header_end = header_end;
                    self.framing = framing;
                    self.state = ParseState::HeadersDone;
                }
            }
        }

        if self.state == ParseState::HeadersDone {
            match body_progress(self.framing, &self.buf[self.header_end..]) {
                BodyProgress::Done => self.state = ParseState::FullBody,
                BodyProgress::Malformed => self.state = ParseState::Bad,
                BodyProgress::Pending => {}
            }
        }
    }
}

/// An origin response accumulated from socket reads.
pub struct Response {
    buf: Vec<u8>,
    state: ParseState,
    code: Option<u16>,
    headers: HeaderMap,
    header_end: usize,
    framing: BodyFraming,
}

impl Response {
    pub fn new(part: &[u8]) -> Response {
        let mut response = Response {
            buf: Vec::with_capacity(part.len()),
            state: ParseState::Incomplete,
            code: None,
            headers: HeaderMap::new(),
            header_end: 0,
            framing: BodyFraming::UntilClose,
        };
        response.add_part(part);
        response
    }

    pub fn add_part(&mut self, part: &[u8]) {
        if self.state == ParseState::Bad || self.state == ParseState::FullBody {
            return;
        }
        self.buf.extend_from_slice(part);
        self.advance();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Status code, available as soon as the status line is complete.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The accumulated wire bytes as received from the origin.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// The peer closed the connection: an until-close body is complete now.
    pub fn finalize(&mut self) {
        if self.state == ParseState::HeadersDone && self.framing == BodyFraming::UntilClose {
            self.state = ParseState::FullBody;
        }
    }

    /// Whether this response may be stored for later revalidation: a 200
    /// carrying a validator (`ETag` or `Last-Modified`) and no
    /// `Cache-Control: no-store` or `private`. The originating request
    /// method is the engine's to check.
    pub fn is_cacheable(&self) -> bool {
        if self.code != Some(200) {
            return false;
        }
        let has_validator = self.headers.contains_key(http::header::ETAG)
            || self.headers.contains_key(http::header::LAST_MODIFIED);
        if !has_validator {
            return false;
        }
        for value in self.headers.get_all(http::header::CACHE_CONTROL) {
            if let Ok(directives) = value.to_str() {
                let directives = directives.to_ascii_lowercase();
                if directives.contains("no-store") || directives.contains("private") {
                    return false;
                }
            }
        }
        true
    }

    fn advance(&mut self) {
        if self.state < ParseState::HeadersDone {
            let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut storage);
            match parsed.parse(&self.buf) {
                Err(_) => {
                    self.state = ParseState::Bad;
                    return;
                }
                Ok(httparse::Status::Partial) => {
                    if self.state == ParseState::Incomplete && find_crlf(&self.buf, 0).is_some() {
                        self.state = ParseState::FirstLineDone;
                        self.code = parsed.code;
                    }
                    return;
                }
                Ok(httparse::Status::Complete(header_end)) => {
                    let Some(code) = parsed.code else {
                        self.state = ParseState::Bad;
                        return;
                    };
                    let headers = collect_headers(parsed.headers);
                    let Ok(framing) = framed_body(&headers, Some(code)) else {
                        self.state = ParseState::Bad;
                        return;
                    };

                    self.code = Some(code);
                    self.headers = headers;
                    self.header_end = header_end;
                    self.framing = framing;
                    self.state = ParseState::HeadersDone;
                }
            }
        }

        if self.state == ParseState::HeadersDone {
            match body_progress(self.framing, &self.buf[self.header_end..]) {
                BodyProgress::Done => self.state = ParseState::FullBody,
                BodyProgress::Malformed => self.state = ParseState::Bad,
                BodyProgress::Pending => {}
            }
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes());
        let value = HeaderValue::from_bytes(header.value);
        if let (Ok(name), Ok(value)) = (name, value) {
            headers.append(name, value);
        }
    }
    headers
}

/// Decide how the message body is framed. `status` is `None` for requests.
///
/// Transfer-Encoding wins over Content-Length; a Content-Length that does
/// not parse is a framing violation.
fn framed_body(headers: &HeaderMap, status: Option<u16>) -> Result<BodyFraming, ()> {
    for value in headers.get_all(TRANSFER_ENCODING) {
        if let Ok(codings) = value.to_str() {
            if codings.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }
    }

    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok())
            .ok_or(())?;
        return Ok(BodyFraming::Length(length));
    }

    match status {
        None => Ok(BodyFraming::None),
        Some(code) if (100..200).contains(&code) || code == 204 || code == 304 => {
            Ok(BodyFraming::None)
        }
        Some(_) => Ok(BodyFraming::UntilClose),
    }
}

enum BodyProgress {
    Done,
    Pending,
    Malformed,
}

fn body_progress(framing: BodyFraming, body: &[u8]) -> BodyProgress {
    match framing {
        BodyFraming::None => BodyProgress::Done,
        BodyFraming::Length(length) => {
            if body.len() >= length {
                BodyProgress::Done
            } else {
                BodyProgress::Pending
            }
        }
        BodyFraming::Chunked => match chunked_progress(body) {
            ChunkedState::Complete => BodyProgress::Done,
            ChunkedState::Incomplete => BodyProgress::Pending,
            ChunkedState::Malformed => BodyProgress::Malformed,
        },
        BodyFraming::UntilClose => BodyProgress::Pending,
    }
}

/// Walk chunk boundaries without decoding; the proxy forwards the raw
/// coding and only needs to know where the message ends.
///
/// Chunk format: `[hex-size][;ext]\r\n[data]\r\n`, terminated by a
/// zero-size chunk and a blank line (optionally preceded by trailers).
fn chunked_progress(data: &[u8]) -> ChunkedState {
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(data, pos) {
            Some(index) => index,
            None => return ChunkedState::Incomplete,
        };

        let size_field = &data[pos..line_end];
        let size_field = match size_field.iter().position(|&byte| byte == b';') {
            Some(semicolon) => &size_field[..semicolon],
            None => size_field,
        };
        let Ok(size_text) = std::str::from_utf8(size_field) else {
            return ChunkedState::Malformed;
        };
        let Ok(chunk_size) = usize::from_str_radix(size_text.trim(), 16) else {
            return ChunkedState::Malformed;
        };

        pos = line_end + 2;

        if chunk_size == 0 {
            // terminal chunk: a blank line, or trailers then a blank line
            if pos + 2 > data.len() {
                return ChunkedState::Incomplete;
            }
            if data[pos..pos + 2] == *b"\r\n" {
                return ChunkedState::Complete;
            }
            return match find_crlf_crlf(data, pos) {
                Some(_) => ChunkedState::Complete,
                None => ChunkedState::Incomplete,
            };
        }

        if pos + chunk_size + 2 > data.len() {
            return ChunkedState::Incomplete;
        }
        pos += chunk_size;
        if data[pos..pos + 2] != *b"\r\n" {
            return ChunkedState::Malformed;
        }
        pos += 2;
    }
}

/// Split `host[:port]`, defaulting the port. A port that does not parse is
/// a malformed authority.
fn split_authority(authority: &str) -> Option<(String, u16)> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), DEFAULT_PORT)),
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|position| from + position)
}

fn find_crlf_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| from + position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_advances_through_states() {
        let mut request = Request::new(b"GET / HT");
        assert_eq!(request.state(), ParseState::Incomplete);

        request.add_part(b"TP/1.1\r\nHo");
        assert_eq!(request.state(), ParseState::FirstLineDone);

        request.add_part(b"st: example.test\r\n");
        assert_eq!(request.state(), ParseState::FirstLineDone);

        request.add_part(b"\r\n");
        assert_eq!(request.state(), ParseState::FullBody);
        assert_eq!(request.method(), Some(&Method::GET));
    }

    #[test]
    fn request_survives_byte_by_byte_feeding() {
        let wire = b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-Length: 4\r\n\r\nbody";
        let mut request = Request::new(&wire[..1]);
        for byte in &wire[1..] {
            request.add_part(std::slice::from_ref(byte));
        }
        assert_eq!(request.state(), ParseState::FullBody);
        assert_eq!(request.host(), Some(("a.test".to_string(), DEFAULT_PORT)));
    }

    #[test]
    fn malformed_request_line_is_bad() {
        let request = Request::new(b"NOTAMETHOD /\r\n\r\n");
        assert_eq!(request.state(), ParseState::Bad);
    }

    #[test]
    fn bad_state_is_absorbing() {
        let mut request = Request::new(b"NOTAMETHOD /\r\n\r\n");
        request.add_part(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.state(), ParseState::Bad);
    }

    #[test]
    fn unparseable_content_length_is_bad() {
        let request = Request::new(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(request.state(), ParseState::Bad);
    }

    #[test]
    fn request_with_content_length_waits_for_body() {
        let mut request = Request::new(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
        assert_eq!(request.state(), ParseState::HeadersDone);
        request.add_part(b"lo");
        assert_eq!(request.state(), ParseState::FullBody);
    }

    #[test]
    fn chunked_request_completes_at_terminal_chunk() {
        let mut request =
            Request::new(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n");
        assert_eq!(request.state(), ParseState::HeadersDone);
        request.add_part(b"0\r\n\r\n");
        assert_eq!(request.state(), ParseState::FullBody);
    }

    #[test]
    fn chunked_size_inside_data_is_not_terminal() {
        let request = Request::new(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nc\r\n0\r\n\r\nhello\r\n\r\n0\r\n\r\n",
        );
        assert_eq!(request.state(), ParseState::FullBody);
    }

    #[test]
    fn chunked_garbage_size_is_bad() {
        let request =
            Request::new(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nhello\r\n");
        assert_eq!(request.state(), ParseState::Bad);
    }

    #[test]
    fn host_prefers_absolute_target_over_host_header() {
        let request =
            Request::new(b"GET http://origin.test:8080/a HTTP/1.1\r\nHost: other.test\r\n\r\n");
        assert_eq!(request.host(), Some(("origin.test".to_string(), 8080)));
    }

    #[test]
    fn host_defaults_port_for_absolute_target() {
        let request = Request::new(b"GET http://origin.test/a HTTP/1.1\r\n\r\n");
        assert_eq!(request.host(), Some(("origin.test".to_string(), 80)));
    }

    #[test]
    fn host_falls_back_to_host_header() {
        let request = Request::new(b"GET /a HTTP/1.1\r\nHost: origin.test:81\r\n\r\n");
        assert_eq!(request.host(), Some(("origin.test".to_string(), 81)));
    }

    #[test]
    fn connect_target_is_authority_form() {
        let request = Request::new(b"CONNECT origin.test:443 HTTP/1.1\r\n\r\n");
        assert_eq!(request.state(), ParseState::FullBody);
        assert_eq!(request.method(), Some(&Method::CONNECT));
        assert_eq!(request.host(), Some(("origin.test".to_string(), 443)));
    }

    #[test]
    fn uri_rewrites_absolute_to_origin_form() {
        let request = Request::new(b"GET http://origin.test/x?q=1 HTTP/1.1\r\n\r\n");
        assert_eq!(request.uri().as_deref(), Some("/x?q=1"));

        let bare = Request::new(b"GET http://origin.test HTTP/1.1\r\n\r\n");
        assert_eq!(bare.uri().as_deref(), Some("/"));
    }

    #[test]
    fn wire_rewrites_only_the_request_line() {
        let request = Request::new(
            b"GET http://origin.test/x?q=1 HTTP/1.0\r\nHost: origin.test\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(
            request.wire(),
            b"GET /x?q=1 HTTP/1.0\r\nHost: origin.test\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn wire_is_identity_for_origin_form() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-Length: 4\r\n\r\nbody";
        let request = Request::new(raw);
        assert_eq!(request.wire(), raw.to_vec());
    }

    #[test]
    fn validating_requests_are_recognised() {
        let conditional =
            Request::new(b"GET / HTTP/1.1\r\nHost: a.test\r\nIf-None-Match: \"x\"\r\n\r\n");
        assert!(conditional.is_validating());

        let plain = Request::new(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n");
        assert!(!plain.is_validating());
    }

    #[test]
    fn response_code_is_available_at_first_line() {
        let mut response = Response::new(b"HTTP/1.1 304 Not Modified\r\nSer");
        assert_eq!(response.state(), ParseState::FirstLineDone);
        assert_eq!(response.code(), Some(304));

        response.add_part(b"ver: test\r\n\r\n");
        assert_eq!(response.state(), ParseState::FullBody);
    }

    #[test]
    fn response_with_content_length_completes() {
        let mut response = Response::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n");
        assert_eq!(response.state(), ParseState::HeadersDone);
        response.add_part(b"hi");
        assert_eq!(response.state(), ParseState::FullBody);
    }

    #[test]
    fn response_without_framing_completes_on_close() {
        let mut response = Response::new(b"HTTP/1.0 200 OK\r\n\r\npartial body");
        assert_eq!(response.state(), ParseState::HeadersDone);
        response.finalize();
        assert_eq!(response.state(), ParseState::FullBody);
    }

    #[test]
    fn chunked_response_completes_at_terminal_chunk() {
        let response = Response::new(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        assert_eq!(response.state(), ParseState::FullBody);
    }

    #[test]
    fn cacheable_needs_200_and_validator() {
        let with_etag =
            Response::new(b"HTTP/1.1 200 OK\r\nETag: \"a\"\r\nContent-Length: 2\r\n\r\nhi");
        assert!(with_etag.is_cacheable());

        let with_date = Response::new(
            b"HTTP/1.1 200 OK\r\nLast-Modified: Mon, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(with_date.is_cacheable());

        let no_validator = Response::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        assert!(!no_validator.is_cacheable());

        let not_found =
            Response::new(b"HTTP/1.1 404 Not Found\r\nETag: \"a\"\r\nContent-Length: 0\r\n\r\n");
        assert!(!not_found.is_cacheable());
    }

    #[test]
    fn cache_control_no_store_and_private_block_caching() {
        let no_store = Response::new(
            b"HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: no-store\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(!no_store.is_cacheable());

        let private = Response::new(
            b"HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: private, max-age=60\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(!private.is_cacheable());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = Response::new(b"HTTP/1.1 200 OK\r\netag: \"a\"\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(response.header("ETag"), Some("\"a\""));
        assert_eq!(response.header("eTaG"), Some("\"a\""));
    }
}
