//! Whole HTTP messages smuggled through HTTP bodies.
//!
//! The `/poll` response body is a fully serialized outgoing request
//! (proxy-form request line, headers, body) and the `/push` request body is a
//! fully serialized response. This module is the only place those bytes are
//! produced or consumed.
//!
//! Serialization always re-frames the body with an explicit `Content-Length`;
//! parsing accepts `Content-Length`, chunked transfer coding (trailers are
//! folded into the header map), or an unframed remainder-of-buffer body, so
//! that messages produced by other implementations round-trip.

use bytes::{BufMut, Bytes, BytesMut};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    HeaderMap, Method, Request, Response, StatusCode, Uri, Version,
};

/// Header correlating a scrape request with its pushed response. Minted by
/// the proxy, echoed by the client, stripped before delivery to the scraper.
pub const ID_HEADER: &str = "id";

const MAX_HEADERS: usize = 128;

/// Errors produced when parsing a serialized message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer ended before the message head was complete.
    #[error("message head is incomplete")]
    TruncatedHead,
    /// The message head did not parse as HTTP.
    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),
    /// The request method was not recognized.
    #[error("invalid method: {0}")]
    Method(#[from] http::method::InvalidMethod),
    /// The request target was not a valid URI.
    #[error("invalid request target: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    /// The status code was out of range.
    #[error("invalid status code: {0}")]
    Status(#[from] http::status::InvalidStatusCode),
    /// A header name was not valid.
    #[error("invalid header name: {0}")]
    HeaderName(#[from] http::header::InvalidHeaderName),
    /// A header value was not valid.
    #[error("invalid header value: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
    /// The `Content-Length` header did not parse as an integer.
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    /// The body ended before its declared length.
    #[error("body ends before its declared length")]
    TruncatedBody,
    /// A chunked body was malformed.
    #[error("malformed chunked body")]
    MalformedChunk,
}

/// Serialize `request` in proxy form: absolute request target, headers, and
/// a `Content-Length`-framed body.
#[must_use]
pub fn write_request(request: &Request<Bytes>) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + request.body().len());
    out.extend_from_slice(request.method().as_str().as_bytes());
    out.put_u8(b' ');
    out.extend_from_slice(request.uri().to_string().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    if !request.headers().contains_key(HOST) {
        if let Some(authority) = request.uri().authority() {
            out.extend_from_slice(b"host: ");
            out.extend_from_slice(authority.as_str().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    write_headers(request.headers(), request.body().len(), &mut out);
    out.extend_from_slice(request.body());
    out.freeze()
}

/// Serialize `response`: status line, headers, and a `Content-Length`-framed
/// body.
#[must_use]
pub fn write_response(response: &Response<Bytes>) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + response.body().len());
    let status = response.status();
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.put_u8(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
    write_headers(response.headers(), response.body().len(), &mut out);
    out.extend_from_slice(response.body());
    out.freeze()
}

/// Parse a serialized request.
///
/// # Errors
///
/// Returns an error if the head is truncated or malformed, or if the body
/// does not match its declared framing.
pub fn read_request(buf: &Bytes) -> Result<Request<Bytes>, Error> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut parsed_headers);
    let head_len = match parsed.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(Error::TruncatedHead),
    };
    let method = Method::from_bytes(parsed.method.ok_or(Error::TruncatedHead)?.as_bytes())?;
    let uri: Uri = parsed.path.ok_or(Error::TruncatedHead)?.parse()?;
    let version = http_version(parsed.version);
    let mut headers = header_map(parsed.headers)?;
    let body = read_body(&mut headers, buf.slice(head_len..))?;

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Parse a serialized response.
///
/// # Errors
///
/// Returns an error if the head is truncated or malformed, or if the body
/// does not match its declared framing.
pub fn read_response(buf: &Bytes) -> Result<Response<Bytes>, Error> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut parsed_headers);
    let head_len = match parsed.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(Error::TruncatedHead),
    };
    let status = StatusCode::from_u16(parsed.code.ok_or(Error::TruncatedHead)?)?;
    let version = http_version(parsed.version);
    let mut headers = header_map(parsed.headers)?;
    let body = read_body(&mut headers, buf.slice(head_len..))?;

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    Ok(response)
}

fn http_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        headers.append(
            HeaderName::from_bytes(header.name.as_bytes())?,
            HeaderValue::from_bytes(header.value)?,
        );
    }
    Ok(headers)
}

// The serialized body is always re-framed with an explicit length; the
// original framing headers would lie about it.
fn write_headers(headers: &HeaderMap, body_len: usize, out: &mut BytesMut) {
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"content-length: ");
    out.extend_from_slice(body_len.to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .is_ok_and(|v| v.to_ascii_lowercase().contains("chunked"))
    })
}

fn read_body(headers: &mut HeaderMap, rest: Bytes) -> Result<Bytes, Error> {
    if is_chunked(headers) {
        let (body, trailers) = decode_chunked(&rest)?;
        // The decoded message is no longer chunked; a stale framing claim
        // would corrupt any onward delivery.
        while headers.remove(TRANSFER_ENCODING).is_some() {}
        for (name, value) in trailers {
            headers.append(name, value);
        }
        return Ok(body);
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length: usize = value
            .to_str()
            .map_err(|_| Error::InvalidContentLength)?
            .trim()
            .parse()
            .map_err(|_| Error::InvalidContentLength)?;
        if rest.len() < length {
            return Err(Error::TruncatedBody);
        }
        return Ok(rest.slice(..length));
    }
    // No framing: the remainder of the buffer is the body.
    Ok(rest)
}

fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], Error> {
    let start = *pos;
    let end = buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(Error::MalformedChunk)?;
    *pos = start + end + 2;
    Ok(&buf[start..start + end])
}

fn decode_chunked(rest: &[u8]) -> Result<(Bytes, Vec<(HeaderName, HeaderValue)>), Error> {
    let mut out = BytesMut::new();
    let mut pos = 0;
    loop {
        let line = read_line(rest, &mut pos)?;
        let size_text = line.split(|b| *b == b';').next().unwrap_or_default();
        let size_text = std::str::from_utf8(size_text).map_err(|_| Error::MalformedChunk)?;
        let size = usize::from_str_radix(size_text.trim(), 16).map_err(|_| Error::MalformedChunk)?;
        if size == 0 {
            break;
        }
        if rest.len() < pos + size + 2 {
            return Err(Error::TruncatedBody);
        }
        out.extend_from_slice(&rest[pos..pos + size]);
        if &rest[pos + size..pos + size + 2] != b"\r\n" {
            return Err(Error::MalformedChunk);
        }
        pos += size + 2;
    }
    // Trailer section: header lines until a blank line, folded into the map.
    let mut trailers = Vec::new();
    loop {
        let line = read_line(rest, &mut pos)?;
        if line.is_empty() {
            break;
        }
        let split = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(Error::MalformedChunk)?;
        let name = HeaderName::from_bytes(&line[..split])?;
        let mut value = &line[split + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        trailers.push((name, HeaderValue::from_bytes(value)?));
    }
    Ok((out.freeze(), trailers))
}
