//! Dumped HTTP/1.1 heads: start line plus header lines, no body.
use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{request, response, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use lazy_static::lazy_static;

const MAX_HEADERS: usize = 128;

lazy_static! {
    /// https://tools.ietf.org/html/rfc2616#section-13.5.1
    pub static ref HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
    ];
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

pub fn dump_request_head(parts: &request::Parts) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    buf.put_slice(parts.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            buf.put_slice(b"host: ");
            buf.put_slice(authority.as_str().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    put_headers(&mut buf, &parts.headers);
    buf.freeze()
}

pub fn dump_response_head(parts: &response::Parts) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(parts.status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(
        parts
            .status
            .canonical_reason()
            .unwrap_or("Unknown")
            .as_bytes(),
    );
    buf.put_slice(b"\r\n");

    put_headers(&mut buf, &parts.headers);
    buf.freeze()
}

/// Head consisting of a status line only, for failures produced by the tunnel itself.
pub fn status_head(status: StatusCode) -> Bytes {
    let (mut parts, ()) = Response::new(()).into_parts();
    parts.status = status;
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    dump_response_head(&parts)
}

fn version(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn copy_parsed_headers(
    parsed: &[httparse::Header<'_>],
    headers: &mut HeaderMap,
) -> Result<(), Error> {
    for header in parsed {
        headers.append(
            HeaderName::from_bytes(header.name.as_bytes()).map_err(http::Error::from)?,
            HeaderValue::from_bytes(header.value).map_err(http::Error::from)?,
        );
    }
    Ok(())
}

pub fn parse_request_head(buf: &[u8]) -> Result<request::Parts, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::malformed("incomplete request head")),
        Err(e) => return Err(Error::malformed(format!("bad request head: {}", e))),
    }

    let method = Method::from_bytes(req.method.unwrap_or("GET").as_bytes())
        .map_err(http::Error::from)?;
    let uri = req
        .path
        .unwrap_or("/")
        .parse::<Uri>()
        .map_err(http::Error::from)?;

    let (mut parts, ()) = Request::builder()
        .method(method)
        .uri(uri)
        .version(version(req.version))
        .body(())?
        .into_parts();

    copy_parsed_headers(req.headers, &mut parts.headers)?;

    Ok(parts)
}

pub fn parse_response_head(buf: &[u8]) -> Result<response::Parts, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::malformed("incomplete response head"))
        }
        Err(e) => return Err(Error::malformed(format!("bad response head: {}", e))),
    }

    let status = StatusCode::from_u16(res.code.unwrap_or(502)).map_err(http::Error::from)?;

    let (mut parts, ()) = Response::builder()
        .status(status)
        .version(version(res.version))
        .body(())?
        .into_parts();

    copy_parsed_headers(res.headers, &mut parts.headers)?;

    Ok(parts)
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("websocket"))
        .unwrap_or(false)
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Whether a request head announces a body.
pub fn has_body(headers: &HeaderMap) -> bool {
    match content_length(headers) {
        Some(len) => len > 0,
        None => headers.contains_key(TRANSFER_ENCODING),
    }
}
