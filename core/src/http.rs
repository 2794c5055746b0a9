//! The minimal HTTP/1.1 boundary: just enough request parsing
//! to log what came in, and a fixed 200 OK response. Included in the core
//! because it's what the rest of the stack terminates at, not because it's
//! meant to be a real web server.

use crate::error::{CoreError, CoreResult};

pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

const DEFAULT_BODY: &str = "<html><body><h1>It works.</h1></body></html>";

/// Parses the request line and headers out of one pipelined request. Stops
/// at the first CRLF-CRLF; anything after it (a request body, a second
/// pipelined request) is left for the caller to deal with.
pub fn parse_request(buf: &[u8]) -> CoreResult<Request> {
    let text = String::from_utf8_lossy(buf);
    let header_end = text
        .find("\r\n\r\n")
        .ok_or_else(|| CoreError::parse("no CRLF-CRLF terminating the request headers"))?;
    let mut lines = text[..header_end].split("\r\n");

    let request_line = lines.next().ok_or_else(|| CoreError::parse("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| CoreError::parse("missing method"))?.to_string();
    let uri = parts.next().ok_or_else(|| CoreError::parse("missing URI"))?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Request { method, uri, version, headers })
}

/// Builds the fixed `200 OK` response every request gets, regardless of
/// method or path. This is a demonstration endpoint, not a router.
pub fn build_response() -> Vec<u8> {
    let body = DEFAULT_BODY.as_bytes();
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Parses `request_buf` for logging purposes only — a parse failure never
/// stops the fixed response from being returned, since the response does
/// not depend on anything the client sent.
pub fn handle(request_buf: &[u8]) -> Vec<u8> {
    let _ = parse_request(request_buf);
    build_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n";
        let req = parse_request(buf).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers, vec![("Host".to_string(), "x".to_string()), ("Accept".to_string(), "*/*".to_string())]);
    }

    #[test]
    fn response_starts_with_200_ok_and_matching_content_length() {
        let response = build_response();
        let text = String::from_utf8(response.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body_len = response.len() - body_start;
        assert!(text.contains(&format!("Content-Length: {body_len}")));
    }

    #[test]
    fn handle_ignores_unparsable_request_and_still_responds() {
        let response = handle(b"not even close to an http request");
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 200 OK"));
    }
}
