//! Byte-level HTTP/1.x helpers shared across the pipeline.

/// Split raw request/response bytes on the first blank line. The head keeps
/// the separator; input without one is treated as all head.
pub fn split_headers_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subsequence(raw, b"\r\n\r\n") {
        raw.split_at(pos + 4)
    } else if let Some(pos) = find_subsequence(raw, b"\n\n") {
        raw.split_at(pos + 2)
    } else {
        (raw, &[])
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse a request start line into (method, path, query, version). All
/// parts come back empty when the line is malformed.
pub fn parse_request_line(line: &str) -> (String, String, String, String) {
    let mut parts = line.splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Default::default();
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Default::default();
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };
    (method.to_string(), path, query, version.to_string())
}

/// Best-effort (method, host, path) extraction for listing and metadata.
/// Never fails; malformed input yields empty strings.
pub fn extract_request_meta(raw: &str) -> (String, String, String) {
    let mut lines = raw.split("\r\n").flat_map(|l| l.split('\n'));

    let start = lines.next().unwrap_or_default();
    let mut parts = start.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method.to_string(), path.to_string()),
        _ => return Default::default(),
    };

    let mut host = String::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host = value.trim().to_string();
                break;
            }
        }
    }
    (method, host, path)
}

/// Case-insensitive header lookup within a head block.
pub fn header_value(head: &[u8], name: &str) -> Option<String> {
    let head = String::from_utf8_lossy(head);
    for line in head.split("\r\n").flat_map(|l| l.split('\n')).skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Parse a response status line. Accepts HTTP/1.0, 1.1, 2 and 2.0; the
/// status code must be a three-digit integer in [100, 599], otherwise the
/// parse fails to (0, "").
pub fn parse_response_status(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw);
    let line = text
        .split('\n')
        .next()
        .unwrap_or_default()
        .trim_end_matches('\r');

    let mut parts = line.split_whitespace();
    let (Some(proto), Some(code)) = (parts.next(), parts.next()) else {
        return (0, String::new());
    };
    if !proto.starts_with("HTTP/") {
        return (0, String::new());
    }
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return (0, String::new());
    }
    let code: u16 = code.parse().unwrap_or(0);
    if !(100..=599).contains(&code) {
        return (0, String::new());
    }
    (code, line.to_string())
}

pub fn read_response_status_code(raw: &[u8]) -> u16 {
    parse_response_status(raw).0
}

/// Rewrite an `HTTP/2`/`HTTP/2.0` request start line to `HTTP/1.1`. Input
/// without a CRLF-terminated start line passes through untouched.
pub fn normalize_request_version(raw: &[u8]) -> Vec<u8> {
    let Some(line_end) = find_subsequence(raw, b"\r\n") else {
        return raw.to_vec();
    };
    let Ok(line) = std::str::from_utf8(&raw[..line_end]) else {
        return raw.to_vec();
    };

    let rewritten = if let Some(prefix) = line.strip_suffix(" HTTP/2.0") {
        format!("{prefix} HTTP/1.1")
    } else if let Some(prefix) = line.strip_suffix(" HTTP/2") {
        format!("{prefix} HTTP/1.1")
    } else {
        return raw.to_vec();
    };

    let mut out = rewritten.into_bytes();
    out.extend_from_slice(&raw[line_end..]);
    out
}

/// UTF-8 preview of a response body. Binary bodies collapse to a sentinel;
/// long bodies are truncated with an ellipsis marker.
pub fn preview_body(body: &[u8], max_len: usize) -> String {
    if body.is_empty() {
        return String::new();
    }
    let Ok(text) = std::str::from_utf8(body) else {
        return "<BINARY>".to_string();
    };
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_headers_body_cases() {
        let cases: &[(&[u8], &[u8], &[u8])] = &[
            (
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nbody here",
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
                b"body here",
            ),
            (
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
                b"",
            ),
            (
                b"POST / HTTP/1.1\r\n\r\n\x00\x01\x02",
                b"POST / HTTP/1.1\r\n\r\n",
                b"\x00\x01\x02",
            ),
            (b"malformed request", b"malformed request", b""),
        ];
        for (raw, want_head, want_body) in cases {
            let (head, body) = split_headers_body(raw);
            assert_eq!(&head, want_head);
            assert_eq!(&body, want_body);
        }
    }

    #[test]
    fn parse_request_line_cases() {
        let cases = [
            ("GET /api/users HTTP/1.1", ("GET", "/api/users", "", "HTTP/1.1")),
            (
                "GET /api/users?id=123&role=admin HTTP/1.1",
                ("GET", "/api/users", "id=123&role=admin", "HTTP/1.1"),
            ),
            ("POST /api/data HTTP/2", ("POST", "/api/data", "", "HTTP/2")),
            ("GET / HTTP/1.1", ("GET", "/", "", "HTTP/1.1")),
            ("GET /search?q= HTTP/1.1", ("GET", "/search", "q=", "HTTP/1.1")),
            ("", ("", "", "", "")),
        ];
        for (line, (method, path, query, version)) in cases {
            let got = parse_request_line(line);
            assert_eq!(got.0, method, "{line}");
            assert_eq!(got.1, path, "{line}");
            assert_eq!(got.2, query, "{line}");
            assert_eq!(got.3, version, "{line}");
        }
    }

    #[test]
    fn extract_request_meta_cases() {
        let cases = [
            (
                "GET /api/users HTTP/1.1\r\nHost: example.com\r\n\r\n",
                ("GET", "example.com", "/api/users"),
            ),
            (
                "POST /login HTTP/1.1\r\nHost: api.example.com:8080\r\n\r\n",
                ("POST", "api.example.com:8080", "/login"),
            ),
            (
                "GET / HTTP/1.1\r\nhost: lowercase.com\r\n\r\n",
                ("GET", "lowercase.com", "/"),
            ),
            ("garbage", ("", "", "")),
            ("", ("", "", "")),
        ];
        for (raw, (method, host, path)) in cases {
            let got = extract_request_meta(raw);
            assert_eq!(got.0, method, "{raw:?}");
            assert_eq!(got.1, host, "{raw:?}");
            assert_eq!(got.2, path, "{raw:?}");
        }
    }

    #[test]
    fn response_status_codes() {
        let cases: &[(&[u8], u16)] = &[
            (b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>", 200),
            (b"HTTP/1.0 404 Not Found\r\n\r\n", 404),
            (b"HTTP/2 200\r\nContent-Type: application/json\r\n\r\n{}", 200),
            (b"HTTP/2.0 500 Internal Server Error\r\n\r\n", 500),
            (b"HTTP/1.1 200 OK\nContent-Type: text/html\n\n<html>", 200),
            (b"HTTP/1.1 200 OK\r\n", 200),
            (b"HTTP/1.1 200\r\n\r\n", 200),
            (b"", 0),
            (b"GET / HTTP/1.1\r\n", 0),
            (b"HTTP/1.1200OK\r\n", 0),
            (b"HTTP/1.1 ABC OK\r\n", 0),
            (b"HTTP/1.1 99 Too Low\r\n", 0),
            (b"HTTP/1.1 600 Too High\r\n", 0),
            (b"HTTP/1.1 20", 0),
        ];
        for (input, expected) in cases {
            assert_eq!(read_response_status_code(input), *expected, "{input:?}");
        }
    }

    #[test]
    fn response_status_line_text() {
        let (code, line) = parse_response_status(b"HTTP/1.1 301 Moved Permanently\r\nLocation: /new\r\n\r\n");
        assert_eq!(code, 301);
        assert_eq!(line, "HTTP/1.1 301 Moved Permanently");

        let (code, line) = parse_response_status(b"HTTP/1.1");
        assert_eq!(code, 0);
        assert_eq!(line, "");
    }

    #[test]
    fn version_normalization() {
        let cases: &[(&[u8], &[u8])] = &[
            (
                b"POST /api/example HTTP/2\r\nHost: example.com\r\n\r\n",
                b"POST /api/example HTTP/1.1\r\nHost: example.com\r\n\r\n",
            ),
            (
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
            ),
            (
                b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n",
                b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n",
            ),
            (
                b"POST /api HTTP/2\r\nHost: t.com\r\nContent-Length: 4\r\n\r\ntest",
                b"POST /api HTTP/1.1\r\nHost: t.com\r\nContent-Length: 4\r\n\r\ntest",
            ),
            (b"GET / HTTP/2", b"GET / HTTP/2"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_request_version(input), expected.to_vec());
        }
    }

    #[test]
    fn preview_body_cases() {
        assert_eq!(preview_body(b"", 100), "");
        assert_eq!(preview_body(b"hello world", 100), "hello world");
        assert_eq!(preview_body(b"hello world", 5), "hello...");
        assert_eq!(preview_body(&[0x00, 0x01, 0xff], 100), "<BINARY>");
        // Truncation never splits a multi-byte character.
        assert_eq!(preview_body("ππππ".as_bytes(), 3), "π...");
    }
}
