//! Start-line path and query edits.

use super::http::parse_request_line;

#[derive(Debug, Default, Clone)]
pub struct PathQueryOpts {
    pub path: String,
    pub query: String,
    pub set_query: Vec<String>,
    pub remove_query: Vec<String>,
}

impl PathQueryOpts {
    pub fn has_modifications(&self) -> bool {
        !(self.path.is_empty()
            && self.query.is_empty()
            && self.set_query.is_empty()
            && self.remove_query.is_empty())
    }
}

/// Rewrite the request start line in place. Malformed input and empty opts
/// pass through byte-identical.
pub fn modify_request_line(raw: &[u8], opts: &PathQueryOpts) -> Vec<u8> {
    if !opts.has_modifications() {
        return raw.to_vec();
    }

    let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") else {
        return raw.to_vec();
    };
    let Ok(line) = std::str::from_utf8(&raw[..line_end]) else {
        return raw.to_vec();
    };

    let (method, mut path, query, version) = parse_request_line(line);
    if method.is_empty() {
        return raw.to_vec();
    }

    if !opts.path.is_empty() {
        path = opts.path.clone();
    }

    let mut params = if opts.query.is_empty() {
        parse_query(&query)
    } else {
        parse_query(&opts.query)
    };

    for name in &opts.remove_query {
        params.retain(|(key, _)| key != name);
    }
    for entry in &opts.set_query {
        let (name, value) = match entry.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (entry.clone(), Some(String::new())),
        };
        match params.iter_mut().find(|(key, _)| *key == name) {
            Some(pair) => pair.1 = value,
            None => params.push((name, value)),
        }
    }

    let query = serialize_query(&params);
    let target = if query.is_empty() {
        path
    } else {
        format!("{path}?{query}")
    };

    let mut out = format!("{method} {target} {version}").into_bytes();
    out.extend_from_slice(&raw[line_end..]);
    out
}

/// Parsed as raw name/value text; no percent decoding so payload bytes
/// survive the round trip. The value is `None` for bare `flag` params.
fn parse_query(query: &str) -> Vec<(String, Option<String>)> {
    if query.is_empty() {
        return Vec::new();
    }
    query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (pair.to_string(), None),
        })
        .collect()
}

fn serialize_query(params: &[(String, Option<String>)]) -> String {
    params
        .iter()
        .map(|(name, value)| match value {
            Some(value) => format!("{name}={value}"),
            None => name.clone(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(raw: &[u8], opts: &PathQueryOpts) -> String {
        String::from_utf8(modify_request_line(raw, opts)).unwrap()
    }

    #[test]
    fn empty_opts_are_identity() {
        let raw = b"GET /api/users HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            modify_request_line(raw, &PathQueryOpts::default()),
            raw.to_vec()
        );
    }

    #[test]
    fn replace_path_preserves_query() {
        let raw = b"GET /api/users?id=123 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            path: "/api/v2/accounts".into(),
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/v2/accounts?id=123 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn replace_whole_query() {
        let raw = b"GET /api/users?old=value HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            query: "new=param&foo=bar".into(),
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/users?new=param&foo=bar HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn add_query_to_bare_path() {
        let raw = b"GET /api/users HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            query: "id=123".into(),
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/users?id=123 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn set_query_upserts_in_place() {
        let raw = b"GET /api/users?id=123&role=user HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            set_query: vec!["role=admin".into()],
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/users?id=123&role=admin HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn remove_query_drops_named_param() {
        let raw = b"GET /api/users?id=123&secret=abc HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            remove_query: vec!["secret".into()],
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/users?id=123 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn combined_operations_canonical_order() {
        let raw = b"GET /old/path?a=1&b=2&c=3 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            path: "/new/path".into(),
            remove_query: vec!["b".into()],
            set_query: vec!["a=changed".into(), "d=4".into()],
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /new/path?a=changed&c=3&d=4 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn body_and_version_untouched() {
        let raw = b"POST /api/data HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\ntest";
        let opts = PathQueryOpts {
            path: "/api/v2/data".into(),
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "POST /api/v2/data HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\ntest"
        );

        let raw = b"GET /api/test HTTP/2\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            path: "/api/v2/test".into(),
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /api/v2/test HTTP/2\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn empty_query_value_survives() {
        let raw = b"GET /search?q= HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let opts = PathQueryOpts {
            set_query: vec!["page=2".into()],
            ..Default::default()
        };
        assert_eq!(
            run(raw, &opts),
            "GET /search?q=&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }
}
