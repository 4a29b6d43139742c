//! HTTP-request rewrite pipeline.
//!
//! Stages run in a fixed order: request-line edits, header edits, body
//! edits, Content-Length reconciliation, version normalization. Validation
//! and target resolution sit alongside; the orchestration lives in
//! [`crate::service`].

pub mod headers;
pub mod http;
pub mod json_edit;
pub mod request_line;
pub mod target;
pub mod validate;

use crate::error::Result;
use sectap_protocol::ReplaySendRequest;

/// Apply every requested edit to the raw base request and return the bytes
/// ready for validation and transit.
pub fn build_request(raw: &[u8], req: &ReplaySendRequest) -> Result<Vec<u8>> {
    let raw = request_line::modify_request_line(
        raw,
        &request_line::PathQueryOpts {
            path: req.path.clone(),
            query: req.query.clone(),
            set_query: req.set_query.clone(),
            remove_query: req.remove_query.clone(),
        },
    );

    let (head, body) = http::split_headers_body(&raw);
    let head = headers::apply_header_edits(head, &req.add_headers, &req.remove_headers);

    let mut body = body.to_vec();
    if !req.body.is_empty() {
        body = req.body.clone().into_bytes();
    }
    if !req.set_json.is_empty() || !req.remove_json.is_empty() {
        body = json_edit::modify_json_body(&body, &req.set_json, &req.remove_json)?;
    }

    let head = headers::update_content_length(&head, body.len());

    let mut out = head;
    out.extend_from_slice(&body);
    Ok(http::normalize_request_version(&out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_req() -> ReplaySendRequest {
        ReplaySendRequest::default()
    }

    #[test]
    fn no_edits_is_identity_modulo_version() {
        let raw = b"GET /api/users?id=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let out = build_request(raw, &send_req()).unwrap();
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn json_edit_reconciles_content_length() {
        let raw = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 13\r\n\r\n{\"a\":1,\"b\":2}";
        let req = ReplaySendRequest {
            set_json: vec!["a=3".into()],
            remove_json: vec!["b".into()],
            ..send_req()
        };
        let out = build_request(raw, &req).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("{\"a\":3}"), "{text}");
        assert!(text.contains("Content-Length: 7\r\n"), "{text}");
    }

    #[test]
    fn body_override_wins_and_updates_length() {
        let raw = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nabcd";
        let req = ReplaySendRequest {
            body: "xy".into(),
            ..send_req()
        };
        let out = build_request(raw, &req).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("\r\n\r\nxy"));
        assert!(text.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn http2_start_line_is_normalized() {
        let raw = b"GET /x HTTP/2\r\nHost: example.com\r\n\r\n";
        let req = ReplaySendRequest {
            add_headers: vec!["X-Probe: 1".into()],
            ..send_req()
        };
        let out = build_request(raw, &req).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(text.contains("X-Probe: 1\r\n"));
    }

    #[test]
    fn combined_edits_apply_in_order() {
        let raw =
            b"POST /old?a=1&b=2 HTTP/1.1\r\nHost: example.com\r\nX-Drop: yes\r\nContent-Length: 2\r\n\r\n{}";
        let req = ReplaySendRequest {
            path: "/new".into(),
            remove_query: vec!["b".into()],
            set_query: vec!["c=3".into()],
            add_headers: vec!["X-Add: 1".into()],
            remove_headers: vec!["x-drop".into()],
            set_json: vec!["user.name=alice".into()],
            ..send_req()
        };
        let out = build_request(raw, &req).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /new?a=1&c=3 HTTP/1.1\r\n"));
        assert!(!text.to_lowercase().contains("x-drop"));
        assert!(text.contains("X-Add: 1\r\n"));
        assert!(text.ends_with("{\"user\":{\"name\":\"alice\"}}"));
    }
}
