//! Syntactic request validation ahead of dispatch.

use super::http::{header_value, parse_request_line, split_headers_body};
use sectap_protocol::ValidationIssue;

pub const SEVERITY_ERROR: &str = "error";
pub const SEVERITY_WARN: &str = "warn";

fn error(message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        severity: SEVERITY_ERROR.into(),
        message: message.into(),
    }
}

fn warn(message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        severity: SEVERITY_WARN.into(),
        message: message.into(),
    }
}

/// Validate a rewritten request. Issues are advisory; the caller decides
/// whether `error`-level ones abort the send.
pub fn validate_request(raw: &[u8]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let (head, body) = split_headers_body(raw);
    let head_text = String::from_utf8_lossy(head);

    let first_line = head_text
        .split('\n')
        .next()
        .unwrap_or_default()
        .trim_end_matches('\r');
    let (method, _, _, version) = parse_request_line(first_line);
    if method.is_empty() || !version.starts_with("HTTP/") {
        issues.push(error(format!("malformed request line: {first_line:?}")));
    }

    if version == "HTTP/1.1" && header_value(head, "host").is_none() {
        issues.push(error("missing Host header on HTTP/1.1 request"));
    }

    if let Some(declared) = header_value(head, "content-length") {
        match declared.parse::<usize>() {
            Ok(declared) if declared != body.len() => issues.push(error(format!(
                "Content-Length {declared} does not match body length {}",
                body.len()
            ))),
            Ok(_) => {}
            Err(_) => issues.push(error(format!("invalid Content-Length: {declared:?}"))),
        }
    }

    if has_bare_lf(head) {
        issues.push(warn("bare LF line endings; CRLF is authoritative for requests"));
    }

    for line in head_text.split("\r\n").skip(1) {
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            break;
        }
        if let Some((name, _)) = line.split_once(':') {
            if name.chars().any(|c| c.is_ascii_control()) {
                issues.push(error(format!("control character in header name: {name:?}")));
            }
        }
    }

    issues
}

fn has_bare_lf(head: &[u8]) -> bool {
    let mut prev = 0u8;
    for &byte in head {
        if byte == b'\n' && prev != b'\r' {
            return true;
        }
        prev = byte;
    }
    false
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|issue| issue.severity == SEVERITY_ERROR)
}

pub fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("[{}] {}", issue.severity, issue.message))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_request_has_no_issues() {
        let issues =
            validate_request(b"GET /api HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn malformed_start_line_is_an_error() {
        let issues = validate_request(b"garbage\r\n\r\n");
        assert!(has_errors(&issues));
        assert!(issues[0].message.contains("malformed request line"));
    }

    #[test]
    fn missing_host_on_http11_is_an_error() {
        let issues = validate_request(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n");
        assert!(issues
            .iter()
            .any(|i| i.severity == SEVERITY_ERROR && i.message.contains("Host")));

        // HTTP/1.0 has no Host requirement.
        let issues = validate_request(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!has_errors(&issues));
    }

    #[test]
    fn content_length_mismatch_is_an_error() {
        let issues = validate_request(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nabc",
        );
        assert!(issues
            .iter()
            .any(|i| i.severity == SEVERITY_ERROR && i.message.contains("Content-Length 10")));

        let issues = validate_request(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc",
        );
        assert!(!has_errors(&issues));
    }

    #[test]
    fn bare_lf_is_a_warning_only() {
        let issues = validate_request(b"GET / HTTP/1.1\nHost: x\n\n");
        assert!(!has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == SEVERITY_WARN && i.message.contains("bare LF")));
    }

    #[test]
    fn control_character_in_header_name_is_an_error() {
        let issues = validate_request(b"GET / HTTP/1.1\r\nHost: x\r\nBad\x01Name: v\r\n\r\n");
        assert!(issues
            .iter()
            .any(|i| i.severity == SEVERITY_ERROR && i.message.contains("control character")));
    }

    #[test]
    fn issue_formatting_is_line_per_issue() {
        let issues = vec![
            ValidationIssue {
                severity: "error".into(),
                message: "one".into(),
            },
            ValidationIssue {
                severity: "warn".into(),
                message: "two".into(),
            },
        ];
        assert_eq!(format_issues(&issues), "[error] one\n[warn] two");
    }
}
