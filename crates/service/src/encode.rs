//! Deterministic text-encoding helpers exposed as `encode.*` operations.

use crate::error::ServiceError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

// Query-component escaping: keep the unreserved marks, escape the rest;
// space becomes '+'.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b' ');

pub fn url_encode(input: &str) -> String {
    utf8_percent_encode(input, QUERY_ESCAPE)
        .to_string()
        .replace(' ', "+")
}

pub fn url_decode(input: &str) -> Result<String, ServiceError> {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|err| ServiceError::InvalidRequest(format!("URL decode error: {err}")))
}

pub fn base64_encode(input: &str) -> String {
    BASE64.encode(input.as_bytes())
}

pub fn base64_decode(input: &str) -> Result<String, ServiceError> {
    let bytes = BASE64
        .decode(input.trim())
        .map_err(|err| ServiceError::InvalidRequest(format!("base64 decode error: {err}")))?;
    String::from_utf8(bytes)
        .map_err(|err| ServiceError::InvalidRequest(format!("base64 decode error: {err}")))
}

pub fn html_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

pub fn html_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match rest.find(';') {
            Some(end) if end > 1 => {
                let entity = &rest[1..end];
                match decode_entity(entity) {
                    Some(c) => {
                        out.push(c);
                        rest = &rest[end + 1..];
                    }
                    None => {
                        out.push('&');
                        rest = &rest[1..];
                    }
                }
            }
            _ => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => return Some('&'),
        "lt" => return Some('<'),
        "gt" => return Some('>'),
        "quot" => return Some('"'),
        "apos" => return Some('\''),
        _ => {}
    }

    let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else if let Some(dec) = entity.strip_prefix('#') {
        dec.parse().ok()?
    } else {
        return None;
    };
    char::from_u32(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let input = "a b&c=1/π";
        let encoded = url_encode(input);
        assert_eq!(encoded, "a+b%26c%3D1%2F%CF%80");
        assert_eq!(url_decode(&encoded).unwrap(), input);
    }

    #[test]
    fn url_decode_rejects_bad_utf8() {
        assert!(url_decode("%ff%fe").is_err());
    }

    #[test]
    fn base64_round_trip() {
        assert_eq!(base64_encode("hello"), "aGVsbG8=");
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), "hello");
        assert!(base64_decode("not base64!!").is_err());
    }

    #[test]
    fn html_escapes_the_usual_suspects() {
        assert_eq!(
            html_encode(r#"<a href="x">&'"#),
            "&lt;a href=&#34;x&#34;&gt;&amp;&#39;"
        );
    }

    #[test]
    fn html_decode_handles_named_and_numeric() {
        assert_eq!(html_decode("&lt;b&gt;&amp;&#39;&#x41;"), "<b>&'A");
        // Unknown entities and stray ampersands pass through.
        assert_eq!(html_decode("&nope; & rest"), "&nope; & rest");
    }
}
