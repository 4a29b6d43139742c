//! Header-block edits: add/remove and Content-Length reconciliation.

/// Split a head block (start line + headers + blank-line separator) into
/// its lines, losing the separator. Non-UTF-8 heads come back as `None`
/// and the caller leaves the bytes alone.
fn head_lines(head: &[u8]) -> Option<(Vec<String>, &'static str)> {
    let text = std::str::from_utf8(head).ok()?;
    let (text, sep) = if let Some(stripped) = text.strip_suffix("\r\n\r\n") {
        (stripped, "\r\n")
    } else if let Some(stripped) = text.strip_suffix("\n\n") {
        (stripped, "\n")
    } else {
        (text.trim_end_matches(['\r', '\n']), "\r\n")
    };
    Some((text.split(sep).map(str::to_string).collect(), sep))
}

fn reassemble(lines: Vec<String>, sep: &str) -> Vec<u8> {
    let mut out = lines.join(sep);
    out.push_str(sep);
    out.push_str(sep);
    out.into_bytes()
}

fn header_name(line: &str) -> Option<&str> {
    line.split_once(':').map(|(name, _)| name.trim())
}

/// Remove then add headers. Added headers are `Name: Value` strings and
/// replace any existing header with the same name (case-insensitive).
pub fn apply_header_edits(head: &[u8], add: &[String], remove: &[String]) -> Vec<u8> {
    if add.is_empty() && remove.is_empty() {
        return head.to_vec();
    }
    let Some((mut lines, sep)) = head_lines(head) else {
        return head.to_vec();
    };
    if lines.is_empty() {
        return head.to_vec();
    }

    for name in remove {
        let name = name.trim();
        lines = retain_start_line(lines, |line| {
            !header_name(line).is_some_and(|n| n.eq_ignore_ascii_case(name))
        });
    }

    for entry in add {
        if let Some(name) = header_name(entry) {
            lines = retain_start_line(lines, |line| {
                !header_name(line).is_some_and(|n| n.eq_ignore_ascii_case(name))
            });
        }
        lines.push(entry.trim_end().to_string());
    }

    reassemble(lines, sep)
}

/// Recompute Content-Length from the final body. An existing header is
/// replaced; one is only added when the body is non-empty.
pub fn update_content_length(head: &[u8], body_len: usize) -> Vec<u8> {
    let Some((mut lines, sep)) = head_lines(head) else {
        return head.to_vec();
    };
    if lines.is_empty() {
        return head.to_vec();
    }

    let replacement = format!("Content-Length: {body_len}");
    let mut found = false;
    for line in lines.iter_mut().skip(1) {
        if header_name(line).is_some_and(|n| n.eq_ignore_ascii_case("content-length")) {
            *line = replacement.clone();
            found = true;
        }
    }
    if !found && body_len > 0 {
        lines.push(replacement);
    }

    reassemble(lines, sep)
}

// The start line never matches header edits.
fn retain_start_line<F: Fn(&str) -> bool>(lines: Vec<String>, keep: F) -> Vec<String> {
    let mut iter = lines.into_iter();
    let mut out = Vec::new();
    if let Some(start) = iter.next() {
        out.push(start);
    }
    out.extend(iter.filter(|line| keep(line)));
    out
}
