//! JSON body edits with dot/bracket paths.
//!
//! `remove_json` paths apply before `set_json`. Set values follow fixed
//! typing rules: `null`/`true`/`false` are literals, numerics are parsed,
//! `{`/`[`-prefixed values are parsed as JSON, anything else is a string.

use crate::error::{Result, ServiceError};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Err(ServiceError::InvalidRequest("empty JSON path".into()));
    }

    let mut segments = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').ok_or_else(|| {
                ServiceError::InvalidRequest(format!("unterminated index in JSON path: {path}"))
            })?;
            let index: usize = after[..end].parse().map_err(|_| {
                ServiceError::InvalidRequest(format!("invalid index in JSON path: {path}"))
            })?;
            segments.push(Segment::Index(index));
            rest = after[end + 1..].strip_prefix('.').unwrap_or(&after[end + 1..]);
        } else {
            let end = rest
                .find(['.', '['])
                .unwrap_or(rest.len());
            if end == 0 {
                return Err(ServiceError::InvalidRequest(format!(
                    "invalid JSON path: {path}"
                )));
            }
            segments.push(Segment::Key(rest[..end].to_string()));
            rest = rest[end..].strip_prefix('.').unwrap_or(&rest[end..]);
        }
    }
    Ok(segments)
}

fn typed_value(raw: &str) -> Result<Value> {
    match raw {
        "null" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if raw.starts_with('{') || raw.starts_with('[') {
        return serde_json::from_str(raw).map_err(|err| {
            ServiceError::InvalidRequest(format!("invalid JSON literal {raw:?}: {err}"))
        });
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(Value::from(int));
    }
    if let Ok(float) = raw.parse::<f64>() {
        if float.is_finite() {
            return Ok(Value::from(float));
        }
    }
    Ok(Value::String(raw.to_string()))
}

fn set_path(root: &mut Value, segments: &[Segment], value: Value, path: &str) -> Result<()> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            Segment::Key(key) => {
                if !current.is_object() {
                    if current.is_null() {
                        *current = Value::Object(Default::default());
                    } else {
                        return Err(ServiceError::InvalidRequest(format!(
                            "JSON path {path} traverses a non-object"
                        )));
                    }
                }
                let map = current.as_object_mut().expect("object checked above");
                if last {
                    map.insert(key.clone(), value);
                    return Ok(());
                }
                current = map.entry(key.clone()).or_insert(Value::Null);
            }
            Segment::Index(index) => {
                let arr = current.as_array_mut().ok_or_else(|| {
                    ServiceError::InvalidRequest(format!("JSON path {path} indexes a non-array"))
                })?;
                if *index >= arr.len() {
                    return Err(ServiceError::InvalidRequest(format!(
                        "JSON path {path} index {index} out of bounds"
                    )));
                }
                if last {
                    arr[*index] = value;
                    return Ok(());
                }
                current = &mut arr[*index];
            }
        }
    }
    unreachable!("segments is never empty")
}

// Removal of a missing path is a no-op so remove lists are idempotent.
fn remove_path(root: &mut Value, segments: &[Segment]) {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            Segment::Key(key) => {
                let Some(map) = current.as_object_mut() else {
                    return;
                };
                if last {
                    map.remove(key);
                    return;
                }
                match map.get_mut(key) {
                    Some(next) => current = next,
                    None => return,
                }
            }
            Segment::Index(index) => {
                let Some(arr) = current.as_array_mut() else {
                    return;
                };
                if *index >= arr.len() {
                    return;
                }
                if last {
                    arr.remove(*index);
                    return;
                }
                current = &mut arr[*index];
            }
        }
    }
}

/// Apply `remove` paths, then `set` edits of the form `path=value`.
pub fn modify_json_body(body: &[u8], set: &[String], remove: &[String]) -> Result<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(body)
        .map_err(|err| ServiceError::InvalidRequest(format!("request body is not JSON: {err}")))?;

    for path in remove {
        let segments = parse_path(path)?;
        remove_path(&mut root, &segments);
    }

    for edit in set {
        let (path, raw_value) = edit.split_once('=').ok_or_else(|| {
            ServiceError::InvalidRequest(format!("set_json entry {edit:?} is not path=value"))
        })?;
        let segments = parse_path(path)?;
        let value = typed_value(raw_value)?;
        set_path(&mut root, &segments, value, path)?;
    }

    serde_json::to_vec(&root).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(body: &str, set: &[&str], remove: &[&str]) -> String {
        let set: Vec<String> = set.iter().map(|s| s.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|s| s.to_string()).collect();
        String::from_utf8(modify_json_body(body.as_bytes(), &set, &remove).unwrap()).unwrap()
    }

    #[test]
    fn set_and_remove_top_level() {
        assert_eq!(edit(r#"{"a":1,"b":2}"#, &["a=3"], &["b"]), r#"{"a":3}"#);
    }

    #[test]
    fn nested_and_indexed_paths() {
        assert_eq!(
            edit(r#"{"user":{"email":"a@b"},"items":[{"id":1},{"id":2}]}"#,
                &["user.email=x@y", "items[1].id=9"],
                &[],
            ),
            r#"{"items":[{"id":1},{"id":9}],"user":{"email":"x@y"}}"#
        );
    }

    #[test]
    fn value_typing_rules() {
        assert_eq!(edit(r#"{}"#, &["a=null"], &[]), r#"{"a":null}"#);
        assert_eq!(edit(r#"{}"#, &["a=true"], &[]), r#"{"a":true}"#);
        assert_eq!(edit(r#"{}"#, &["a=42"], &[]), r#"{"a":42}"#);
        assert_eq!(edit(r#"{}"#, &["a=4.5"], &[]), r#"{"a":4.5}"#);
        assert_eq!(edit(r#"{}"#, &["a=hello"], &[]), r#"{"a":"hello"}"#);
        assert_eq!(edit(r#"{}"#, &[r#"a={"x":1}"#], &[]), r#"{"a":{"x":1}}"#);
        assert_eq!(edit(r#"{}"#, &["a=[1,2]"], &[]), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn remove_applies_before_set() {
        // Removing then re-setting the same key keeps the new value.
        assert_eq!(edit(r#"{"a":1}"#, &["a=2"], &["a"]), r#"{"a":2}"#);
    }

    #[test]
    fn missing_remove_path_is_noop() {
        assert_eq!(edit(r#"{"a":1}"#, &[], &["b", "c.d", "a.x"]), r#"{"a":1}"#);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        assert_eq!(
            edit(r#"{}"#, &["user.profile.name=alice"], &[]),
            r#"{"user":{"profile":{"name":"alice"}}}"#
        );
    }

    #[test]
    fn array_index_out_of_bounds_errors() {
        let err = modify_json_body(br#"{"items":[1]}"#, &["items[5]=2".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn non_json_body_errors() {
        let err = modify_json_body(b"plain text", &["a=1".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn malformed_brace_literal_errors() {
        let err = modify_json_body(b"{}", &["a={broken".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn array_element_removal() {
        assert_eq!(edit(r#"{"items":[1,2,3]}"#, &[], &["items[1]"]), r#"{"items":[1,3]}"#);
    }
}
