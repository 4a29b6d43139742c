//! Burp Suite adapter.
//!
//! Talks to the Burp MCP SSE endpoint as an MCP client. History entries and
//! send results cross the boundary as JSON with base64 byte payloads. The
//! match/replace rule set is mirrored locally (ids, labels, uniqueness) and
//! pushed to the proxy wholesale on every mutation, which is what
//! serializes externally observable rule operations.

use crate::backend::{
    HttpBackend, ProxyHistoryEntry, RuleInput, SendRequestInput, SendRequestResult,
};
use crate::error::{Result, ServiceError};
use crate::ids;
use crate::util::with_cancel;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::RunningService;
use rmcp::transport::SseClientTransport;
use rmcp::{RoleClient, ServiceExt};
use sectap_protocol::{BackendStatus, ProxyRule};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const TOOL_PROXY_HISTORY: &str = "get_proxy_history";
const TOOL_PROXY_HISTORY_REGEX: &str = "get_proxy_history_regex";
const TOOL_SEND_REQUEST: &str = "send_http1_request";
const TOOL_SET_RULES: &str = "set_match_replace_rules";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BurpBackend {
    url: String,
    client: AsyncMutex<Option<RunningService<RoleClient, ()>>>,
    rules: AsyncMutex<RuleMirror>,
    last_error: std::sync::Mutex<Option<String>>,
}

impl BurpBackend {
    pub fn new(url: &str) -> Self {
        BurpBackend {
            url: url.to_string(),
            client: AsyncMutex::new(None),
            rules: AsyncMutex::new(RuleMirror::default()),
            last_error: std::sync::Mutex::new(None),
        }
    }

    /// Lazily connect and hand back a cloned peer so no connection lock is
    /// held across the actual tool call.
    async fn peer(&self) -> Result<rmcp::service::Peer<RoleClient>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let transport = SseClientTransport::start(self.url.clone())
                .await
                .map_err(|err| {
                    ServiceError::Backend(format!(
                        "connect to proxy MCP endpoint {}: {err}",
                        self.url
                    ))
                })?;
            let client = ().serve(transport).await.map_err(|err| {
                ServiceError::Backend(format!("proxy MCP handshake failed: {err}"))
            })?;
            log::info!("connected to proxy MCP endpoint at {}", self.url);
            *guard = Some(client);
        }
        Ok(guard.as_ref().expect("connection established").peer().clone())
    }

    async fn drop_connection(&self) {
        self.client.lock().await.take();
    }

    fn record_error(&self, err: &ServiceError) {
        *self.last_error.lock().expect("status lock poisoned") = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.lock().expect("status lock poisoned") = None;
    }

    async fn call(
        &self,
        ctx: &CancellationToken,
        tool: &'static str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        // Connection setup and the tool call both race the request
        // context; a disconnected client aborts the outbound call here.
        let outbound = async {
            let peer = self.peer().await?;
            let outcome = tokio::time::timeout(
                timeout,
                peer.call_tool(CallToolRequestParam {
                    name: tool.into(),
                    arguments: args.as_object().cloned(),
                }),
            )
            .await;
            match outcome {
                Err(_) => Err(ServiceError::Timeout(format!(
                    "proxy backend call {tool} timed out"
                ))),
                Ok(Err(err)) => {
                    // A transport fault poisons the session; reconnect
                    // next call.
                    self.drop_connection().await;
                    Err(ServiceError::Backend(format!(
                        "proxy backend call {tool} failed: {err}"
                    )))
                }
                Ok(Ok(result)) => Ok(result),
            }
        };

        let result = match with_cancel(ctx, outbound).await {
            Ok(result) => result,
            Err(err) => {
                if !err.is_canceled() {
                    self.record_error(&err);
                }
                return Err(err);
            }
        };

        let text = tool_text(&result);
        if result.is_error.unwrap_or(false) {
            let err = ServiceError::Backend(format!("proxy backend {tool}: {text}"));
            self.record_error(&err);
            return Err(err);
        }

        self.clear_error();
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| {
            ServiceError::Backend(format!("proxy backend {tool} returned invalid JSON: {err}"))
        })
    }

    async fn push_rules(
        &self,
        ctx: &CancellationToken,
        websocket: bool,
        rules: &[ProxyRule],
    ) -> Result<()> {
        self.call(
            ctx,
            TOOL_SET_RULES,
            json!({
                "websocket": websocket,
                "rules": rules,
            }),
            DEFAULT_CALL_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}

fn tool_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| content.as_text())
        .map(|text| text.text.clone())
        .collect::<Vec<_>>()
        .join("")
}

/// The remote may report the absolute offset per entry; positional
/// fallback assumes the page starts at `base_offset`.
fn parse_history(value: &Value, base_offset: usize) -> Result<Vec<ProxyHistoryEntry>> {
    let items = value
        .as_array()
        .ok_or_else(|| ServiceError::Backend("proxy history is not an array".into()))?;

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let request = decode_b64_field(item, "request")?;
        let response = decode_b64_field(item, "response")?;
        let https = item.get("https").and_then(Value::as_bool).unwrap_or(true);
        let offset = item
            .get("offset")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(base_offset + index);
        entries.push(ProxyHistoryEntry {
            offset,
            request,
            response,
            https,
        });
    }
    Ok(entries)
}

fn decode_b64_field(item: &Value, field: &str) -> Result<Vec<u8>> {
    let Some(text) = item.get(field).and_then(Value::as_str) else {
        return Ok(Vec::new());
    };
    BASE64
        .decode(text)
        .map_err(|err| ServiceError::Backend(format!("proxy history field {field}: {err}")))
}

#[async_trait]
impl HttpBackend for BurpBackend {
    async fn proxy_history(
        &self,
        ctx: &CancellationToken,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>> {
        let value = self
            .call(
                ctx,
                TOOL_PROXY_HISTORY,
                json!({"count": count, "offset": offset}),
                DEFAULT_CALL_TIMEOUT,
            )
            .await?;
        parse_history(&value, offset)
    }

    async fn proxy_history_regex(
        &self,
        ctx: &CancellationToken,
        regex: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>> {
        let value = self
            .call(
                ctx,
                TOOL_PROXY_HISTORY_REGEX,
                json!({"regex": regex, "count": count, "offset": offset}),
                DEFAULT_CALL_TIMEOUT,
            )
            .await?;
        parse_history(&value, offset)
    }

    async fn send_request(
        &self,
        ctx: &CancellationToken,
        tag: &str,
        input: SendRequestInput,
    ) -> Result<SendRequestResult> {
        let timeout = if input.timeout.is_zero() {
            DEFAULT_CALL_TIMEOUT
        } else {
            input.timeout
        };

        let started = Instant::now();
        let value = self
            .call(
                ctx,
                TOOL_SEND_REQUEST,
                json!({
                    "tag": tag,
                    "content": BASE64.encode(&input.raw_request),
                    "target_hostname": input.target.hostname,
                    "target_port": input.target.port,
                    "uses_https": input.target.uses_https,
                    "follow_redirects": input.follow_redirects,
                    "timeout_ms": timeout.as_millis() as u64,
                }),
                // Leave headroom for the remote's own timeout to fire first.
                timeout + Duration::from_secs(5),
            )
            .await?;

        let headers = decode_b64_field(&value, "headers")?;
        let body = decode_b64_field(&value, "body")?;
        let duration = value
            .get("elapsed_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or_else(|| started.elapsed());
        Ok(SendRequestResult {
            headers,
            body,
            duration,
        })
    }

    async fn list_rules(&self, _ctx: &CancellationToken, websocket: bool) -> Result<Vec<ProxyRule>> {
        Ok(self.rules.lock().await.list(websocket))
    }

    async fn add_rule(
        &self,
        ctx: &CancellationToken,
        websocket: bool,
        input: RuleInput,
    ) -> Result<ProxyRule> {
        let mut mirror = self.rules.lock().await;
        let rule = mirror.add(websocket, input)?;
        if let Err(err) = self.push_rules(ctx, websocket, &mirror.list(websocket)).await {
            mirror.delete(&rule.rule_id).ok();
            return Err(err);
        }
        Ok(rule)
    }

    async fn update_rule(
        &self,
        ctx: &CancellationToken,
        rule_id: &str,
        input: RuleInput,
    ) -> Result<ProxyRule> {
        let mut mirror = self.rules.lock().await;
        let previous = mirror.find(rule_id)?;
        let rule = mirror.update(rule_id, input)?;
        if let Err(err) = self
            .push_rules(ctx, rule.websocket, &mirror.list(rule.websocket))
            .await
        {
            mirror.restore(previous);
            return Err(err);
        }
        Ok(rule)
    }

    async fn delete_rule(&self, ctx: &CancellationToken, rule_id: &str) -> Result<()> {
        let mut mirror = self.rules.lock().await;
        let removed = mirror.delete(rule_id)?;
        if let Err(err) = self
            .push_rules(ctx, removed.websocket, &mirror.list(removed.websocket))
            .await
        {
            mirror.restore(removed);
            return Err(err);
        }
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        let connected = self.client.lock().await.is_some();
        let detail = self
            .last_error
            .lock()
            .expect("status lock poisoned")
            .clone()
            .or_else(|| Some(self.url.clone()));
        BackendStatus { connected, detail }
    }

    async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.cancel().await;
        }
    }
}

/// Local authority for rule ids and labels. Burp itself only sees the full
/// rule set, so identity lives here.
#[derive(Default)]
struct RuleMirror {
    http: Vec<ProxyRule>,
    websocket: Vec<ProxyRule>,
}

impl RuleMirror {
    fn class(&mut self, websocket: bool) -> &mut Vec<ProxyRule> {
        if websocket {
            &mut self.websocket
        } else {
            &mut self.http
        }
    }

    fn list(&self, websocket: bool) -> Vec<ProxyRule> {
        if websocket {
            self.websocket.clone()
        } else {
            self.http.clone()
        }
    }

    fn check_label(&self, websocket: bool, label: &str, exclude_id: &str) -> Result<()> {
        if label.is_empty() {
            return Ok(());
        }
        let rules = if websocket { &self.websocket } else { &self.http };
        if rules
            .iter()
            .any(|rule| rule.label == label && rule.rule_id != exclude_id)
        {
            return Err(ServiceError::LabelExists(label.to_string()));
        }
        Ok(())
    }

    fn add(&mut self, websocket: bool, input: RuleInput) -> Result<ProxyRule> {
        self.check_label(websocket, &input.label, "")?;
        let rule = ProxyRule {
            rule_id: ids::generate(ids::DEFAULT_LENGTH),
            label: input.label,
            rule_type: input.rule_type,
            is_regex: input.is_regex,
            match_pattern: input.match_pattern,
            replace: input.replace,
            websocket,
        };
        self.class(websocket).push(rule.clone());
        Ok(rule)
    }

    /// Find by rule id or label across both websocket classes.
    fn find(&self, key: &str) -> Result<ProxyRule> {
        self.http
            .iter()
            .chain(self.websocket.iter())
            .find(|rule| rule.rule_id == key || (!key.is_empty() && rule.label == key))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("rule not found: {key}")))
    }

    fn update(&mut self, key: &str, input: RuleInput) -> Result<ProxyRule> {
        let existing = self.find(key)?;
        self.check_label(existing.websocket, &input.label, &existing.rule_id)?;

        let updated = ProxyRule {
            rule_id: existing.rule_id.clone(),
            label: input.label,
            rule_type: input.rule_type,
            is_regex: input.is_regex,
            match_pattern: input.match_pattern,
            replace: input.replace,
            websocket: existing.websocket,
        };
        let rules = self.class(existing.websocket);
        let slot = rules
            .iter_mut()
            .find(|rule| rule.rule_id == existing.rule_id)
            .expect("rule present");
        *slot = updated.clone();
        Ok(updated)
    }

    fn delete(&mut self, key: &str) -> Result<ProxyRule> {
        let existing = self.find(key)?;
        let rules = self.class(existing.websocket);
        rules.retain(|rule| rule.rule_id != existing.rule_id);
        Ok(existing)
    }

    /// Put a rule back after a failed push so the mirror matches the proxy.
    fn restore(&mut self, rule: ProxyRule) {
        let websocket = rule.websocket;
        let rules = self.class(websocket);
        rules.retain(|r| r.rule_id != rule.rule_id);
        rules.push(rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(label: &str) -> RuleInput {
        RuleInput {
            label: label.into(),
            rule_type: "request_header".into(),
            is_regex: false,
            match_pattern: "X-Old: 1".into(),
            replace: "X-New: 1".into(),
        }
    }

    #[test]
    fn add_assigns_unique_ids_and_tracks_class() {
        let mut mirror = RuleMirror::default();
        let a = mirror.add(false, input("a")).unwrap();
        let b = mirror.add(true, input("b")).unwrap();
        assert_ne!(a.rule_id, b.rule_id);
        assert_eq!(mirror.list(false).len(), 1);
        assert_eq!(mirror.list(true).len(), 1);
        assert!(b.websocket);
    }

    #[test]
    fn label_unique_within_websocket_class_only() {
        let mut mirror = RuleMirror::default();
        mirror.add(false, input("dup")).unwrap();

        let err = mirror.add(false, input("dup")).unwrap_err();
        assert!(matches!(err, ServiceError::LabelExists(_)));

        // Same label in the other class is allowed.
        mirror.add(true, input("dup")).unwrap();

        // Unlabelled rules never conflict.
        mirror.add(false, input("")).unwrap();
        mirror.add(false, input("")).unwrap();
    }

    #[test]
    fn find_accepts_id_or_label() {
        let mut mirror = RuleMirror::default();
        let rule = mirror.add(false, input("login-header")).unwrap();

        assert_eq!(mirror.find(&rule.rule_id).unwrap().rule_id, rule.rule_id);
        assert_eq!(mirror.find("login-header").unwrap().rule_id, rule.rule_id);
        assert!(mirror.find("missing").is_err());
    }

    #[test]
    fn update_keeps_id_and_class() {
        let mut mirror = RuleMirror::default();
        let rule = mirror.add(true, input("ws-rule")).unwrap();

        let mut new_input = input("ws-rule");
        new_input.replace = "X-Changed: 1".into();
        let updated = mirror.update("ws-rule", new_input).unwrap();
        assert_eq!(updated.rule_id, rule.rule_id);
        assert!(updated.websocket);
        assert_eq!(updated.replace, "X-Changed: 1");
        assert_eq!(mirror.list(true).len(), 1);
    }

    #[test]
    fn update_rejects_label_stolen_from_sibling() {
        let mut mirror = RuleMirror::default();
        mirror.add(false, input("first")).unwrap();
        let second = mirror.add(false, input("second")).unwrap();

        let err = mirror.update(&second.rule_id, input("first")).unwrap_err();
        assert!(matches!(err, ServiceError::LabelExists(_)));

        // Keeping its own label is fine.
        mirror.update(&second.rule_id, input("second")).unwrap();
    }

    #[test]
    fn delete_then_find_fails() {
        let mut mirror = RuleMirror::default();
        let rule = mirror.add(false, input("gone")).unwrap();
        mirror.delete(&rule.rule_id).unwrap();
        assert!(mirror.find(&rule.rule_id).is_err());
        assert!(mirror.delete(&rule.rule_id).is_err());
    }

    #[test]
    fn history_payload_parses_base64_entries() {
        let value = json!([
            {"request": BASE64.encode(b"GET / HTTP/1.1\r\n\r\n"), "response": BASE64.encode(b"HTTP/1.1 200 OK\r\n\r\n"), "https": false, "offset": 17},
            {"request": BASE64.encode(b"POST / HTTP/1.1\r\n\r\n")},
        ]);
        let entries = parse_history(&value, 5).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].request, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(entries[0].offset, 17, "explicit offset wins");
        assert!(!entries[0].https);
        assert_eq!(entries[1].offset, 6, "positional fallback");
        assert!(entries[1].response.is_empty());
        assert!(entries[1].https, "https defaults to true");

        assert!(parse_history(&json!({"not": "array"}), 0).is_err());
        assert!(parse_history(&json!([{"request": "!!!"}]), 0).is_err());
    }
}
