//! Wire types for the sectap daemon API.
//!
//! Every daemon operation is a POST over the local socket whose body is one
//! of the request documents below; every response is the uniform
//! [`Envelope`]. The MCP gateway reuses the same request types as tool
//! inputs, which is why they carry `schemars::JsonSchema` derives.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Routes served over the local socket. Clients must treat these as the
/// complete operation surface.
pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const STOP: &str = "/stop";
    pub const PROXY_LIST: &str = "/proxy/list";
    pub const PROXY_EXPORT: &str = "/proxy/export";
    pub const PROXY_RULE_LIST: &str = "/proxy/rule/list";
    pub const PROXY_RULE_ADD: &str = "/proxy/rule/add";
    pub const PROXY_RULE_UPDATE: &str = "/proxy/rule/update";
    pub const PROXY_RULE_DELETE: &str = "/proxy/rule/delete";
    pub const REPLAY_SEND: &str = "/replay/send";
    pub const REPLAY_GET: &str = "/replay/get";
    pub const OAST_CREATE: &str = "/oast/create";
    pub const OAST_POLL: &str = "/oast/poll";
    pub const OAST_GET: &str = "/oast/get";
    pub const OAST_LIST: &str = "/oast/list";
    pub const OAST_DELETE: &str = "/oast/delete";
    pub const ENCODE_URL: &str = "/encode/url";
    pub const ENCODE_BASE64: &str = "/encode/base64";
    pub const ENCODE_HTML: &str = "/encode/html";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ServiceUnavailable,
    BackendError,
    InvalidRequest,
    NotFound,
    InternalError,
    Timeout,
    ValidationError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The uniform `{ok, data?, error?}` response document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Envelope {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ApiError) -> Self {
        Envelope {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Health / stop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackendStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    pub version: String,
    pub pid: u32,
    pub proxy_backend: BackendStatus,
    pub oast_backend: BackendStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StopResponse {
    pub stopping: bool,
}

// ---------------------------------------------------------------------------
// Proxy history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProxyListRequest {
    /// Host filter, glob pattern (`*.example.com`).
    pub host: String,
    /// Path filter, glob pattern (`/api/*`).
    pub path: String,
    /// Comma-separated HTTP methods (`GET,POST`).
    pub method: String,
    /// Comma-separated status codes (`200,302`).
    pub status: String,
    /// Substring match against URL or request/response headers.
    pub contains: String,
    /// Substring match against request or response body.
    pub contains_body: String,
    /// Flow id to list entries after, or `last` for entries since the
    /// previous query.
    pub since: String,
    /// Glob of hosts to exclude.
    pub exclude_host: String,
    /// Glob of paths to exclude.
    pub exclude_path: String,
    /// Maximum number of results.
    pub limit: usize,
}

impl ProxyListRequest {
    /// Filters select individual flows; without any the daemon aggregates.
    pub fn has_filters(&self) -> bool {
        !(self.host.is_empty()
            && self.path.is_empty()
            && self.method.is_empty()
            && self.status.is_empty()
            && self.contains.is_empty()
            && self.contains_body.is_empty()
            && self.since.is_empty()
            && self.exclude_host.is_empty()
            && self.exclude_path.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowEntry {
    pub flow_id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub request_size: usize,
    pub response_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowSummaryRow {
    pub host: String,
    pub path: String,
    pub method: String,
    pub status: u16,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProxyListResponse {
    /// Total history entries examined.
    pub total: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub summary: Vec<FlowSummaryRow>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub flows: Vec<FlowEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProxyExportRequest {
    pub flow_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProxyExportResponse {
    pub bundle_id: String,
    pub path: String,
}

// ---------------------------------------------------------------------------
// Proxy rules
// ---------------------------------------------------------------------------

pub const RULE_TYPES: [&str; 4] = [
    "request_header",
    "request_body",
    "response_header",
    "response_body",
];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProxyRule {
    pub rule_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub label: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub is_regex: bool,
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub replace: String,
    pub websocket: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuleAddRequest {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub replace: String,
    pub label: String,
    pub is_regex: bool,
    pub websocket: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuleUpdateRequest {
    pub rule_id: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub replace: String,
    pub label: String,
    pub is_regex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuleListRequest {
    pub websocket: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleListResponse {
    pub rules: Vec<ProxyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleDeleteRequest {
    pub rule_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuleDeleteResponse {
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReplaySendRequest {
    /// Flow id from `proxy.list` used as the base request.
    pub flow_id: String,
    /// Literal body override.
    pub body: String,
    /// Target URL override (`https://other.example.com`).
    pub target: String,
    /// Headers to add or replace, `Name: Value` form.
    pub add_headers: Vec<String>,
    /// Header names to remove (case-insensitive).
    pub remove_headers: Vec<String>,
    /// Request path override.
    pub path: String,
    /// Entire query string override.
    pub query: String,
    /// Query params to upsert, `name=value` form.
    pub set_query: Vec<String>,
    /// Query param names to drop.
    pub remove_query: Vec<String>,
    /// JSON fields to set, `path=value` form with dot/bracket paths.
    pub set_json: Vec<String>,
    /// JSON paths to remove; applied before `set_json`.
    pub remove_json: Vec<String>,
    pub follow_redirects: bool,
    /// Request timeout, e.g. `30s` or `1m`.
    pub timeout: String,
    /// Skip request validation.
    pub force: bool,
    /// Bundle id from `proxy.export`; the response artifacts are written
    /// into that bundle.
    pub export: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidationIssue {
    pub severity: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplaySendResponse {
    pub replay_id: String,
    pub duration: String,
    pub status: u16,
    pub status_line: String,
    pub resp_headers: String,
    pub resp_size: usize,
    pub resp_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplayGetRequest {
    pub replay_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplayGetResponse {
    pub replay_id: String,
    pub duration: String,
    pub status: u16,
    pub status_line: String,
    pub resp_headers: String,
    /// Base64-encoded response body.
    pub resp_body: String,
    pub resp_size: usize,
}

// ---------------------------------------------------------------------------
// OAST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OastCreateRequest {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastCreateResponse {
    pub oast_id: String,
    pub domain: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OastPollRequest {
    /// Session id, label, or domain.
    pub oast_id: String,
    /// `last`, an event id, or empty for all buffered events.
    pub since: String,
    /// Long-poll duration, e.g. `30s`; capped at 120s.
    pub wait: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastEvent {
    pub event_id: String,
    /// RFC3339 UTC.
    pub time: String,
    /// Interaction protocol: `dns`, `http`, `smtp`, ...
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_ip: String,
    pub subdomain: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastPollResponse {
    pub events: Vec<OastEvent>,
    pub dropped_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastGetRequest {
    pub oast_id: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OastListRequest {
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastSessionInfo {
    pub oast_id: String,
    pub domain: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub label: String,
    /// RFC3339 UTC.
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastListResponse {
    pub sessions: Vec<OastSessionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OastDeleteRequest {
    pub oast_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct OastDeleteResponse {
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EncodeRequest {
    pub input: String,
    pub decode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EncodeResponse {
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        for code in [
            ErrorCode::ServiceUnavailable,
            ErrorCode::BackendError,
            ErrorCode::InvalidRequest,
            ErrorCode::NotFound,
            ErrorCode::InternalError,
            ErrorCode::Timeout,
            ErrorCode::ValidationError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let ok = Envelope::success(StopResponse { stopping: true });
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"ok\":true"));
        assert!(!json.contains("error"));

        let err: Envelope<StopResponse> = Envelope::failure(ApiError {
            code: ErrorCode::NotFound,
            message: "missing".into(),
            details: None,
        });
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"ok\":false"));
        assert!(!json.contains("data"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn proxy_list_request_filter_detection() {
        assert!(!ProxyListRequest::default().has_filters());

        let req = ProxyListRequest {
            host: "*.example.com".into(),
            ..Default::default()
        };
        assert!(req.has_filters());

        // limit alone keeps the aggregated view
        let req = ProxyListRequest {
            limit: 10,
            ..Default::default()
        };
        assert!(!req.has_filters());
    }

    #[test]
    fn unknown_request_fields_are_ignored() {
        let req: OastPollRequest =
            serde_json::from_str(r#"{"oast_id":"abc","wait":"30s","future_field":true}"#).unwrap();
        assert_eq!(req.oast_id, "abc");
        assert_eq!(req.wait, "30s");
        assert_eq!(req.limit, 0);
    }
}
