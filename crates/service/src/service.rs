//! Operation implementations shared by the socket server and the MCP
//! gateway. Each method maps one API operation; handlers only translate
//! between transport and [`ServiceError`].

use crate::backend::{HttpBackend, OastBackend, ProxyHistoryEntry, RuleInput, SendRequestInput};
use crate::bundle::BundleStore;
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::ids;
use crate::oast::{OastEventRecord, OastSessionRecord};
use crate::paths::ServicePaths;
use crate::rewrite;
use crate::rewrite::http::{extract_request_meta, parse_response_status, preview_body};
use crate::rewrite::target::parse_target;
use crate::rewrite::validate::{has_errors, validate_request};
use crate::store::{content_hash, FlowRef, FlowStore, ReplayEntry, ReplayStore};
use crate::util::parse_duration;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use sectap_protocol as proto;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// UTF-8 preview cap for `replay.send` responses.
const RESPONSE_PREVIEW_SIZE: usize = 2048;

pub struct Service {
    pub version: String,
    pub paths: ServicePaths,
    pub config: Config,
    pub http_backend: Arc<dyn HttpBackend>,
    pub oast_backend: Arc<dyn OastBackend>,
    pub flows: FlowStore,
    pub replays: Arc<ReplayStore>,
    pub bundles: BundleStore,
    last_list_offset: Mutex<Option<usize>>,
    shutdown: Notify,
}

impl Service {
    pub fn new(
        version: &str,
        paths: ServicePaths,
        config: Config,
        http_backend: Arc<dyn HttpBackend>,
        oast_backend: Arc<dyn OastBackend>,
    ) -> Self {
        let bundles = BundleStore::new(&paths.bundle_root);
        Service {
            version: version.to_string(),
            paths,
            config,
            http_backend,
            oast_backend,
            flows: FlowStore::new(),
            replays: Arc::new(ReplayStore::new()),
            bundles,
            last_list_offset: Mutex::new(None),
            shutdown: Notify::new(),
        }
    }

    /// Signal the daemon to drain and exit; used by the `stop` operation.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }

    // -----------------------------------------------------------------
    // health / stop
    // -----------------------------------------------------------------

    pub async fn health(&self, ctx: &CancellationToken) -> Result<proto::HealthResponse> {
        if ctx.is_cancelled() {
            return Err(ServiceError::Canceled);
        }
        Ok(proto::HealthResponse {
            version: self.version.clone(),
            pid: std::process::id(),
            proxy_backend: self.http_backend.status().await,
            oast_backend: self.oast_backend.status().await,
        })
    }

    // -----------------------------------------------------------------
    // proxy history
    // -----------------------------------------------------------------

    pub async fn proxy_list(
        &self,
        ctx: &CancellationToken,
        req: proto::ProxyListRequest,
    ) -> Result<proto::ProxyListResponse> {
        let page = self.config.history_page_size;
        let entries = if req.contains.is_empty() {
            self.http_backend.proxy_history(ctx, page, 0).await?
        } else {
            // Remote prefilter; the precise URL/header match happens below.
            self.http_backend
                .proxy_history_regex(ctx, &regex::escape(&req.contains), page, 0)
                .await?
        };
        let total = entries.len();

        // Bind identities first so since=<flow_id> can resolve offsets.
        let mut flows = Vec::with_capacity(entries.len());
        let mut max_offset = None::<usize>;
        for entry in entries {
            let flow_id = self.flows.intern(entry.offset, &content_hash(&entry.request));
            max_offset = Some(max_offset.map_or(entry.offset, |m: usize| m.max(entry.offset)));
            flows.push((flow_id, entry));
        }

        let since_offset = self.since_offset(&req.since)?;
        {
            let mut last = self.last_list_offset.lock().expect("list offset poisoned");
            if max_offset.is_some() {
                *last = max_offset;
            }
        }

        if !req.has_filters() {
            return Ok(aggregate(total, &flows, req.limit));
        }

        let filter = ListFilter::new(&req)?;
        let mut out = Vec::new();
        for (flow_id, entry) in &flows {
            if let Some(min) = since_offset {
                if entry.offset <= min {
                    continue;
                }
            }
            if let Some(flow) = filter.apply(flow_id, entry) {
                out.push(flow);
            }
            if req.limit > 0 && out.len() >= req.limit {
                break;
            }
        }
        log::info!("proxy/list: returning {} of {total} flows", out.len());
        Ok(proto::ProxyListResponse {
            total,
            summary: Vec::new(),
            flows: out,
        })
    }

    fn since_offset(&self, since: &str) -> Result<Option<usize>> {
        match since {
            "" => Ok(None),
            "last" => Ok(*self.last_list_offset.lock().expect("list offset poisoned")),
            flow_id => self
                .flows
                .lookup(flow_id)
                .map(|flow| Some(flow.offset))
                .ok_or_else(|| ServiceError::NotFound(format!("flow not found: {flow_id}"))),
        }
    }

    /// Resolve a flow id to the live history entry, rebinding the cached
    /// offset through a bounded rescan when the remote history moved.
    pub async fn resolve_flow(
        &self,
        ctx: &CancellationToken,
        flow_id: &str,
    ) -> Result<(ProxyHistoryEntry, FlowRef)> {
        let flow = self.flows.lookup(flow_id).ok_or_else(|| {
            ServiceError::NotFound(format!(
                "flow not found: {flow_id} (run proxy list to see available flows)"
            ))
        })?;

        let fetched = self.http_backend.proxy_history(ctx, 1, flow.offset).await?;
        if let Some(entry) = fetched.into_iter().next() {
            if content_hash(&entry.request) == flow.hash {
                return Ok((entry, flow));
            }
        }

        let window = self.config.flow_rescan_window;
        let start = flow.offset.saturating_sub(window);
        let candidates = self
            .http_backend
            .proxy_history(ctx, window * 2 + 1, start)
            .await?;
        for entry in candidates {
            if content_hash(&entry.request) == flow.hash {
                log::info!(
                    "flow {flow_id}: rebound offset {} -> {}",
                    flow.offset,
                    entry.offset
                );
                self.flows.rebind(flow_id, entry.offset);
                let rebound = FlowRef {
                    offset: entry.offset,
                    hash: flow.hash.clone(),
                };
                return Ok((entry, rebound));
            }
        }
        Err(ServiceError::NotFound(format!(
            "flow {flow_id} no longer present in proxy history"
        )))
    }

    pub async fn proxy_export(
        &self,
        ctx: &CancellationToken,
        req: proto::ProxyExportRequest,
    ) -> Result<proto::ProxyExportResponse> {
        if req.flow_id.is_empty() {
            return Err(ServiceError::InvalidRequest("flow_id is required".into()));
        }
        let (entry, _) = self.resolve_flow(ctx, &req.flow_id).await?;

        let (method, host, path) = extract_request_meta(&String::from_utf8_lossy(&entry.request));
        let scheme = if entry.https { "https" } else { "http" };
        let url = format!("{scheme}://{host}{path}");

        let (bundle_id, dir) = self
            .bundles
            .write_request(&req.flow_id, &entry.request, &method, &url)?;
        log::info!("proxy/export: flow {} -> bundle {bundle_id}", req.flow_id);
        Ok(proto::ProxyExportResponse {
            bundle_id,
            path: dir.display().to_string(),
        })
    }

    // -----------------------------------------------------------------
    // proxy rules
    // -----------------------------------------------------------------

    pub async fn rule_list(
        &self,
        ctx: &CancellationToken,
        req: proto::RuleListRequest,
    ) -> Result<proto::RuleListResponse> {
        let mut rules = self.http_backend.list_rules(ctx, req.websocket).await?;
        if req.limit > 0 && rules.len() > req.limit {
            rules.truncate(req.limit);
        }
        Ok(proto::RuleListResponse { rules })
    }

    pub async fn rule_add(
        &self,
        ctx: &CancellationToken,
        req: proto::RuleAddRequest,
    ) -> Result<proto::ProxyRule> {
        validate_rule_type(&req.rule_type)?;
        if req.match_pattern.is_empty() && req.replace.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "match or replace is required".into(),
            ));
        }
        let rule = self
            .http_backend
            .add_rule(
                ctx,
                req.websocket,
                RuleInput {
                    label: req.label,
                    rule_type: req.rule_type,
                    is_regex: req.is_regex,
                    match_pattern: req.match_pattern,
                    replace: req.replace,
                },
            )
            .await?;
        log::info!("proxy/rule_add: created rule {}", rule.rule_id);
        Ok(rule)
    }

    pub async fn rule_update(
        &self,
        ctx: &CancellationToken,
        req: proto::RuleUpdateRequest,
    ) -> Result<proto::ProxyRule> {
        if req.rule_id.is_empty() {
            return Err(ServiceError::InvalidRequest("rule_id is required".into()));
        }
        validate_rule_type(&req.rule_type)?;
        if req.match_pattern.is_empty() && req.replace.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "match or replace is required".into(),
            ));
        }
        let rule = self
            .http_backend
            .update_rule(
                ctx,
                &req.rule_id,
                RuleInput {
                    label: req.label,
                    rule_type: req.rule_type,
                    is_regex: req.is_regex,
                    match_pattern: req.match_pattern,
                    replace: req.replace,
                },
            )
            .await?;
        log::info!("proxy/rule_update: updated rule {}", rule.rule_id);
        Ok(rule)
    }

    pub async fn rule_delete(
        &self,
        ctx: &CancellationToken,
        req: proto::RuleDeleteRequest,
    ) -> Result<proto::RuleDeleteResponse> {
        if req.rule_id.is_empty() {
            return Err(ServiceError::InvalidRequest("rule_id is required".into()));
        }
        self.http_backend.delete_rule(ctx, &req.rule_id).await?;
        log::info!("proxy/rule_delete: deleted rule {}", req.rule_id);
        Ok(proto::RuleDeleteResponse { deleted: true })
    }

    // -----------------------------------------------------------------
    // replay
    // -----------------------------------------------------------------

    pub async fn replay_send(
        &self,
        ctx: &CancellationToken,
        req: proto::ReplaySendRequest,
    ) -> Result<proto::ReplaySendResponse> {
        if req.flow_id.is_empty() {
            return Err(ServiceError::InvalidRequest("flow_id is required".into()));
        }
        let (entry, _) = self.resolve_flow(ctx, &req.flow_id).await?;

        let raw = rewrite::build_request(&entry.request, &req)?;

        if !req.force {
            let issues = validate_request(&raw);
            if has_errors(&issues) {
                return Err(ServiceError::Validation(issues));
            }
        }

        let target = parse_target(&raw, &req.target, entry.https)?;
        let timeout = if req.timeout.is_empty() {
            Duration::ZERO
        } else {
            parse_duration(&req.timeout)?
        };

        let replay_id = ids::generate(ids::DEFAULT_LENGTH);
        let scheme = if target.uses_https { "https" } else { "http" };
        log::info!(
            "replay/send: {replay_id} sending to {scheme}://{}:{} (flow={})",
            target.hostname,
            target.port,
            req.flow_id
        );

        let result = self
            .http_backend
            .send_request(
                ctx,
                &format!("sectap-{replay_id}"),
                SendRequestInput {
                    raw_request: raw,
                    target,
                    follow_redirects: req.follow_redirects,
                    timeout,
                },
            )
            .await?;

        let (status, status_line) = parse_response_status(&result.headers);
        log::info!(
            "replay/send: {replay_id} completed in {:?} (status={status}, size={})",
            result.duration,
            result.body.len()
        );

        self.replays.store(
            &replay_id,
            ReplayEntry::new(result.headers.clone(), result.body.clone(), result.duration),
        );

        if !req.export.is_empty() {
            self.bundles
                .write_response(&req.export, &result.headers, &result.body)?;
        }

        Ok(proto::ReplaySendResponse {
            replay_id,
            duration: format!("{:?}", result.duration),
            status,
            status_line,
            resp_headers: String::from_utf8_lossy(&result.headers).into_owned(),
            resp_size: result.body.len(),
            resp_preview: preview_body(&result.body, RESPONSE_PREVIEW_SIZE),
        })
    }

    pub async fn replay_get(
        &self,
        ctx: &CancellationToken,
        req: proto::ReplayGetRequest,
    ) -> Result<proto::ReplayGetResponse> {
        if ctx.is_cancelled() {
            return Err(ServiceError::Canceled);
        }
        if req.replay_id.is_empty() {
            return Err(ServiceError::InvalidRequest("replay_id is required".into()));
        }
        let entry = self.replays.get(&req.replay_id).ok_or_else(|| {
            ServiceError::NotFound(
                "replay not found: replay results are ephemeral and cleared on service restart"
                    .into(),
            )
        })?;

        let (status, status_line) = parse_response_status(&entry.headers);
        Ok(proto::ReplayGetResponse {
            replay_id: req.replay_id,
            duration: format!("{:?}", entry.duration),
            status,
            status_line,
            resp_headers: String::from_utf8_lossy(&entry.headers).into_owned(),
            resp_body: BASE64.encode(&entry.body),
            resp_size: entry.body.len(),
        })
    }

    // -----------------------------------------------------------------
    // OAST
    // -----------------------------------------------------------------

    pub async fn oast_create(
        &self,
        ctx: &CancellationToken,
        req: proto::OastCreateRequest,
    ) -> Result<proto::OastCreateResponse> {
        log::info!("oast/create: creating new session (label={:?})", req.label);
        let session = self.oast_backend.create_session(ctx, &req.label).await?;
        log::info!(
            "oast/create: created session {} with domain {}",
            session.id,
            session.domain
        );
        Ok(proto::OastCreateResponse {
            oast_id: session.id,
            domain: session.domain,
            label: session.label,
        })
    }

    pub async fn oast_poll(
        &self,
        ctx: &CancellationToken,
        req: proto::OastPollRequest,
    ) -> Result<proto::OastPollResponse> {
        if req.oast_id.is_empty() {
            return Err(ServiceError::InvalidRequest("oast_id is required".into()));
        }
        let wait = if req.wait.is_empty() {
            Duration::ZERO
        } else {
            parse_duration(&req.wait)?
        };

        let outcome = self
            .oast_backend
            .poll_session(ctx, &req.oast_id, &req.since, wait, req.limit)
            .await?;
        log::info!(
            "oast/poll: session {} returned {} events",
            req.oast_id,
            outcome.events.len()
        );
        Ok(proto::OastPollResponse {
            events: outcome.events.iter().map(to_api_event).collect(),
            dropped_count: outcome.dropped_count,
        })
    }

    pub async fn oast_get(
        &self,
        ctx: &CancellationToken,
        req: proto::OastGetRequest,
    ) -> Result<proto::OastEvent> {
        if req.oast_id.is_empty() {
            return Err(ServiceError::InvalidRequest("oast_id is required".into()));
        }
        if req.event_id.is_empty() {
            return Err(ServiceError::InvalidRequest("event_id is required".into()));
        }
        let event = self
            .oast_backend
            .get_event(ctx, &req.oast_id, &req.event_id)
            .await?;
        Ok(to_api_event(&event))
    }

    pub async fn oast_list(
        &self,
        ctx: &CancellationToken,
        req: proto::OastListRequest,
    ) -> Result<proto::OastListResponse> {
        let mut sessions = self.oast_backend.list_sessions(ctx).await?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if req.limit > 0 && sessions.len() > req.limit {
            sessions.truncate(req.limit);
        }
        log::info!("oast/list: returning {} active sessions", sessions.len());
        Ok(proto::OastListResponse {
            sessions: sessions.iter().map(to_api_session).collect(),
        })
    }

    pub async fn oast_delete(
        &self,
        ctx: &CancellationToken,
        req: proto::OastDeleteRequest,
    ) -> Result<proto::OastDeleteResponse> {
        if req.oast_id.is_empty() {
            return Err(ServiceError::InvalidRequest("oast_id is required".into()));
        }
        log::info!("oast/delete: deleting session {}", req.oast_id);
        self.oast_backend.delete_session(ctx, &req.oast_id).await?;
        Ok(proto::OastDeleteResponse { deleted: true })
    }

    // -----------------------------------------------------------------
    // encoding helpers
    // -----------------------------------------------------------------

    pub fn encode_url(&self, req: proto::EncodeRequest) -> Result<proto::EncodeResponse> {
        require_input(&req)?;
        let output = if req.decode {
            crate::encode::url_decode(&req.input)?
        } else {
            crate::encode::url_encode(&req.input)
        };
        Ok(proto::EncodeResponse { output })
    }

    pub fn encode_base64(&self, req: proto::EncodeRequest) -> Result<proto::EncodeResponse> {
        require_input(&req)?;
        let output = if req.decode {
            crate::encode::base64_decode(&req.input)?
        } else {
            crate::encode::base64_encode(&req.input)
        };
        Ok(proto::EncodeResponse { output })
    }

    pub fn encode_html(&self, req: proto::EncodeRequest) -> Result<proto::EncodeResponse> {
        require_input(&req)?;
        let output = if req.decode {
            crate::encode::html_decode(&req.input)
        } else {
            crate::encode::html_encode(&req.input)
        };
        Ok(proto::EncodeResponse { output })
    }
}

fn require_input(req: &proto::EncodeRequest) -> Result<()> {
    if req.input.is_empty() {
        return Err(ServiceError::InvalidRequest("input is required".into()));
    }
    Ok(())
}

fn validate_rule_type(rule_type: &str) -> Result<()> {
    if proto::RULE_TYPES.contains(&rule_type) {
        return Ok(());
    }
    Err(ServiceError::InvalidRequest(format!(
        "invalid rule type {rule_type:?}; expected one of {}",
        proto::RULE_TYPES.join(", ")
    )))
}

fn to_api_event(event: &OastEventRecord) -> proto::OastEvent {
    proto::OastEvent {
        event_id: event.id.clone(),
        time: event.time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        event_type: event.event_type.clone(),
        source_ip: event.source_ip.clone(),
        subdomain: event.subdomain.clone(),
        details: event.details.clone(),
    }
}

fn to_api_session(session: &OastSessionRecord) -> proto::OastSessionInfo {
    proto::OastSessionInfo {
        oast_id: session.id.clone(),
        domain: session.domain.clone(),
        label: session.label.clone(),
        created_at: session
            .created_at
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }
}

// ---------------------------------------------------------------------
// proxy.list filtering and aggregation
// ---------------------------------------------------------------------

struct ListFilter {
    host: Option<Regex>,
    path: Option<Regex>,
    exclude_host: Option<Regex>,
    exclude_path: Option<Regex>,
    methods: Vec<String>,
    statuses: Vec<u16>,
    contains: String,
    contains_body: String,
}

impl ListFilter {
    fn new(req: &proto::ProxyListRequest) -> Result<Self> {
        Ok(ListFilter {
            host: glob_regex(&req.host, true)?,
            path: glob_regex(&req.path, false)?,
            exclude_host: glob_regex(&req.exclude_host, true)?,
            exclude_path: glob_regex(&req.exclude_path, false)?,
            methods: split_list(&req.method),
            statuses: split_list(&req.status)
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            contains: req.contains.clone(),
            contains_body: req.contains_body.clone(),
        })
    }

    fn apply(&self, flow_id: &str, entry: &ProxyHistoryEntry) -> Option<proto::FlowEntry> {
        let request_text = String::from_utf8_lossy(&entry.request);
        let (method, host, path) = extract_request_meta(&request_text);
        let status = parse_response_status(&entry.response).0;

        if let Some(regex) = &self.host {
            if !regex.is_match(&host) {
                return None;
            }
        }
        if let Some(regex) = &self.exclude_host {
            if regex.is_match(&host) {
                return None;
            }
        }
        if let Some(regex) = &self.path {
            if !regex.is_match(&path) {
                return None;
            }
        }
        if let Some(regex) = &self.exclude_path {
            if regex.is_match(&path) {
                return None;
            }
        }
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(&method))
        {
            return None;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&status) {
            return None;
        }

        if !self.contains.is_empty() {
            // URL and header text only; bodies are covered by contains_body.
            let (req_head, _) = crate::rewrite::http::split_headers_body(&entry.request);
            let (resp_head, _) = crate::rewrite::http::split_headers_body(&entry.response);
            let url = format!("{host}{path}");
            let haystacks = [
                url,
                String::from_utf8_lossy(req_head).into_owned(),
                String::from_utf8_lossy(resp_head).into_owned(),
            ];
            if !haystacks.iter().any(|text| text.contains(&self.contains)) {
                return None;
            }
        }

        if !self.contains_body.is_empty() {
            let (_, req_body) = crate::rewrite::http::split_headers_body(&entry.request);
            let (_, resp_body) = crate::rewrite::http::split_headers_body(&entry.response);
            let needle = self.contains_body.as_bytes();
            let found = contains_bytes(req_body, needle) || contains_bytes(resp_body, needle);
            if !found {
                return None;
            }
        }

        Some(proto::FlowEntry {
            flow_id: flow_id.to_string(),
            method,
            host,
            path,
            status,
            request_size: entry.request.len(),
            response_size: entry.response.len(),
        })
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Translate a `*`/`?` glob into an anchored regex.
fn glob_regex(pattern: &str, case_insensitive: bool) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let mut out = String::from("^");
    if case_insensitive {
        out.insert_str(0, "(?i)");
    }
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
        .map(Some)
        .map_err(|err| ServiceError::InvalidRequest(format!("invalid glob {pattern:?}: {err}")))
}

fn aggregate(
    total: usize,
    flows: &[(String, ProxyHistoryEntry)],
    limit: usize,
) -> proto::ProxyListResponse {
    let mut counts: HashMap<(String, String, String, u16), usize> = HashMap::new();
    for (_, entry) in flows {
        let request_text = String::from_utf8_lossy(&entry.request);
        let (method, host, path) = extract_request_meta(&request_text);
        let path = path.split('?').next().unwrap_or_default().to_string();
        let status = parse_response_status(&entry.response).0;
        *counts.entry((host, path, method, status)).or_insert(0) += 1;
    }

    let mut summary: Vec<proto::FlowSummaryRow> = counts
        .into_iter()
        .map(|((host, path, method, status), count)| proto::FlowSummaryRow {
            host,
            path,
            method,
            status,
            count,
        })
        .collect();
    summary.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.path.cmp(&b.path))
    });
    if limit > 0 && summary.len() > limit {
        summary.truncate(limit);
    }

    proto::ProxyListResponse {
        total,
        summary,
        flows: Vec::new(),
    }
}
