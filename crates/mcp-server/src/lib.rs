//! MCP tool gateway for the sectap daemon.
//!
//! Re-exposes the daemon operations as typed tool calls over an SSE
//! transport bound to localhost. There is no logic here beyond shape
//! translation: every tool calls the same [`Service`] methods the local
//! socket handlers use. The gateway carries no authentication of its own
//! and must stay loopback-only.

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo,
};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use sectap_protocol as proto;
use sectap_service::Service;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MCP_PORT: u16 = 9119;

#[derive(Clone)]
pub struct SecTapTools {
    service: Arc<Service>,
    /// Cancelled when the gateway shuts down; aborts in-flight tool calls
    /// and their backend work.
    cancel: CancellationToken,
    tool_router: ToolRouter<Self>,
}

impl SecTapTools {
    pub fn new(service: Arc<Service>, cancel: CancellationToken) -> Self {
        SecTapTools {
            service,
            cancel,
            tool_router: Self::tool_router(),
        }
    }
}

fn json_result<T: Serialize>(data: &T) -> Result<CallToolResult, McpError> {
    match serde_json::to_string_pretty(data) {
        Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Err(err) => Ok(error_result(format!("failed to marshal response: {err}"))),
    }
}

fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

fn map<T: Serialize>(result: sectap_service::Result<T>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(data) => json_result(&data),
        Err(err) => Ok(error_result(err.to_string())),
    }
}

#[tool_router]
impl SecTapTools {
    #[tool(
        description = "Query HTTP proxy history captured by the intercepting proxy. Without filters, returns an aggregated summary grouped by (host, path, method, status). With filters, returns individual flow entries with a flow_id for replay and export. Host/path filters support glob patterns (* and ?)."
    )]
    pub async fn proxy_list(
        &self,
        Parameters(request): Parameters<proto::ProxyListRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.proxy_list(&self.cancel, request).await)
    }

    #[tool(
        description = "Export a flow to an on-disk bundle (request.http, body.bin, request.meta.json) under the state root. The bundle persists until removed by the operator."
    )]
    pub async fn proxy_export(
        &self,
        Parameters(request): Parameters<proto::ProxyExportRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.proxy_export(&self.cancel, request).await)
    }

    #[tool(
        description = "List proxy match and replace rules. Use websocket=true for the WebSocket rule class."
    )]
    pub async fn proxy_rule_list(
        &self,
        Parameters(request): Parameters<proto::RuleListRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.rule_list(&self.cancel, request).await)
    }

    #[tool(
        description = "Add a proxy match and replace rule. Types: request_header, request_body, response_header, response_body. For header additions only 'replace' is needed; for replacements both 'match' and 'replace'."
    )]
    pub async fn proxy_rule_add(
        &self,
        Parameters(request): Parameters<proto::RuleAddRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.rule_add(&self.cancel, request).await)
    }

    #[tool(
        description = "Update an existing proxy match and replace rule. rule_id accepts either the id or a label; both HTTP and WebSocket rules are searched."
    )]
    pub async fn proxy_rule_update(
        &self,
        Parameters(request): Parameters<proto::RuleUpdateRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.rule_update(&self.cancel, request).await)
    }

    #[tool(
        description = "Delete a proxy match and replace rule by id or label. Both HTTP and WebSocket rules are searched."
    )]
    pub async fn proxy_rule_delete(
        &self,
        Parameters(request): Parameters<proto::RuleDeleteRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.rule_delete(&self.cancel, request).await)
    }

    #[tool(
        description = "Send or replay an HTTP request with optional modifications. Start from a flow_id, then edit path/query (set_query, remove_query), headers (add_headers, remove_headers), and the body (literal body, or set_json/remove_json with dot/bracket paths). Content-Length is reconciled automatically; validation errors block the send unless force=true."
    )]
    pub async fn replay_send(
        &self,
        Parameters(request): Parameters<proto::ReplaySendRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.replay_send(&self.cancel, request).await)
    }

    #[tool(
        description = "Retrieve the full response of a previous replay_send, including the base64-encoded body. Replay results are ephemeral and cleared when the daemon restarts."
    )]
    pub async fn replay_get(
        &self,
        Parameters(request): Parameters<proto::ReplayGetRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.replay_get(&self.cancel, request).await)
    }

    #[tool(
        description = "Create an OAST (out-of-band application security testing) session. Returns a unique domain for detecting blind vulnerabilities via DNS/HTTP/SMTP callbacks."
    )]
    pub async fn oast_create(
        &self,
        Parameters(request): Parameters<proto::OastCreateRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.oast_create(&self.cancel, request).await)
    }

    #[tool(
        description = "Poll an OAST session for interaction events. since='last' returns events newer than the internal cursor; since=<event_id> returns events after that event; empty since returns everything buffered. A positive wait long-polls up to 120s."
    )]
    pub async fn oast_poll(
        &self,
        Parameters(request): Parameters<proto::OastPollRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.oast_poll(&self.cancel, request).await)
    }

    #[tool(description = "Get full details of one OAST event without truncation.")]
    pub async fn oast_get(
        &self,
        Parameters(request): Parameters<proto::OastGetRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.oast_get(&self.cancel, request).await)
    }

    #[tool(description = "List active OAST sessions, newest first.")]
    pub async fn oast_list(
        &self,
        Parameters(request): Parameters<proto::OastListRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.oast_list(&self.cancel, request).await)
    }

    #[tool(description = "Delete an OAST session and stop monitoring its domain.")]
    pub async fn oast_delete(
        &self,
        Parameters(request): Parameters<proto::OastDeleteRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.oast_delete(&self.cancel, request).await)
    }

    #[tool(description = "URL encode or decode a string.")]
    pub async fn encode_url(
        &self,
        Parameters(request): Parameters<proto::EncodeRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.encode_url(request))
    }

    #[tool(description = "Base64 encode or decode a string.")]
    pub async fn encode_base64(
        &self,
        Parameters(request): Parameters<proto::EncodeRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.encode_base64(request))
    }

    #[tool(description = "HTML entity encode or decode a string.")]
    pub async fn encode_html(
        &self,
        Parameters(request): Parameters<proto::EncodeRequest>,
    ) -> Result<CallToolResult, McpError> {
        map(self.service.encode_html(request))
    }
}

#[tool_handler]
impl ServerHandler for SecTapTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "sectap shares a security-testing session between an agent and a human operator. \
                 Use proxy_list to find recorded flows, replay_send to re-issue edited requests, \
                 proxy_rule_* to rewrite traffic in transit, and oast_* to detect out-of-band \
                 callbacks from blind vulnerabilities."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

/// Serve the gateway on `127.0.0.1:<port>`. Cancel the returned token to
/// shut it down; in-flight tool calls are aborted with it.
pub async fn serve_sse(service: Arc<Service>, port: u16) -> anyhow::Result<CancellationToken> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let sse = rmcp::transport::sse_server::SseServer::serve(addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind MCP SSE server on {addr}: {err}"))?;
    log::info!("MCP SSE gateway listening on http://{addr}/sse");

    let root = CancellationToken::new();
    let tool_cancel = root.clone();
    let server_token = sse.with_service(move || SecTapTools::new(service.clone(), tool_cancel.child_token()));

    // One token controls both the transport and the tool calls it spawned.
    let linked = root.clone();
    tokio::spawn(async move {
        linked.cancelled().await;
        server_token.cancel();
    });
    Ok(root)
}
