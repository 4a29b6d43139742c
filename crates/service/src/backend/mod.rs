//! Backend ports: the only contracts the daemon core depends on.
//!
//! One production adapter exists per capability ([`burp::BurpBackend`] for
//! the intercepting proxy, [`interact::InteractBackend`] for OAST); tests
//! substitute in-memory doubles.

pub mod burp;
pub mod interact;

use crate::error::Result;
use crate::oast::{OastEventRecord, OastSessionRecord, PollOutcome};
use async_trait::async_trait;
use sectap_protocol::{BackendStatus, ProxyRule};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One recorded request/response pair from the proxy history.
#[derive(Debug, Clone)]
pub struct ProxyHistoryEntry {
    /// Absolute offset in the remote history at fetch time.
    pub offset: usize,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    /// Whether the origin flow travelled over TLS.
    pub https: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub hostname: String,
    pub port: u16,
    pub uses_https: bool,
}

#[derive(Debug, Clone)]
pub struct SendRequestInput {
    pub raw_request: Vec<u8>,
    pub target: Target,
    pub follow_redirects: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SendRequestResult {
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuleInput {
    pub label: String,
    pub rule_type: String,
    pub is_regex: bool,
    pub match_pattern: String,
    pub replace: String,
}

/// Intercepting-proxy capability.
///
/// Every operation takes the request's cancellation handle; adapters race
/// their outbound I/O against it so an abandoned request aborts in flight.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn proxy_history(
        &self,
        ctx: &CancellationToken,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>>;

    /// History filtered remotely by a regex over request and response text.
    async fn proxy_history_regex(
        &self,
        ctx: &CancellationToken,
        regex: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>>;

    /// Send raw request bytes to the target; `tag` labels the request in
    /// the remote proxy's own history.
    async fn send_request(
        &self,
        ctx: &CancellationToken,
        tag: &str,
        input: SendRequestInput,
    ) -> Result<SendRequestResult>;

    async fn list_rules(&self, ctx: &CancellationToken, websocket: bool) -> Result<Vec<ProxyRule>>;
    async fn add_rule(
        &self,
        ctx: &CancellationToken,
        websocket: bool,
        input: RuleInput,
    ) -> Result<ProxyRule>;
    /// `rule_id` accepts either the id or a label.
    async fn update_rule(
        &self,
        ctx: &CancellationToken,
        rule_id: &str,
        input: RuleInput,
    ) -> Result<ProxyRule>;
    async fn delete_rule(&self, ctx: &CancellationToken, rule_id: &str) -> Result<()>;

    async fn status(&self) -> BackendStatus;
    async fn close(&self);
}

/// Out-of-band interaction capability.
#[async_trait]
pub trait OastBackend: Send + Sync {
    async fn create_session(
        &self,
        ctx: &CancellationToken,
        label: &str,
    ) -> Result<OastSessionRecord>;
    async fn poll_session(
        &self,
        ctx: &CancellationToken,
        id: &str,
        since: &str,
        wait: Duration,
        limit: usize,
    ) -> Result<PollOutcome>;
    async fn get_event(
        &self,
        ctx: &CancellationToken,
        id: &str,
        event_id: &str,
    ) -> Result<OastEventRecord>;
    async fn list_sessions(&self, ctx: &CancellationToken) -> Result<Vec<OastSessionRecord>>;
    async fn delete_session(&self, ctx: &CancellationToken, id: &str) -> Result<()>;

    async fn status(&self) -> BackendStatus;
    async fn close(&self);
}
