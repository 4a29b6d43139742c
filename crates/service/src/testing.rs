//! In-memory backend doubles shared by the service and server tests.

use crate::backend::{
    HttpBackend, OastBackend, ProxyHistoryEntry, RuleInput, SendRequestInput, SendRequestResult,
};
use crate::error::{Result, ServiceError};
use crate::ids;
use crate::oast::{OastEventRecord, OastRegistry, OastSessionRecord, PollOutcome};
use crate::{Config, Service, ServicePaths};
use async_trait::async_trait;
use chrono::Utc;
use sectap_protocol::{BackendStatus, ProxyRule};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scripted HTTP backend: history is a plain vector (offset = index), sends
/// are recorded and answered from a configurable result.
#[derive(Default)]
pub struct FakeHttpBackend {
    pub entries: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    pub rules: Mutex<Vec<ProxyRule>>,
    pub sent: Mutex<Vec<(String, SendRequestInput)>>,
    pub send_result: Mutex<SendRequestResult>,
    pub send_error: Mutex<Option<ServiceError>>,
}

impl FakeHttpBackend {
    pub fn new() -> Self {
        FakeHttpBackend {
            send_result: Mutex::new(SendRequestResult {
                headers: b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec(),
                body: b"ok".to_vec(),
                duration: Duration::from_millis(42),
            }),
            ..Default::default()
        }
    }

    pub fn push_flow(&self, request: &[u8], response: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .push((request.to_vec(), response.to_vec()));
    }

    pub fn set_history(&self, flows: Vec<(Vec<u8>, Vec<u8>)>) {
        *self.entries.lock().unwrap() = flows;
    }

    fn page(&self, count: usize, offset: usize) -> Vec<ProxyHistoryEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .enumerate()
            .skip(offset)
            .take(count)
            .map(|(index, (request, response))| ProxyHistoryEntry {
                offset: index,
                request: request.clone(),
                response: response.clone(),
                https: true,
            })
            .collect()
    }
}

#[async_trait]
impl HttpBackend for FakeHttpBackend {
    async fn proxy_history(
        &self,
        _ctx: &CancellationToken,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>> {
        Ok(self.page(count, offset))
    }

    async fn proxy_history_regex(
        &self,
        _ctx: &CancellationToken,
        regex: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<ProxyHistoryEntry>> {
        let matcher = regex::Regex::new(regex)
            .map_err(|err| ServiceError::Backend(format!("bad regex: {err}")))?;
        Ok(self
            .page(count, offset)
            .into_iter()
            .filter(|entry| {
                matcher.is_match(&String::from_utf8_lossy(&entry.request))
                    || matcher.is_match(&String::from_utf8_lossy(&entry.response))
            })
            .collect())
    }

    async fn send_request(
        &self,
        _ctx: &CancellationToken,
        tag: &str,
        input: SendRequestInput,
    ) -> Result<SendRequestResult> {
        self.sent.lock().unwrap().push((tag.to_string(), input));
        if let Some(err) = self.send_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.send_result.lock().unwrap().clone())
    }

    async fn list_rules(&self, _ctx: &CancellationToken, websocket: bool) -> Result<Vec<ProxyRule>> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|rule| rule.websocket == websocket)
            .cloned()
            .collect())
    }

    async fn add_rule(
        &self,
        _ctx: &CancellationToken,
        websocket: bool,
        input: RuleInput,
    ) -> Result<ProxyRule> {
        let mut rules = self.rules.lock().unwrap();
        if !input.label.is_empty()
            && rules
                .iter()
                .any(|rule| rule.websocket == websocket && rule.label == input.label)
        {
            return Err(ServiceError::LabelExists(input.label));
        }
        let rule = ProxyRule {
            rule_id: ids::generate(ids::DEFAULT_LENGTH),
            label: input.label,
            rule_type: input.rule_type,
            is_regex: input.is_regex,
            match_pattern: input.match_pattern,
            replace: input.replace,
            websocket,
        };
        rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(
        &self,
        _ctx: &CancellationToken,
        rule_id: &str,
        input: RuleInput,
    ) -> Result<ProxyRule> {
        let mut rules = self.rules.lock().unwrap();
        let slot = rules
            .iter_mut()
            .find(|rule| rule.rule_id == rule_id || rule.label == rule_id)
            .ok_or_else(|| ServiceError::NotFound(format!("rule not found: {rule_id}")))?;
        slot.label = input.label;
        slot.rule_type = input.rule_type;
        slot.is_regex = input.is_regex;
        slot.match_pattern = input.match_pattern;
        slot.replace = input.replace;
        Ok(slot.clone())
    }

    async fn delete_rule(&self, _ctx: &CancellationToken, rule_id: &str) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|rule| rule.rule_id != rule_id && rule.label != rule_id);
        if rules.len() == before {
            return Err(ServiceError::NotFound(format!("rule not found: {rule_id}")));
        }
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            connected: true,
            detail: Some("fake".into()),
        }
    }

    async fn close(&self) {}
}

/// Registry-backed OAST double; tests inject events straight into the ring.
pub struct FakeOastBackend {
    pub registry: Arc<OastRegistry>,
    counter: Mutex<u32>,
}

impl FakeOastBackend {
    pub fn new(ring_capacity: usize) -> Self {
        FakeOastBackend {
            registry: Arc::new(OastRegistry::new(ring_capacity)),
            counter: Mutex::new(0),
        }
    }

    pub fn inject(&self, session: &str, event_id: &str, event_type: &str) {
        self.registry
            .push_event(
                session,
                OastEventRecord {
                    id: event_id.to_string(),
                    time: Utc::now(),
                    event_type: event_type.to_string(),
                    source_ip: "203.0.113.1".into(),
                    subdomain: format!("{event_id}.fake.oast.test"),
                    details: String::new(),
                },
            )
            .expect("session exists");
    }
}

#[async_trait]
impl OastBackend for FakeOastBackend {
    async fn create_session(
        &self,
        _ctx: &CancellationToken,
        label: &str,
    ) -> Result<OastSessionRecord> {
        if !label.is_empty()
            && self
                .registry
                .list()
                .iter()
                .any(|session| session.label == label)
        {
            return Err(ServiceError::LabelExists(label.to_string()));
        }
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let record = OastSessionRecord {
            id: format!("sess{:04}", *counter),
            label: label.to_string(),
            domain: format!("d{:04}.fake.oast.test", *counter),
            // Strictly increasing so list ordering is deterministic.
            created_at: Utc::now() + chrono::Duration::microseconds(i64::from(*counter)),
        };
        self.registry.insert(record.clone())?;
        Ok(record)
    }

    async fn poll_session(
        &self,
        ctx: &CancellationToken,
        id: &str,
        since: &str,
        wait: Duration,
        limit: usize,
    ) -> Result<PollOutcome> {
        self.registry.poll(ctx, id, since, wait, limit).await
    }

    async fn get_event(
        &self,
        _ctx: &CancellationToken,
        id: &str,
        event_id: &str,
    ) -> Result<OastEventRecord> {
        self.registry.get_event(id, event_id)
    }

    async fn list_sessions(&self, _ctx: &CancellationToken) -> Result<Vec<OastSessionRecord>> {
        Ok(self.registry.list())
    }

    async fn delete_session(&self, _ctx: &CancellationToken, id: &str) -> Result<()> {
        self.registry.remove(id)?;
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            connected: true,
            detail: Some("fake".into()),
        }
    }

    async fn close(&self) {}
}

/// A service wired to fresh fakes in a temp working directory.
pub fn make_service() -> (Arc<Service>, Arc<FakeHttpBackend>, Arc<FakeOastBackend>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = ServicePaths::new(tmp.path());
    paths.ensure_dirs().expect("state dirs");

    let http = Arc::new(FakeHttpBackend::new());
    let oast = Arc::new(FakeOastBackend::new(512));
    let service = Arc::new(Service::new(
        crate::VERSION,
        paths,
        Config::new(crate::VERSION),
        http.clone(),
        oast.clone(),
    ));
    (service, http, oast, tmp)
}
