//! OAST provider adapter.
//!
//! Owns the in-process session registry and keeps it fed from an
//! interactsh-style HTTP API: `POST /register` issues a domain and poll
//! key, `GET /poll` reports interactions, `POST /deregister` releases the
//! domain. One background poller per session pushes provider events into
//! the registry ring, which is where all poll/cursor semantics live.

use crate::backend::OastBackend;
use crate::error::{Result, ServiceError};
use crate::ids;
use crate::oast::{OastEventRecord, OastRegistry, OastSessionRecord, PollOutcome};
use crate::util::with_cancel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sectap_protocol::BackendStatus;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    domain: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    events: Vec<ProviderEvent>,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    source_ip: String,
    #[serde(default)]
    subdomain: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

pub struct InteractBackend {
    server_url: String,
    http: reqwest::Client,
    registry: Arc<OastRegistry>,
    poll_interval: Duration,
    pollers: AsyncMutex<HashMap<String, JoinHandle<()>>>,
    last_error: std::sync::Mutex<Option<String>>,
    ever_connected: std::sync::atomic::AtomicBool,
}

impl InteractBackend {
    pub fn new(server_url: &str, ring_capacity: usize) -> Self {
        Self::with_poll_interval(server_url, ring_capacity, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        server_url: &str,
        ring_capacity: usize,
        poll_interval: Duration,
    ) -> Self {
        InteractBackend {
            server_url: server_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            registry: Arc::new(OastRegistry::new(ring_capacity)),
            poll_interval,
            pollers: AsyncMutex::new(HashMap::new()),
            last_error: std::sync::Mutex::new(None),
            ever_connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn classify(&self, context: &str, err: reqwest::Error) -> ServiceError {
        let mapped = if err.is_timeout() {
            ServiceError::Timeout(format!("{context} timed out: {err}"))
        } else {
            ServiceError::Backend(format!("{context} failed: {err}"))
        };
        *self.last_error.lock().expect("status lock poisoned") = Some(mapped.to_string());
        mapped
    }

    fn mark_ok(&self) {
        self.ever_connected
            .store(true, std::sync::atomic::Ordering::Relaxed);
        *self.last_error.lock().expect("status lock poisoned") = None;
    }

    async fn register_domain(&self, label: &str) -> Result<RegisterResponse> {
        let response = self
            .http
            .post(format!("{}/register", self.server_url))
            .json(&json!({"label": label}))
            .timeout(REGISTER_TIMEOUT)
            .send()
            .await
            .map_err(|err| self.classify("OAST register", err))?;
        if !response.status().is_success() {
            let err = ServiceError::Backend(format!(
                "OAST register failed: server returned {}",
                response.status()
            ));
            *self.last_error.lock().expect("status lock poisoned") = Some(err.to_string());
            return Err(err);
        }
        let parsed = response
            .json::<RegisterResponse>()
            .await
            .map_err(|err| self.classify("OAST register", err))?;
        self.mark_ok();
        Ok(parsed)
    }

    async fn deregister_domain(&self, domain: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/deregister", self.server_url))
            .json(&json!({"domain": domain}))
            .timeout(REGISTER_TIMEOUT)
            .send()
            .await
            .map_err(|err| self.classify("OAST deregister", err))?;
        if !response.status().is_success() {
            return Err(ServiceError::Backend(format!(
                "OAST deregister failed: server returned {}",
                response.status()
            )));
        }
        self.mark_ok();
        Ok(())
    }

    fn spawn_poller(&self, session_id: String, domain: String, key: String) -> JoinHandle<()> {
        let http = self.http.clone();
        let registry = Arc::clone(&self.registry);
        let url = format!("{}/poll", self.server_url);
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let response = http
                    .get(&url)
                    .query(&[("domain", domain.as_str()), ("key", key.as_str())])
                    .timeout(REGISTER_TIMEOUT)
                    .send()
                    .await;

                let parsed = match response {
                    Ok(resp) => resp.json::<PollResponse>().await,
                    Err(err) => {
                        log::debug!("oast poller {session_id}: poll failed: {err}");
                        continue;
                    }
                };
                let parsed = match parsed {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        log::debug!("oast poller {session_id}: bad poll payload: {err}");
                        continue;
                    }
                };

                for event in parsed.events {
                    let record = OastEventRecord {
                        id: format!("evt_{}", ids::generate(ids::DEFAULT_LENGTH)),
                        time: event.time.unwrap_or_else(Utc::now),
                        event_type: event.event_type,
                        source_ip: event.source_ip,
                        subdomain: event.subdomain,
                        details: event.details,
                    };
                    if registry.push_event(&session_id, record).is_err() {
                        // Session deleted under us; the poller is done.
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl OastBackend for InteractBackend {
    async fn create_session(
        &self,
        ctx: &CancellationToken,
        label: &str,
    ) -> Result<OastSessionRecord> {
        // Check the label before touching the provider so a collision does
        // not leak a registered domain.
        if !label.is_empty()
            && self
                .registry
                .list()
                .iter()
                .any(|session| session.label == label)
        {
            return Err(ServiceError::LabelExists(label.to_string()));
        }

        let registered = with_cancel(ctx, self.register_domain(label)).await?;
        let record = OastSessionRecord {
            id: ids::generate(ids::DEFAULT_LENGTH),
            label: label.to_string(),
            domain: registered.domain.clone(),
            created_at: Utc::now(),
        };

        if let Err(err) = self.registry.insert(record.clone()) {
            let _ = self.deregister_domain(&registered.domain).await;
            return Err(err);
        }

        let handle = self.spawn_poller(record.id.clone(), registered.domain, registered.key);
        self.pollers.lock().await.insert(record.id.clone(), handle);
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

    async fn delete_session(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let info = self.registry.session_info(id)?;

        // Cancellation before the provider acknowledged leaves the session
        // intact so the caller can retry the delete.
        match with_cancel(ctx, self.deregister_domain(&info.domain)).await {
            Err(err) if err.is_canceled() => return Err(err),
            Err(err) => log::warn!("oast delete {}: deregister failed: {err}", info.id),
            Ok(()) => {}
        }
        if let Some(handle) = self.pollers.lock().await.remove(&info.id) {
            handle.abort();
        }
        self.registry.remove(&info.id)?;
        Ok(())
    }

    async fn status(&self) -> BackendStatus {
        let connected = self
            .ever_connected
            .load(std::sync::atomic::Ordering::Relaxed);
        let detail = self
            .last_error
            .lock()
            .expect("status lock poisoned")
            .clone()
            .or_else(|| Some(self.server_url.clone()));
        BackendStatus { connected, detail }
    }

    async fn close(&self) {
        let mut pollers = self.pollers.lock().await;
        for (_, handle) in pollers.drain() {
            handle.abort();
        }
    }
}
