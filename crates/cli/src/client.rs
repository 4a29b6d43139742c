//! Daemon client: HTTP over the per-directory local socket, with
//! auto-start when no daemon is listening.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use sectap_protocol::{Envelope, HealthResponse, StopResponse};
use sectap_service::ServicePaths;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UnixStream;

const STARTUP_WAIT: Duration = Duration::from_millis(50);
const STARTUP_RETRIES: usize = 60; // ~3s

pub struct DaemonClient {
    paths: ServicePaths,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(work_dir: &Path, timeout: Duration) -> Self {
        DaemonClient {
            paths: ServicePaths::new(work_dir),
            timeout,
        }
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    /// One request/response over the socket. No auto-start.
    pub async fn call_once<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        route: &str,
        body: &Req,
    ) -> Result<Resp> {
        let stream = UnixStream::connect(&self.paths.socket_path)
            .await
            .with_context(|| {
                format!("connect to daemon at {}", self.paths.socket_path.display())
            })?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("HTTP handshake with daemon")?;
        let conn_task = tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("daemon connection closed: {err}");
            }
        });

        let payload = serde_json::to_vec(body)?;
        let request = hyper::Request::builder()
            .method("POST")
            .uri(route)
            .header("host", "sectap")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))?;

        // Giving up client-side must also stop the work server-side: tear
        // the connection down so the daemon's per-connection cancellation
        // fires and the handler abandons its backend call.
        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .context("send request to daemon")?;
            response
                .into_body()
                .collect()
                .await
                .context("read daemon response")
        };
        let collected = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                conn_task.abort();
                anyhow::bail!(
                    "TIMEOUT: daemon did not answer within {:?}",
                    self.timeout
                );
            }
        };
        let bytes = collected.to_bytes();

        let envelope: Envelope<Resp> =
            serde_json::from_slice(&bytes).context("parse daemon response envelope")?;
        if envelope.ok {
            envelope
                .data
                .ok_or_else(|| anyhow::anyhow!("daemon returned ok without data"))
        } else {
            let error = envelope
                .error
                .ok_or_else(|| anyhow::anyhow!("daemon returned failure without error"))?;
            bail!("{}: {}", error.code.as_str(), error.message)
        }
    }

    /// One operation, starting the daemon first when needed.
    pub async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        route: &str,
        body: &Req,
    ) -> Result<Resp> {
        self.ensure_running().await?;
        self.call_once(route, body).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.call_once(sectap_protocol::routes::HEALTH, &serde_json::json!({}))
            .await
    }

    pub async fn stop(&self) -> Result<StopResponse> {
        self.call_once(sectap_protocol::routes::STOP, &serde_json::json!({}))
            .await
    }

    /// Probe the socket; spawn ourselves in daemon mode when it is dead.
    pub async fn ensure_running(&self) -> Result<()> {
        if self.health().await.is_ok() {
            return Ok(());
        }

        self.spawn_daemon()
            .context("spawn background daemon")?;

        for _ in 0..STARTUP_RETRIES {
            tokio::time::sleep(STARTUP_WAIT).await;
            if self.health().await.is_ok() {
                return Ok(());
            }
        }
        bail!(
            "SERVICE_UNAVAILABLE: daemon did not start; check {}",
            self.paths.log_path.display()
        )
    }

    fn spawn_daemon(&self) -> Result<()> {
        self.paths
            .ensure_dirs()
            .context("create .sectap state directories")?;

        let exe = std::env::current_exe().context("resolve current executable")?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("--service")
            .arg("--workdir")
            .arg(&self.paths.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        // The daemon logs on stderr; append it to the service log so
        // `sectap service logs` has something to show.
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.log_path)
        {
            Ok(file) => {
                cmd.stderr(Stdio::from(file));
            }
            Err(_) => {
                cmd.stderr(Stdio::null());
            }
        }

        // Detach so shell job control and process-group cleanups do not
        // take the daemon down with the client.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().context("spawn daemon process")?;
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}
