//! Daemon lifecycle: single-instance discipline, socket binding, backend
//! construction, and the `Starting -> Ready -> Draining -> Stopped` state
//! machine.

use crate::backend::burp::BurpBackend;
use crate::backend::interact::InteractBackend;
use crate::config::Config;
use crate::paths::ServicePaths;
use crate::server;
use crate::server::security::validate_socket_parent;
use crate::service::Service;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub work_dir: PathBuf,
    /// Overrides the configured Burp MCP endpoint when set.
    pub burp_mcp_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

/// Exclusive whole-file lock on the PID file. Held for the daemon's
/// lifetime; dropping it unlocks.
struct PidLock {
    file: std::fs::File,
    path: PathBuf,
}

impl PidLock {
    fn acquire(path: &PathBuf) -> Result<PidLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("open pid file at {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!("already running: another daemon holds {}", path.display());
        }

        // The PID is written only after the lock succeeds.
        let mut file_ref = &file;
        file_ref.set_len(0).ok();
        write!(file_ref, "{}", std::process::id())
            .with_context(|| format!("write pid to {}", path.display()))?;
        file_ref.flush().ok();

        Ok(PidLock {
            file,
            path: path.clone(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Daemon {
    pub service: Arc<Service>,
    listener: UnixListener,
    state: DaemonState,
    _lock: PidLock,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// `Starting`: create the state root, take the instance lock, open the
    /// adapters, and bind the socket. Any failure leaves the directory
    /// daemon-free.
    pub fn start(opts: DaemonOptions) -> Result<Daemon> {
        let paths = ServicePaths::new(&opts.work_dir);
        paths
            .ensure_dirs()
            .context("create .sectap state directories")?;

        let mut config = Config::load_or_default(&paths.config_path, crate::VERSION)
            .context("load config.json")?;
        if let Some(url) = &opts.burp_mcp_url {
            config.burp_mcp_url = url.clone();
        }

        let lock = PidLock::acquire(&paths.pid_path)?;

        validate_socket_parent(&paths.socket_path)?;
        // Safe now that the lock proves no live daemon owns the socket.
        if paths.socket_path.exists() {
            std::fs::remove_file(&paths.socket_path)
                .with_context(|| format!("remove stale socket {}", paths.socket_path.display()))?;
        }
        let listener = UnixListener::bind(&paths.socket_path)
            .with_context(|| format!("bind socket {}", paths.socket_path.display()))?;
        std::fs::set_permissions(&paths.socket_path, std::fs::Permissions::from_mode(0o600))
            .context("restrict socket permissions")?;

        let http_backend = Arc::new(BurpBackend::new(&config.burp_mcp_url));
        let oast_backend = Arc::new(InteractBackend::new(
            &config.oast_server_url,
            config.oast_ring_capacity,
        ));

        let replay_ttl = Duration::from_secs(config.replay_ttl_secs);
        let replay_sweep = Duration::from_secs(config.replay_sweep_secs);

        let service = Arc::new(Service::new(
            crate::VERSION,
            paths,
            config,
            http_backend,
            oast_backend,
        ));
        let sweeper = service.replays.spawn_sweeper(replay_ttl, replay_sweep);

        log::info!(
            "daemon starting in {} (pid {})",
            opts.work_dir.display(),
            std::process::id()
        );

        Ok(Daemon {
            service,
            listener,
            state: DaemonState::Starting,
            _lock: lock,
            sweeper,
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// `Ready`: serve until `stop` or a termination signal, then drain and
    /// clean up. Consumes the daemon; the instance lock releases on return.
    pub async fn serve(mut self) -> Result<()> {
        self.state = DaemonState::Ready;
        log::info!(
            "daemon ready on {}",
            self.service.paths.socket_path.display()
        );

        let signal_service = self.service.clone();
        let signals = tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
                _ = sigterm.recv() => log::info!("SIGTERM received"),
            }
            signal_service.request_shutdown();
        });

        let result = server::serve(self.listener, self.service.clone(), DRAIN_DEADLINE).await;

        self.state = DaemonState::Draining;
        log::info!("daemon draining");
        signals.abort();
        self.sweeper.abort();
        self.service.replays.clear();
        self.service.http_backend.close().await;
        self.service.oast_backend.close().await;
        let _ = std::fs::remove_file(&self.service.paths.socket_path);

        self.state = DaemonState::Stopped;
        log::info!("daemon stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_lock_is_exclusive_per_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pid");

        let lock = PidLock::acquire(&path).unwrap();
        let pid_text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid_text, std::process::id().to_string());

        let err = PidLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(lock);
        let _relock = PidLock::acquire(&path).unwrap();
    }

    #[tokio::test]
    async fn start_binds_socket_and_second_start_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = DaemonOptions {
            work_dir: tmp.path().to_path_buf(),
            burp_mcp_url: None,
        };

        let daemon = Daemon::start(opts.clone()).unwrap();
        assert_eq!(daemon.state(), DaemonState::Starting);
        let socket = daemon.service.paths.socket_path.clone();
        assert!(socket.exists());

        let err = Daemon::start(opts).unwrap_err();
        assert!(err.to_string().contains("already running"));

        // First daemon's socket is untouched by the failed second start.
        assert!(socket.exists());
    }

    #[tokio::test]
    async fn stop_drains_and_removes_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::start(DaemonOptions {
            work_dir: tmp.path().to_path_buf(),
            burp_mcp_url: None,
        })
        .unwrap();
        let service = daemon.service.clone();
        let socket = service.paths.socket_path.clone();

        let handle = tokio::spawn(daemon.serve());
        tokio::task::yield_now().await;

        service.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon exits")
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        assert!(!service.paths.pid_path.exists(), "pid lock released");
    }
}
