//! End-to-end daemon tests: spawn the real binary in service mode and
//! drive it through the CLI over the local socket.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::UnixStream;

fn sectap_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("sectap")
}

fn socket_path(work_dir: &Path) -> PathBuf {
    work_dir.join(".sectap/service/socket")
}

async fn wait_for_socket(socket: &Path) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        if UnixStream::connect(socket).await.is_ok() {
            return Ok(());
        }
        if started.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("daemon socket did not become ready: {}", socket.display());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_gone(socket: &Path) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        if !socket.exists() {
            return Ok(());
        }
        if started.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("socket was not removed: {}", socket.display());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn spawn_daemon(work_dir: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(sectap_bin());
    cmd.arg("--service")
        .arg("--workdir")
        .arg(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

fn cli(work_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(sectap_bin());
    cmd.arg("--workdir").arg(work_dir);
    cmd
}

#[tokio::test]
async fn daemon_lifecycle_and_single_instance() -> Result<()> {
    let dir = tempdir()?;
    let socket = socket_path(dir.path());

    let mut daemon = spawn_daemon(dir.path()).spawn().context("spawn daemon")?;
    wait_for_socket(&socket).await?;

    // Health over the socket through the CLI.
    let output = cli(dir.path()).args(["service", "status"]).output()?;
    assert!(output.status.success(), "status failed: {output:?}");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert!(status["version"].is_string());
    assert!(status["pid"].as_u64().is_some());

    // Encoding helpers round-trip through the daemon.
    let output = cli(dir.path())
        .args(["encode", "base64", "hello"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "aGVsbG8=");

    // A second daemon in the same working directory must refuse to start
    // while the first keeps serving.
    let second = spawn_daemon(dir.path()).output().await?;
    assert!(!second.status.success());
    assert!(
        String::from_utf8_lossy(&second.stderr).contains("already running"),
        "unexpected stderr: {}",
        String::from_utf8_lossy(&second.stderr)
    );

    let output = cli(dir.path()).args(["service", "status"]).output()?;
    assert!(output.status.success(), "first daemon stopped serving");

    // Graceful stop unlinks the socket and exits the process.
    let output = cli(dir.path()).args(["service", "stop"]).output()?;
    assert!(output.status.success(), "stop failed: {output:?}");
    wait_for_gone(&socket).await?;
    tokio::time::timeout(Duration::from_secs(5), daemon.wait())
        .await
        .context("daemon did not exit after stop")??;
    Ok(())
}

#[tokio::test]
async fn client_auto_starts_daemon() -> Result<()> {
    let dir = tempdir()?;
    let socket = socket_path(dir.path());
    assert!(!socket.exists());

    let output = cli(dir.path()).args(["encode", "url", "a b"]).output()?;
    assert!(output.status.success(), "auto-start failed: {output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "a+b");
    assert!(socket.exists(), "daemon was not auto-started");

    // The spawned daemon is detached; make sure we do not leak it.
    cli(dir.path())
        .args(["service", "stop"])
        .assert()
        .success();
    wait_for_gone(&socket).await?;
    Ok(())
}

#[tokio::test]
async fn oast_session_against_mock_provider() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/register")
        .with_status(200)
        .with_body(r#"{"domain":"x1y2z3.oast.test","key":"poll-key"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/poll")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(
            r#"{"events":[{"type":"dns","source_ip":"198.51.100.4","subdomain":"probe.x1y2z3.oast.test"}]}"#,
        )
        .create_async()
        .await;
    let deregister = server
        .mock("POST", "/deregister")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let dir = tempdir()?;
    let state_root = dir.path().join(".sectap");
    std::fs::create_dir_all(&state_root)?;
    std::fs::write(
        state_root.join("config.json"),
        format!(
            r#"{{"version":"0.1.0","initialized_at":"2026-08-01T00:00:00Z","burp_mcp_url":"http://127.0.0.1:9876/sse","oast_server_url":"{}"}}"#,
            server.url()
        ),
    )?;

    let socket = socket_path(dir.path());
    let mut daemon = spawn_daemon(dir.path()).spawn()?;
    wait_for_socket(&socket).await?;

    let output = cli(dir.path())
        .args(["oast", "create", "--label", "ssrf-probe"])
        .output()?;
    assert!(output.status.success(), "oast create failed: {output:?}");
    let created: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(created["domain"], "x1y2z3.oast.test");
    let oast_id = created["oast_id"].as_str().unwrap().to_string();

    // The provider poller feeds events into the ring; a long-poll sees
    // them well before its deadline.
    let output = cli(dir.path())
        .args(["oast", "poll", &oast_id, "--since", "last", "--wait", "10s"])
        .output()?;
    assert!(output.status.success(), "oast poll failed: {output:?}");
    let polled: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let events = polled["events"].as_array().unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0]["type"], "dns");
    assert_eq!(events[0]["source_ip"], "198.51.100.4");

    // Label resolves as the session identifier.
    let output = cli(dir.path())
        .args(["oast", "delete", "ssrf-probe"])
        .output()?;
    assert!(output.status.success(), "oast delete failed: {output:?}");
    deregister.assert_async().await;

    cli(dir.path()).args(["service", "stop"]).assert().success();
    tokio::time::timeout(Duration::from_secs(5), daemon.wait()).await??;
    Ok(())
}
