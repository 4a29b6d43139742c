//! sectap command line.
//!
//! Client commands talk to the per-directory daemon over its local socket,
//! starting it on demand. The hidden `--service` flag is the daemon mode
//! the client spawns.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sectap_protocol::{self as proto, routes};
use sectap_service::util::parse_duration;
use sectap_service::{Daemon, DaemonOptions};
use serde::Serialize;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

mod client;

use client::DaemonClient;

#[derive(Parser)]
#[command(name = "sectap")]
#[command(about = "Share a security-testing session between an agent and a human operator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run as the background daemon (started automatically by client
    /// commands; rarely invoked by hand).
    #[arg(long, hide = true)]
    service: bool,

    /// Working directory holding the .sectap state root
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Client-side timeout (e.g. 30s, 2m)
    #[arg(long, global = true, default_value = "30s")]
    timeout: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Burp MCP SSE endpoint URL (daemon mode)
    #[arg(long, hide = true)]
    burp_mcp_url: Option<String>,

    /// Serve the MCP SSE gateway on localhost (daemon mode)
    #[arg(long)]
    mcp: bool,

    /// MCP SSE gateway port
    #[arg(long, default_value_t = sectap_mcp_server::DEFAULT_MCP_PORT)]
    mcp_port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Query proxy history, export flows, manage rewrite rules
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
    /// Re-issue recorded requests with edits
    Replay {
        #[command(subcommand)]
        command: ReplayCommands,
    },
    /// Out-of-band interaction sessions (blind vulnerability detection)
    Oast {
        #[command(subcommand)]
        command: OastCommands,
    },
    /// URL / base64 / HTML-entity encoding helpers
    Encode {
        #[command(subcommand)]
        command: EncodeCommands,
    },
    /// Daemon health, shutdown and logs
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// List proxy history (aggregated without filters)
    List {
        /// Host glob, e.g. '*.example.com'
        #[arg(long)]
        host: Option<String>,
        /// Path glob, e.g. '/api/*'
        #[arg(long)]
        path: Option<String>,
        /// Comma-separated methods, e.g. 'GET,POST'
        #[arg(long)]
        method: Option<String>,
        /// Comma-separated status codes, e.g. '200,302'
        #[arg(long)]
        status: Option<String>,
        /// Text match against URL or headers
        #[arg(long)]
        contains: Option<String>,
        /// Text match against request or response body
        #[arg(long)]
        contains_body: Option<String>,
        /// Entries after this flow_id, or 'last'
        #[arg(long)]
        since: Option<String>,
        /// Host glob to exclude
        #[arg(long)]
        exclude_host: Option<String>,
        /// Path glob to exclude
        #[arg(long)]
        exclude_path: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Export a flow to an on-disk bundle
    Export { flow_id: String },
    /// Manage match/replace rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    List {
        /// List WebSocket rules instead of HTTP
        #[arg(long)]
        websocket: bool,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    Add {
        /// request_header, request_body, response_header, response_body
        #[arg(long = "type")]
        rule_type: String,
        #[arg(long = "match")]
        match_pattern: Option<String>,
        #[arg(long)]
        replace: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        is_regex: bool,
        #[arg(long)]
        websocket: bool,
    },
    Update {
        /// Rule id or label
        rule_id: String,
        #[arg(long = "type")]
        rule_type: String,
        #[arg(long = "match")]
        match_pattern: Option<String>,
        #[arg(long)]
        replace: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        is_regex: bool,
    },
    Delete {
        /// Rule id or label
        rule_id: String,
    },
}

#[derive(Subcommand)]
enum ReplayCommands {
    /// Send a (possibly edited) request based on a recorded flow
    Send {
        flow_id: String,
        /// Replace the request body
        #[arg(long)]
        body: Option<String>,
        /// Override target, e.g. 'https://other.example.com'
        #[arg(long)]
        target: Option<String>,
        /// Header to add/replace ('Name: Value'); repeatable
        #[arg(long = "add-header")]
        add_headers: Vec<String>,
        /// Header name to remove; repeatable
        #[arg(long = "remove-header")]
        remove_headers: Vec<String>,
        /// Override the request path
        #[arg(long)]
        path: Option<String>,
        /// Override the entire query string
        #[arg(long)]
        query: Option<String>,
        /// Query param to set ('name=value'); repeatable
        #[arg(long = "set-query")]
        set_query: Vec<String>,
        /// Query param to remove; repeatable
        #[arg(long = "remove-query")]
        remove_query: Vec<String>,
        /// JSON field to set ('path=value'); repeatable
        #[arg(long = "set-json")]
        set_json: Vec<String>,
        /// JSON path to remove; repeatable
        #[arg(long = "remove-json")]
        remove_json: Vec<String>,
        #[arg(long)]
        follow_redirects: bool,
        /// Request timeout, e.g. '30s'
        #[arg(long = "request-timeout")]
        request_timeout: Option<String>,
        /// Skip request validation
        #[arg(long)]
        force: bool,
        /// Bundle id from 'proxy export' to attach the response to
        #[arg(long)]
        export: Option<String>,
    },
    /// Fetch the full response of a previous send
    Get { replay_id: String },
}

#[derive(Subcommand)]
enum OastCommands {
    Create {
        #[arg(long)]
        label: Option<String>,
    },
    Poll {
        /// Session id, label, or domain
        oast_id: String,
        /// Events after this event_id, or 'last'
        #[arg(long)]
        since: Option<String>,
        /// Long-poll duration (max 120s)
        #[arg(long)]
        wait: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    Get {
        oast_id: String,
        event_id: String,
    },
    List {
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    Delete {
        oast_id: String,
    },
}

#[derive(Subcommand)]
enum EncodeCommands {
    Url {
        input: String,
        #[arg(long)]
        decode: bool,
    },
    Base64 {
        input: String,
        #[arg(long)]
        decode: bool,
    },
    Html {
        input: String,
        #[arg(long)]
        decode: bool,
    },
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// Show daemon health and backend status
    Status,
    /// Gracefully stop the daemon
    Stop,
    /// Show the daemon log
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    let work_dir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve working directory")?,
    };

    if cli.service {
        return run_daemon(&cli, work_dir).await;
    }

    let Some(command) = cli.command else {
        bail!("subcommand required; see 'sectap --help'");
    };

    let timeout = parse_duration(&cli.timeout)
        .map_err(|err| anyhow::anyhow!("invalid --timeout: {err}"))?;
    let client = DaemonClient::new(&work_dir, timeout);

    match command {
        Commands::Proxy { command } => run_proxy(&client, command).await,
        Commands::Replay { command } => run_replay(&client, command).await,
        Commands::Oast { command } => run_oast(&client, command).await,
        Commands::Encode { command } => run_encode(&client, command).await,
        Commands::Service { command } => run_service(&client, command).await,
    }
}

async fn run_daemon(cli: &Cli, work_dir: PathBuf) -> Result<()> {
    let daemon = Daemon::start(DaemonOptions {
        work_dir,
        burp_mcp_url: cli.burp_mcp_url.clone(),
    })?;

    let gateway = if cli.mcp {
        Some(sectap_mcp_server::serve_sse(daemon.service.clone(), cli.mcp_port).await?)
    } else {
        None
    };

    let result = daemon.serve().await;
    if let Some(token) = gateway {
        token.cancel();
    }
    result
}

fn print_result<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_proxy(client: &DaemonClient, command: ProxyCommands) -> Result<()> {
    match command {
        ProxyCommands::List {
            host,
            path,
            method,
            status,
            contains,
            contains_body,
            since,
            exclude_host,
            exclude_path,
            limit,
        } => {
            let req = proto::ProxyListRequest {
                host: host.unwrap_or_default(),
                path: path.unwrap_or_default(),
                method: method.unwrap_or_default(),
                status: status.unwrap_or_default(),
                contains: contains.unwrap_or_default(),
                contains_body: contains_body.unwrap_or_default(),
                since: since.unwrap_or_default(),
                exclude_host: exclude_host.unwrap_or_default(),
                exclude_path: exclude_path.unwrap_or_default(),
                limit,
            };
            let resp: proto::ProxyListResponse = client.call(routes::PROXY_LIST, &req).await?;
            print_result(&resp)
        }
        ProxyCommands::Export { flow_id } => {
            let resp: proto::ProxyExportResponse = client
                .call(routes::PROXY_EXPORT, &proto::ProxyExportRequest { flow_id })
                .await?;
            print_result(&resp)
        }
        ProxyCommands::Rule { command } => run_rule(client, command).await,
    }
}

async fn run_rule(client: &DaemonClient, command: RuleCommands) -> Result<()> {
    match command {
        RuleCommands::List { websocket, limit } => {
            let resp: proto::RuleListResponse = client
                .call(
                    routes::PROXY_RULE_LIST,
                    &proto::RuleListRequest { websocket, limit },
                )
                .await?;
            print_result(&resp)
        }
        RuleCommands::Add {
            rule_type,
            match_pattern,
            replace,
            label,
            is_regex,
            websocket,
        } => {
            let req = proto::RuleAddRequest {
                rule_type,
                match_pattern: match_pattern.unwrap_or_default(),
                replace: replace.unwrap_or_default(),
                label: label.unwrap_or_default(),
                is_regex,
                websocket,
            };
            let resp: proto::ProxyRule = client.call(routes::PROXY_RULE_ADD, &req).await?;
            print_result(&resp)
        }
        RuleCommands::Update {
            rule_id,
            rule_type,
            match_pattern,
            replace,
            label,
            is_regex,
        } => {
            let req = proto::RuleUpdateRequest {
                rule_id,
                rule_type,
                match_pattern: match_pattern.unwrap_or_default(),
                replace: replace.unwrap_or_default(),
                label: label.unwrap_or_default(),
                is_regex,
            };
            let resp: proto::ProxyRule = client.call(routes::PROXY_RULE_UPDATE, &req).await?;
            print_result(&resp)
        }
        RuleCommands::Delete { rule_id } => {
            let resp: proto::RuleDeleteResponse = client
                .call(
                    routes::PROXY_RULE_DELETE,
                    &proto::RuleDeleteRequest { rule_id },
                )
                .await?;
            print_result(&resp)
        }
    }
}

async fn run_replay(client: &DaemonClient, command: ReplayCommands) -> Result<()> {
    match command {
        ReplayCommands::Send {
            flow_id,
            body,
            target,
            add_headers,
            remove_headers,
            path,
            query,
            set_query,
            remove_query,
            set_json,
            remove_json,
            follow_redirects,
            request_timeout,
            force,
            export,
        } => {
            let req = proto::ReplaySendRequest {
                flow_id,
                body: body.unwrap_or_default(),
                target: target.unwrap_or_default(),
                add_headers,
                remove_headers,
                path: path.unwrap_or_default(),
                query: query.unwrap_or_default(),
                set_query,
                remove_query,
                set_json,
                remove_json,
                follow_redirects,
                timeout: request_timeout.unwrap_or_default(),
                force,
                export: export.unwrap_or_default(),
            };
            let resp: proto::ReplaySendResponse = client.call(routes::REPLAY_SEND, &req).await?;
            print_result(&resp)
        }
        ReplayCommands::Get { replay_id } => {
            let resp: proto::ReplayGetResponse = client
                .call(routes::REPLAY_GET, &proto::ReplayGetRequest { replay_id })
                .await?;
            print_result(&resp)
        }
    }
}

async fn run_oast(client: &DaemonClient, command: OastCommands) -> Result<()> {
    match command {
        OastCommands::Create { label } => {
            let resp: proto::OastCreateResponse = client
                .call(
                    routes::OAST_CREATE,
                    &proto::OastCreateRequest {
                        label: label.unwrap_or_default(),
                    },
                )
                .await?;
            print_result(&resp)
        }
        OastCommands::Poll {
            oast_id,
            since,
            wait,
            limit,
        } => {
            let req = proto::OastPollRequest {
                oast_id,
                since: since.unwrap_or_default(),
                wait: wait.unwrap_or_default(),
                limit,
            };
            let resp: proto::OastPollResponse = client.call(routes::OAST_POLL, &req).await?;
            print_result(&resp)
        }
        OastCommands::Get { oast_id, event_id } => {
            let resp: proto::OastEvent = client
                .call(routes::OAST_GET, &proto::OastGetRequest { oast_id, event_id })
                .await?;
            print_result(&resp)
        }
        OastCommands::List { limit } => {
            let resp: proto::OastListResponse = client
                .call(routes::OAST_LIST, &proto::OastListRequest { limit })
                .await?;
            print_result(&resp)
        }
        OastCommands::Delete { oast_id } => {
            let resp: proto::OastDeleteResponse = client
                .call(routes::OAST_DELETE, &proto::OastDeleteRequest { oast_id })
                .await?;
            print_result(&resp)
        }
    }
}

async fn run_encode(client: &DaemonClient, command: EncodeCommands) -> Result<()> {
    let (route, input, decode) = match command {
        EncodeCommands::Url { input, decode } => (routes::ENCODE_URL, input, decode),
        EncodeCommands::Base64 { input, decode } => (routes::ENCODE_BASE64, input, decode),
        EncodeCommands::Html { input, decode } => (routes::ENCODE_HTML, input, decode),
    };
    let resp: proto::EncodeResponse = client
        .call(route, &proto::EncodeRequest { input, decode })
        .await?;
    println!("{}", resp.output);
    Ok(())
}

async fn run_service(client: &DaemonClient, command: ServiceCommands) -> Result<()> {
    match command {
        ServiceCommands::Status => match client.health().await {
            Ok(health) => print_result(&health),
            Err(err) => bail!("service not running: {err}"),
        },
        ServiceCommands::Stop => match client.stop().await {
            Ok(resp) => print_result(&resp),
            Err(err) => bail!("service not running: {err}"),
        },
        ServiceCommands::Logs { lines, follow } => show_logs(client, lines, follow).await,
    }
}

async fn show_logs(client: &DaemonClient, lines: usize, follow: bool) -> Result<()> {
    let log_path = client.paths().log_path.clone();
    let content = std::fs::read_to_string(&log_path)
        .with_context(|| format!("read {}", log_path.display()))?;

    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }

    if !follow {
        return Ok(());
    }

    let mut offset = content.len() as u64;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Ok(mut file) = std::fs::File::open(&log_path) else {
            continue;
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < offset {
            // Truncated; start over from the top.
            offset = 0;
        }
        if len == offset {
            continue;
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut new_content = String::new();
        use std::io::Read;
        file.read_to_string(&mut new_content)?;
        print!("{new_content}");
        offset = len;
    }
}
