//! Replay target resolution: explicit override, then Host header, with the
//! scheme implied by the origin flow as the fallback.

use super::http::{header_value, split_headers_body};
use crate::backend::Target;
use crate::error::{Result, ServiceError};

pub fn parse_target(raw: &[u8], override_target: &str, origin_https: bool) -> Result<Target> {
    if !override_target.is_empty() {
        return parse_override(override_target, origin_https);
    }

    let (head, _) = split_headers_body(raw);
    let host = header_value(head, "host")
        .ok_or_else(|| ServiceError::InvalidRequest("missing target host".into()))?;
    parse_host_port(&host, origin_https)
}

fn parse_override(target: &str, origin_https: bool) -> Result<Target> {
    let (https, rest) = if let Some(rest) = target.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = target.strip_prefix("http://") {
        (false, rest)
    } else {
        (origin_https, target)
    };

    // Drop any path component of a URL-shaped override.
    let rest = rest.split('/').next().unwrap_or_default();
    parse_host_port(rest, https)
}

fn parse_host_port(host: &str, https: bool) -> Result<Target> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ServiceError::InvalidRequest("missing target host".into()));
    }

    let (hostname, port) = match host.rsplit_once(':') {
        Some((name, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                ServiceError::InvalidRequest(format!("invalid target port in {host:?}"))
            })?;
            (name.to_string(), port)
        }
        None => (host.to_string(), if https { 443 } else { 80 }),
    };

    Ok(Target {
        hostname,
        port,
        uses_https: https,
    })
}
