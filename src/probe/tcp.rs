//! TCP connect probe implementation.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use super::{ProbeError, Reading};

/// Open a TCP connection to `address` and report the connect time.
///
/// `port` overrides any port in `address`; with `port == 0` the address must carry one.
pub async fn run_tcp_probe(address: &str, port: u16, limit: Duration) -> Result<Reading, ProbeError> {
    let target = tcp_target(address, port)?;

    let start = Instant::now();

    let addrs: Vec<SocketAddr> = timeout(limit, lookup_host(target.as_str()))
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
        .map_err(|e| ProbeError::DnsFailure(format!("{}: {}", target, e)))?
        .collect();

    let addr = addrs
        .first()
        .copied()
        .ok_or_else(|| ProbeError::DnsFailure(format!("no addresses for {}", target)))?;

    let remaining = limit.saturating_sub(start.elapsed());
    timeout(remaining, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
        .map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused(format!("{}: {}", addr, e)),
            ErrorKind::TimedOut => ProbeError::Timeout(limit),
            _ => ProbeError::Network(format!("{}: {}", addr, e)),
        })?;

    Ok(Reading::new(start.elapsed()))
}

fn tcp_target(address: &str, port: u16) -> Result<String, ProbeError> {
    let host = address
        .trim_start_matches("tcp://")
        .trim_end_matches('/');

    if port != 0 {
        // Strip an existing port, but leave bare IPv6 literals alone
        let host = match host.rsplit_once(':') {
            Some((h, p)) if !h.contains(':') && p.parse::<u16>().is_ok() => h,
            _ => host,
        };
        if host.contains(':') && !host.starts_with('[') {
            return Ok(format!("[{}]:{}", host, port));
        }
        return Ok(format!("{}:{}", host, port));
    }

    match host.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => Ok(host.to_string()),
        _ => Err(ProbeError::Config(format!("no port given for {}", address))),
    }
}
