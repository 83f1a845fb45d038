//! Ping probe with native ICMP echo and a `ping` command fallback.
//!
//! The echo exchange runs on a blocking socket inside `spawn_blocking` so the
//! measured round trip is not skewed by the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const PACKET_LEN: usize = 64;

/// Whether this process may open ICMP sockets.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpSupport {
    Native,
    CommandOnly,
}

static ICMP_SUPPORT: OnceLock<IcmpSupport> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_support() -> IcmpSupport {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows it
    for ty in [Type::RAW, Type::DGRAM] {
        if Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4)).is_ok() {
            tracing::info!("Ping probe: using native ICMP ({:?} socket)", ty);
            return IcmpSupport::Native;
        }
    }

    tracing::warn!("Ping probe: ICMP sockets unavailable, falling back to the ping command");
    IcmpSupport::CommandOnly
}

/// Ping `address` once and return the round-trip time.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let support = *ICMP_SUPPORT.get_or_init(detect_icmp_support);
    if support == IcmpSupport::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let result = tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!("Native ping to {} not permitted, using command: {}", address, msg);
            run_ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::DnsFailure(format!("{}: {}", address, e)))?
        .map(|addr| addr.ip())
        .next()
        .ok_or_else(|| ProbeError::DnsFailure(format!("no addresses for {}", address)))
}

/// One ICMP echo exchange on a blocking socket.
fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("cannot open ICMP socket: {}", e)))?;
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("cannot set socket timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("cannot connect ICMP socket: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("send failed: {}", e)))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("receive failed: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // SAFETY: recv initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        if is_matching_reply(data, ip.is_ipv4(), reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check an incoming datagram against the request we sent.
///
/// RAW IPv4 sockets deliver the IP header too; DGRAM and IPv6 sockets do not.
fn is_matching_reply(data: &[u8], ipv4: bool, reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if ipv4 && data.first().map(|b| b >> 4) == Some(4) {
        usize::from(data[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Echo request with a timestamp payload.
///
/// The ICMPv6 checksum covers a pseudo-header and is filled in by the kernel.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let wait_secs = timeout.as_secs().max(1).to_string();

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait_secs, address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("unknown host")
            || stderr.contains("Name or service not known")
            || stderr.contains("cannot resolve")
        {
            return Err(ProbeError::DnsFailure(stderr.trim().to_string()));
        }
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Extract the round-trip time from `ping` output.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet line, Linux and macOS
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            // Summary line, macOS then Linux
            r"round-trip\s+min/avg/max/stddev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .find(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output.trim())))
}
