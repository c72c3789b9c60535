//! Small shared helpers: retry with backoff, external command execution and
//! network address arithmetic.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;
use crate::types::InterfaceInfo;

/// Runs `operation` up to `times` times, retrying only on the connection
/// error category. Any other error propagates immediately.
///
/// Delay between attempts doubles from `initial_delay`, capped at 16x.
pub async fn retry_connection<T, F, Fut>(
    times: u32,
    initial_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_connection() && attempt + 1 < times => {
                let factor = 1u32 << attempt.min(4);
                let delay = initial_delay * factor;
                log::warn!(
                    "Connection error ({e}), retrying in {}s ({} attempts left)",
                    delay.as_secs(),
                    times - attempt - 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Executes a shell command line, waiting for completion.
///
/// Failures are logged under `section` and reported as `false`; the caller
/// decides whether a failed hook is fatal (it never is).
pub async fn execute(command_line: &str, section: &str) -> bool {
    log::debug!("Executing command on {section}: {command_line}");

    #[cfg(unix)]
    let mut command = {
        let mut c = tokio::process::Command::new("/bin/sh");
        c.arg("-c").arg(command_line);
        c
    };
    #[cfg(windows)]
    let mut command = {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    };

    match command.output().await {
        Ok(output) => {
            log::debug!(
                "Result of executing cmd for {section} was {:?}",
                output.status
            );
            true
        }
        Err(e) => {
            log::error!("Got exception executing: {section} - {command_line} - {e}");
            false
        }
    }
}

/// An IPv4/IPv6 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

/// Parses a CIDR string ("192.168.1.0/24", "fd00::/8" or a bare address).
/// Returns `None` on anything not a valid network.
pub fn parse_net(net: &str) -> Option<Network> {
    let net = net.trim();
    if net.is_empty() {
        return None;
    }
    let (addr_part, prefix_part) = match net.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (net, None),
    };
    let addr: IpAddr = addr_part.parse().ok()?;
    let max_prefix = match addr {
        IpAddr::V4(_) => 32u8,
        IpAddr::V6(_) => 128u8,
    };
    let prefix = match prefix_part {
        Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
        None => max_prefix,
    };
    Some(Network { addr, prefix })
}

/// Checks whether `ip` (textual) lies inside `net`. Mixed families never match.
pub fn ip_in_net(ip: &str, net: &Network) -> bool {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    match (ip, net.addr) {
        (IpAddr::V4(ip), IpAddr::V4(base)) => {
            let mask = if net.prefix == 0 {
                0
            } else {
                u32::MAX << (32 - net.prefix)
            };
            (u32::from(ip) & mask) == (u32::from(base) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(base)) => {
            let mask = if net.prefix == 0 {
                0
            } else {
                u128::MAX << (128 - net.prefix)
            };
            (u128::from(ip) & mask) == (u128::from(base) & mask)
        }
        _ => false,
    }
}

/// Applies the interface admission rules: null/zero MAC, empty IP and
/// link-local (169.254/16) entries are dropped; when `restrict_net` is set,
/// only interfaces inside that subnet remain.
pub fn filter_interfaces(
    interfaces: Vec<InterfaceInfo>,
    restrict_net: Option<&str>,
) -> Vec<InterfaceInfo> {
    let subnet = restrict_net.and_then(parse_net);
    interfaces
        .into_iter()
        .filter(|i| {
            !i.mac.is_empty()
                && i.mac.chars().any(|c| c != '0' && c != ':')
                && !i.ip.is_empty()
                && !i.ip.starts_with("169.254.")
        })
        .filter(|i| match subnet {
            Some(net) => ip_in_net(&i.ip, &net),
            None => true,
        })
        .collect()
}

/// Wrap-safe delta between two readings of a 32-bit millisecond tick counter.
pub fn tick_delta_ms(now: u32, last: u32) -> u32 {
    now.wrapping_sub(last)
}
