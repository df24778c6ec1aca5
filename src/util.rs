//! Shared helpers: monotonic microsecond clock and local interface
//! enumeration.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic timestamp in microseconds since the first call in this
/// process. Used for frame pacing, jitter-buffer aging, and all
/// wire-visible sender timestamps.
pub fn now_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Enumerate local non-loopback IPv4 addresses on interfaces that are up.
///
/// Addresses in 127/8 and interfaces that are down are skipped. Returns an
/// empty vector if enumeration fails (callers fall back to the default
/// outbound interface).
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let mut result = Vec::new();

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!("getifaddrs failed: {}", e);
            return result;
        }
    };

    use nix::net::if_::InterfaceFlags;
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(sin) = storage.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if ip.is_loopback() {
            continue;
        }
        if !result.contains(&ip) {
            result.push(ip);
        }
    }

    result
}

/// Determine the primary outbound IPv4 address by "connecting" a UDP socket
/// to a public address (no packets are sent). Fallback when interface
/// enumeration yields nothing.
pub fn default_outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}
