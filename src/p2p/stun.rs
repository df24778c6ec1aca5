//! Minimal STUN Binding Request client (RFC 5389).
//!
//! Sends a 20-byte Binding Request to a public STUN server and parses the
//! XOR-MAPPED-ADDRESS (preferred) or MAPPED-ADDRESS (fallback) attribute
//! from the response to discover the server-reflexive address of a local
//! UDP socket. IPv4 only.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

/// STUN magic cookie (RFC 5389 section 6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ADDR_FAMILY_IPV4: u8 = 0x01;

const STUN_HEADER_SIZE: usize = 20;

/// Default STUN port when the server string has none.
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Per-attempt response deadline.
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Retry count.
const MAX_ATTEMPTS: u32 = 3;

/// Generate a 96-bit cryptographically random transaction ID.
pub fn generate_transaction_id() -> Result<[u8; 12]> {
    let mut txn = [0u8; 12];
    getrandom::getrandom(&mut txn).map_err(|e| anyhow::anyhow!("CSPRNG failure: {}", e))?;
    Ok(txn)
}

/// Build a 20-byte Binding Request (no attributes).
///
/// Layout: type(2)=0x0001, length(2)=0, magic cookie(4), transaction
/// ID(12).
pub fn build_binding_request(txn_id: &[u8; 12]) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length stays 0
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(txn_id);
    buf
}

/// Parse a Binding Success Response after verifying type, cookie, and
/// transaction ID. Returns the mapped (public) address.
pub fn parse_binding_response(data: &[u8], txn_id: &[u8; 12]) -> Option<(Ipv4Addr, u16)> {
    if data.len() < STUN_HEADER_SIZE {
        return None;
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS_RESPONSE {
        return None;
    }
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    if &data[8..20] != txn_id {
        return None;
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (STUN_HEADER_SIZE + msg_len).min(data.len());

    let mut xor_mapped = None;
    let mut mapped = None;

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let value_start = pos + 4;
        if value_start + attr_len > end {
            break;
        }
        let value = &data[value_start..value_start + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && value[1] == ADDR_FAMILY_IPV4 {
            let xport = u16::from_be_bytes([value[2], value[3]]);
            let port = xport ^ (MAGIC_COOKIE >> 16) as u16;
            let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
            let ip = Ipv4Addr::new(
                value[4] ^ cookie_bytes[0],
                value[5] ^ cookie_bytes[1],
                value[6] ^ cookie_bytes[2],
                value[7] ^ cookie_bytes[3],
            );
            xor_mapped = Some((ip, port));
        } else if attr_type == ATTR_MAPPED_ADDRESS && attr_len >= 8 && value[1] == ADDR_FAMILY_IPV4
        {
            let port = u16::from_be_bytes([value[2], value[3]]);
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            mapped = Some((ip, port));
        }

        // Attributes are padded to 4-byte boundaries.
        pos = value_start + ((attr_len + 3) & !3);
    }

    xor_mapped.or(mapped)
}

/// Discover the public endpoint of `socket` via a STUN server given as
/// `"host"` or `"host:port"`. Retries 3 times with a 500 ms deadline per
/// attempt.
pub async fn discover_public_endpoint(
    socket: &UdpSocket,
    stun_server: &str,
) -> Result<(Ipv4Addr, u16)> {
    let server = if stun_server.contains(':') {
        stun_server.to_string()
    } else {
        format!("{}:{}", stun_server, DEFAULT_STUN_PORT)
    };

    let server_addr: SocketAddr = tokio::net::lookup_host(&server)
        .await
        .with_context(|| format!("failed to resolve STUN server {}", server))?
        .find(|a| a.is_ipv4())
        .with_context(|| format!("no IPv4 address for STUN server {}", server))?;

    let txn_id = generate_transaction_id()?;
    let request = build_binding_request(&txn_id);

    for attempt in 0..MAX_ATTEMPTS {
        socket
            .send_to(&request, server_addr)
            .await
            .context("STUN request send failed")?;

        let mut buf = [0u8; 1024];
        match tokio::time::timeout(ATTEMPT_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                if let Some((ip, port)) = parse_binding_response(&buf[..n], &txn_id) {
                    tracing::info!("STUN: discovered {}:{} via {}", ip, port, server);
                    return Ok((ip, port));
                }
                tracing::debug!("STUN: unparseable response on attempt {}", attempt + 1);
            }
            Ok(Err(e)) => tracing::debug!("STUN recv error: {}", e),
            Err(_) => tracing::debug!("STUN timeout on attempt {}", attempt + 1),
        }
    }

    bail!("no STUN response from {} after {} attempts", server, MAX_ATTEMPTS)
}

/// Build a Binding Success Response carrying XOR-MAPPED-ADDRESS, used by
/// tests standing in for a STUN server.
#[cfg(test)]
pub fn build_binding_response(txn_id: &[u8; 12], ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&BINDING_SUCCESS_RESPONSE.to_be_bytes());
    buf.extend_from_slice(&12u16.to_be_bytes()); // one 8-byte attr + 4-byte header
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(txn_id);

    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&8u16.to_be_bytes());
    buf.push(0);
    buf.push(ADDR_FAMILY_IPV4);
    let xport = port ^ (MAGIC_COOKIE >> 16) as u16;
    buf.extend_from_slice(&xport.to_be_bytes());
    let cookie = MAGIC_COOKIE.to_be_bytes();
    for (i, octet) in ip.octets().iter().enumerate() {
        buf.push(octet ^ cookie[i]);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_layout() {
        let txn = [7u8; 12];
        let req = build_binding_request(&txn);
        assert_eq!(req.len(), 20);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[2..4], &[0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..20], &txn);
    }

    #[test]
    fn test_transaction_ids_random() {
        let a = generate_transaction_id().unwrap();
        let b = generate_transaction_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_response_round_trip() {
        let txn = generate_transaction_id().unwrap();
        let resp = build_binding_response(&txn, Ipv4Addr::new(203, 0, 113, 7), 54321);
        let (ip, port) = parse_binding_response(&resp, &txn).unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(port, 54321);
    }

    #[test]
    fn test_response_rejects_wrong_transaction_id() {
        let txn = [1u8; 12];
        let resp = build_binding_response(&txn, Ipv4Addr::new(1, 2, 3, 4), 80);
        let other = [2u8; 12];
        assert!(parse_binding_response(&resp, &other).is_none());
    }

    #[test]
    fn test_response_rejects_bad_cookie() {
        let txn = [1u8; 12];
        let mut resp = build_binding_response(&txn, Ipv4Addr::new(1, 2, 3, 4), 80);
        resp[4] ^= 0xFF;
        assert!(parse_binding_response(&resp, &txn).is_none());
    }

    #[test]
    fn test_response_rejects_wrong_type() {
        let txn = [1u8; 12];
        let mut resp = build_binding_response(&txn, Ipv4Addr::new(1, 2, 3, 4), 80);
        resp[1] = 0x11; // error response
        assert!(parse_binding_response(&resp, &txn).is_none());
    }

    #[test]
    fn test_mapped_address_fallback() {
        let txn = [9u8; 12];
        let mut buf = Vec::new();
        buf.extend_from_slice(&BINDING_SUCCESS_RESPONSE.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&txn);
        buf.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.push(0);
        buf.push(ADDR_FAMILY_IPV4);
        buf.extend_from_slice(&8080u16.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 0, 1]);

        let (ip, port) = parse_binding_response(&buf, &txn).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn test_discover_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 20);
            let mut txn = [0u8; 12];
            txn.copy_from_slice(&buf[8..20]);
            let resp = build_binding_response(&txn, Ipv4Addr::new(198, 51, 100, 2), 40000);
            server.send_to(&resp, from).await.unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (ip, port) = discover_public_endpoint(&client, &server_addr.to_string())
            .await
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(198, 51, 100, 2));
        assert_eq!(port, 40000);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_times_out_without_server() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = discover_public_endpoint(&client, "127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
