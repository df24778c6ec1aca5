//! DTLS 1.2 adapter: encrypted framing over UDP via in-memory BIOs.
//!
//! The OpenSSL session never touches the socket directly. Application
//! `encrypt`/`decrypt` calls are pure byte transforms against a pair of
//! in-memory datagram queues, while `handshake` drives a deadline loop
//! that shuttles pending records between those queues and the real UDP
//! socket.
//!
//! Each side uses a self-signed EC P-256 certificate generated at
//! construction. The SHA-256 fingerprint of the DER certificate is the
//! value exchanged out-of-band via signaling and compared by the peer, so
//! in-handshake certificate verification is disabled.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslMethod, SslOptions, SslStream, SslVerifyMode, SslVersion,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::protocol::{MTU, PROTOCOL_VERSION_TAG};

/// Total handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket poll interval inside the handshake loop.
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// Single cipher suite accepted by either side.
const CIPHER_LIST: &str = "ECDHE-ECDSA-AES128-GCM-SHA256";

/// DTLS endpoint role, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Server,
    Client,
}

/// Datagram-preserving in-memory stream bridging OpenSSL to the socket.
/// Reads pop whole inbound datagrams; writes queue whole outbound records.
#[derive(Default)]
struct MemoryStream {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.incoming.pop_front() {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct DtlsContext {
    stream: SslStream<MemoryStream>,
    role: DtlsRole,
    fingerprint: String,
    established: bool,
}

impl DtlsContext {
    /// Build a DTLS 1.2 context for the given role, generating a fresh
    /// key pair and self-signed certificate.
    pub fn new(role: DtlsRole) -> Result<Self> {
        let (cert, pkey) = generate_identity()?;
        let fingerprint = fingerprint_of(&cert)?;

        let mut builder =
            SslContext::builder(SslMethod::dtls()).context("SSL context creation failed")?;
        builder
            .set_min_proto_version(Some(SslVersion::DTLS1_2))
            .context("set DTLS 1.2 min version")?;
        builder
            .set_max_proto_version(Some(SslVersion::DTLS1_2))
            .context("set DTLS 1.2 max version")?;
        builder
            .set_cipher_list(CIPHER_LIST)
            .context("set cipher list")?;
        builder.set_certificate(&cert).context("set certificate")?;
        builder.set_private_key(&pkey).context("set private key")?;
        builder.check_private_key().context("key/cert mismatch")?;
        // The remote fingerprint is verified out-of-band via signaling.
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_options(SslOptions::NO_QUERY_MTU);
        let ctx = builder.build();

        let mut ssl = Ssl::new(&ctx).context("SSL object creation failed")?;
        match role {
            DtlsRole::Server => ssl.set_accept_state(),
            DtlsRole::Client => ssl.set_connect_state(),
        }
        ssl.set_mtu(MTU as u32).context("set DTLS MTU")?;

        let stream = SslStream::new(ssl, MemoryStream::default())
            .map_err(|e| anyhow!("SSL stream creation failed: {}", e))?;

        tracing::debug!("DTLS context created (role={:?})", role);
        Ok(DtlsContext {
            stream,
            role,
            fingerprint,
            established: false,
        })
    }

    /// SHA-256 fingerprint of the local certificate, colon-separated hex.
    /// This is the value the signaling layer hands to the peer.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// SHA-256 fingerprint of the peer's certificate, available after the
    /// handshake. Compared against the fingerprint received out-of-band.
    pub fn peer_fingerprint(&self) -> Option<String> {
        let cert = self.stream.ssl().peer_certificate()?;
        fingerprint_of(&cert).ok()
    }

    pub fn role(&self) -> DtlsRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Drive the handshake over the (connected) UDP socket. Alternates
    /// between flushing handshake output and feeding inbound datagrams,
    /// polling at 100 ms, under a 5 second overall deadline.
    pub async fn handshake(&mut self, socket: &UdpSocket) -> Result<()> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut buf = vec![0u8; 4096];

        loop {
            let step = self.stream.do_handshake();
            match step {
                Ok(()) => {
                    self.flush_outgoing(socket).await?;
                    self.established = true;
                    tracing::info!("DTLS handshake completed (role={:?})", self.role);
                    return Ok(());
                }
                Err(ref e)
                    if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {}
                Err(e) => bail!("DTLS handshake error: {}", e),
            }

            self.flush_outgoing(socket).await?;

            if Instant::now() >= deadline {
                bail!("DTLS handshake timed out after {:?}", HANDSHAKE_TIMEOUT);
            }

            match tokio::time::timeout(HANDSHAKE_POLL, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    self.stream
                        .get_mut()
                        .incoming
                        .push_back(buf[..n].to_vec());
                }
                Ok(Err(e)) => {
                    // Transient errors (e.g. ICMP-induced ECONNREFUSED on a
                    // connected socket) are retried until the deadline.
                    tracing::debug!("recv during DTLS handshake: {}", e);
                }
                Err(_) => {} // poll timeout, re-check deadline
            }
        }
    }

    /// Exchange the 4-byte protocol version tag, encrypted, after the
    /// handshake. Both sides send theirs and expect the peer's within the
    /// deadline; a missing or different tag fails the session.
    pub async fn exchange_version_tag(&mut self, socket: &UdpSocket) -> Result<bool> {
        anyhow::ensure!(self.established, "version exchange before handshake");

        let out = self.encrypt(&PROTOCOL_VERSION_TAG)?;
        socket.send(&out).await.context("version tag send failed")?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut buf = vec![0u8; 4096];

        while Instant::now() < deadline {
            match tokio::time::timeout(HANDSHAKE_POLL, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    // Late handshake retransmits decrypt to None and are
                    // skipped.
                    if let Some(plain) = self.decrypt(&buf[..n])? {
                        return Ok(plain == PROTOCOL_VERSION_TAG);
                    }
                    self.flush_outgoing(socket).await?;
                }
                Ok(Err(e)) => tracing::debug!("recv during version exchange: {}", e),
                Err(_) => {}
            }
        }

        Ok(false)
    }

    /// Encrypt one application datagram. Returns the DTLS record bytes.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(self.established, "encrypt before handshake");

        self.stream
            .ssl_write(data)
            .map_err(|e| anyhow!("DTLS encrypt failed: {}", e))?;

        let out = &mut self.stream.get_mut().outgoing;
        match out.len() {
            0 => bail!("DTLS produced no record"),
            1 => Ok(out.pop_front().unwrap()),
            _ => {
                // A write should map to one record; concatenate defensively.
                let mut all = Vec::new();
                while let Some(rec) = out.pop_front() {
                    all.extend_from_slice(&rec);
                }
                Ok(all)
            }
        }
    }

    /// Decrypt one received datagram. Returns `None` for records that
    /// carry no application data (handshake retransmits, alerts).
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        anyhow::ensure!(self.established, "decrypt before handshake");

        self.stream.get_mut().incoming.push_back(data.to_vec());

        let mut buf = vec![0u8; 65536];
        match self.stream.ssl_read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e)
                if e.code() == ErrorCode::WANT_READ
                    || e.code() == ErrorCode::WANT_WRITE
                    || e.code() == ErrorCode::ZERO_RETURN =>
            {
                Ok(None)
            }
            Err(e) => Err(anyhow!("DTLS decrypt failed: {}", e)),
        }
    }

    /// Begin shutdown: queue the close_notify alert and return the records
    /// to put on the wire. Best-effort; callers send them after releasing
    /// any lock around the context.
    pub fn shutdown_records(&mut self) -> Vec<Vec<u8>> {
        if !self.established {
            return Vec::new();
        }
        let _ = self.stream.shutdown();
        self.established = false;
        tracing::debug!("DTLS shutdown queued");
        self.stream.get_mut().outgoing.drain(..).collect()
    }

    async fn flush_outgoing(&mut self, socket: &UdpSocket) -> Result<()> {
        while let Some(record) = self.stream.get_mut().outgoing.pop_front() {
            socket
                .send(&record)
                .await
                .context("DTLS record send failed")?;
        }
        Ok(())
    }
}

fn generate_identity() -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).context("P-256 group")?;
    let ec_key = EcKey::generate(&group).context("EC key generation failed")?;
    let pkey = PKey::from_ec_key(ec_key)?;

    let mut serial_bytes = [0u8; 8];
    getrandom::getrandom(&mut serial_bytes).map_err(|e| anyhow!("CSPRNG failure: {}", e))?;
    serial_bytes[0] &= 0x7F;
    let serial = BigNum::from_slice(&serial_bytes)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "screenlink")?;
    let name = name.build();

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(1)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?; // self-signed
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&pkey)?;
    builder.sign(&pkey, MessageDigest::sha256())?;

    Ok((builder.build(), pkey))
}

fn fingerprint_of(cert: &X509) -> Result<String> {
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let ctx = DtlsContext::new(DtlsRole::Server).unwrap();
        let fp = ctx.fingerprint();
        // SHA-256 => 32 bytes => 64 hex chars + 31 colons.
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp
            .split(':')
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn test_fingerprints_unique_per_context() {
        let a = DtlsContext::new(DtlsRole::Server).unwrap();
        let b = DtlsContext::new(DtlsRole::Server).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        let mut ctx = DtlsContext::new(DtlsRole::Client).unwrap();
        assert!(ctx.encrypt(b"hello").is_err());
    }

    #[tokio::test]
    async fn test_handshake_and_round_trip_over_localhost() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server_sock
            .connect(client_sock.local_addr().unwrap())
            .await
            .unwrap();
        client_sock
            .connect(server_sock.local_addr().unwrap())
            .await
            .unwrap();

        let server_task = tokio::spawn(async move {
            let mut server = DtlsContext::new(DtlsRole::Server).unwrap();
            server.handshake(&server_sock).await.unwrap();

            // Receive one encrypted datagram and echo it back.
            let mut buf = vec![0u8; 4096];
            loop {
                let n = server_sock.recv(&mut buf).await.unwrap();
                if let Some(plain) = server.decrypt(&buf[..n]).unwrap() {
                    let out = server.encrypt(&plain).unwrap();
                    server_sock.send(&out).await.unwrap();
                    break;
                }
            }
        });

        let mut client = DtlsContext::new(DtlsRole::Client).unwrap();
        client.handshake(&client_sock).await.unwrap();

        let record = client.encrypt(b"ping over dtls").unwrap();
        client_sock.send(&record).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let echoed = loop {
            let n = tokio::time::timeout(Duration::from_secs(5), client_sock.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if let Some(plain) = client.decrypt(&buf[..n]).unwrap() {
                break plain;
            }
        };
        assert_eq!(echoed, b"ping over dtls");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_peer() {
        tokio::time::pause();

        // A bound socket that never answers (and never generates ICMP
        // errors, unlike a closed port).
        let silent_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(silent_peer.local_addr().unwrap()).await.unwrap();

        let mut ctx = DtlsContext::new(DtlsRole::Client).unwrap();
        let result = ctx.handshake(&sock).await;
        assert!(result.is_err());
        assert!(!ctx.is_established());
    }
}
