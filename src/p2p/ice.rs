//! ICE-lite agent: candidate gathering and magic-probe connectivity
//! checks.
//!
//! Gathering binds one UDP socket per non-loopback IPv4 interface (host
//! candidates), then queries each configured STUN server from every
//! socket for server-reflexive candidates that inherit the underlying
//! socket. Connectivity checking sends the 4-byte `CSIC` probe from every
//! local socket to every remote candidate each 200 ms, polling 50 ms
//! between rounds; the first matching probe selects the pair and the
//! winning socket is connected to the observed sender. A probe from an
//! unknown sender is promoted to a peer-reflexive candidate and wins
//! immediately.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::stun;
use crate::protocol::ICE_PROBE_MAGIC;
use crate::util;

/// Overall connectivity-check deadline.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe transmission period.
const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Socket poll slice between probe rounds.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Candidate type. Host candidates outrank server-reflexive, which
/// outrank relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::Srflx | CandidateKind::Prflx => 100,
            CandidateKind::Relay => 0,
        }
    }
}

/// A network endpoint offered to the peer for connectivity checks.
/// Serializable for the out-of-band signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub ip: IpAddr,
    pub port: u16,
    pub priority: u32,
    pub foundation: String,
}

impl Candidate {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// ICE priority per RFC 5245 section 4.1.2.1:
/// `(2^24)*type_pref + (2^8)*local_pref + (256 - component)`.
pub fn compute_priority(kind: CandidateKind, local_pref: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) + ((local_pref as u32) << 8) + (256 - component as u32)
}

/// Agent configuration. `bind_addrs` overrides interface enumeration
/// (explicit addresses, LAN-only setups, loopback under test); port 0
/// means OS-assigned.
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub bind_addrs: Option<Vec<SocketAddr>>,
}

/// The selected pair and its connected socket.
pub struct IceResult {
    pub socket: Arc<UdpSocket>,
    pub local: Candidate,
    pub remote: Candidate,
}

type ConnectedCallback = Box<dyn Fn(&Candidate, &Candidate) + Send + Sync>;
type FailedCallback = Box<dyn Fn() + Send + Sync>;

struct LocalEntry {
    candidate: Candidate,
    socket_index: usize,
}

pub struct IceAgent {
    config: IceConfig,
    sockets: Vec<Arc<UdpSocket>>,
    locals: Vec<LocalEntry>,
    remotes: Mutex<Vec<Candidate>>,
    on_connected: Mutex<Option<ConnectedCallback>>,
    on_failed: Mutex<Option<FailedCallback>>,
}

impl IceAgent {
    pub fn new(config: IceConfig) -> Self {
        IceAgent {
            config,
            sockets: Vec::new(),
            locals: Vec::new(),
            remotes: Mutex::new(Vec::new()),
            on_connected: Mutex::new(None),
            on_failed: Mutex::new(None),
        }
    }

    pub fn set_on_connected(&self, cb: ConnectedCallback) {
        *self.on_connected.lock().unwrap() = Some(cb);
    }

    pub fn set_on_failed(&self, cb: FailedCallback) {
        *self.on_failed.lock().unwrap() = Some(cb);
    }

    /// Gather host and server-reflexive candidates.
    pub async fn gather_candidates(&mut self) -> Result<Vec<Candidate>> {
        self.sockets.clear();
        self.locals.clear();

        let bind_addrs: Vec<SocketAddr> = match &self.config.bind_addrs {
            Some(addrs) => addrs.clone(),
            None => {
                let mut ips = util::local_ipv4_addresses();
                if ips.is_empty() {
                    ips.extend(util::default_outbound_ipv4());
                }
                ips.into_iter()
                    .map(|ip| SocketAddr::new(IpAddr::V4(ip), 0))
                    .collect()
            }
        };

        let mut local_pref: u16 = 65535;

        for addr in bind_addrs {
            let socket = match UdpSocket::bind(addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("ICE: bind {} failed: {}", addr, e);
                    continue;
                }
            };
            let bound = socket.local_addr()?;

            let candidate = Candidate {
                kind: CandidateKind::Host,
                ip: bound.ip(),
                port: bound.port(),
                priority: compute_priority(CandidateKind::Host, local_pref, 1),
                foundation: format!("host_{}", bound.ip()),
            };
            local_pref = local_pref.saturating_sub(1);

            tracing::info!("ICE: host candidate {}", bound);
            self.sockets.push(Arc::new(socket));
            self.locals.push(LocalEntry {
                candidate,
                socket_index: self.sockets.len() - 1,
            });
        }

        if self.sockets.is_empty() {
            bail!("ICE: no local sockets could be bound");
        }

        // Server-reflexive candidates, one query per (socket, server).
        let stun_servers = self.config.stun_servers.clone();
        for server in &stun_servers {
            for index in 0..self.sockets.len() {
                let socket = self.sockets[index].clone();
                match stun::discover_public_endpoint(&socket, server).await {
                    Ok((ip, port)) => {
                        let dup = self
                            .locals
                            .iter()
                            .any(|l| l.candidate.ip == IpAddr::V4(ip) && l.candidate.port == port);
                        if dup {
                            continue;
                        }
                        let candidate = Candidate {
                            kind: CandidateKind::Srflx,
                            ip: IpAddr::V4(ip),
                            port,
                            priority: compute_priority(CandidateKind::Srflx, local_pref, 1),
                            foundation: format!("srflx_{}", ip),
                        };
                        local_pref = local_pref.saturating_sub(1);
                        tracing::info!("ICE: srflx candidate {}:{} (via {})", ip, port, server);
                        // srflx candidates share the host socket they were
                        // discovered from.
                        self.locals.push(LocalEntry {
                            candidate,
                            socket_index: index,
                        });
                    }
                    Err(e) => tracing::debug!("ICE: STUN via {} failed: {}", server, e),
                }
            }
        }

        Ok(self.locals.iter().map(|l| l.candidate.clone()).collect())
    }

    /// Inject a remote candidate received from signaling.
    pub fn add_remote_candidate(&self, candidate: Candidate) {
        tracing::debug!(
            "ICE: remote candidate {:?} {}:{}",
            candidate.kind,
            candidate.ip,
            candidate.port
        );
        self.remotes.lock().unwrap().push(candidate);
    }

    /// Run connectivity checks until a pair is selected or the 5 s
    /// deadline expires. Fires `on_connected` or `on_failed` exactly once.
    pub async fn check_connectivity(&self) -> Result<IceResult> {
        let remotes: Vec<Candidate> = self.remotes.lock().unwrap().clone();
        if remotes.is_empty() || self.sockets.is_empty() {
            self.fire_failed();
            bail!("ICE: no candidates to check");
        }

        tracing::info!(
            "ICE: starting connectivity checks ({} local sockets x {} remote candidates)",
            self.sockets.len(),
            remotes.len()
        );

        let deadline = Instant::now() + CHECK_TIMEOUT;
        let mut last_probe: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("ICE: connectivity checks timed out after {:?}", CHECK_TIMEOUT);
                self.fire_failed();
                bail!("ICE connectivity checks timed out");
            }

            if last_probe.map_or(true, |t| now.duration_since(t) >= PROBE_INTERVAL) {
                last_probe = Some(now);
                for socket in &self.sockets {
                    for remote in &remotes {
                        let _ = socket.send_to(&ICE_PROBE_MAGIC, remote.addr()).await;
                    }
                }
            }

            // Poll every local socket for an incoming probe.
            let recvs: Vec<_> = self
                .sockets
                .iter()
                .enumerate()
                .map(|(index, socket)| {
                    let socket = socket.clone();
                    Box::pin(async move {
                        let mut buf = [0u8; 64];
                        let result = socket.recv_from(&mut buf).await;
                        (index, result.map(|(n, from)| (buf[..n].to_vec(), from)))
                    })
                })
                .collect();

            let polled = tokio::time::timeout(POLL_INTERVAL, futures::future::select_all(recvs));
            let Ok(((index, received), _, _)) = polled.await else {
                continue;
            };
            let Ok((data, from)) = received else {
                continue;
            };
            if data.len() < ICE_PROBE_MAGIC.len() || data[..4] != ICE_PROBE_MAGIC {
                continue;
            }

            let socket = self.sockets[index].clone();
            let local = self
                .locals
                .iter()
                .find(|l| l.socket_index == index)
                .map(|l| l.candidate.clone())
                .expect("socket without a host candidate");

            let remote = match remotes.iter().find(|r| r.addr() == from) {
                Some(r) => r.clone(),
                None => {
                    // Unknown sender: the peer is probing from a port we
                    // were not told about (NAT rebinding). Promote it.
                    tracing::info!("ICE: probe from unknown source {}, treating as prflx", from);
                    Candidate {
                        kind: CandidateKind::Prflx,
                        ip: from.ip(),
                        port: from.port(),
                        priority: compute_priority(CandidateKind::Prflx, 1, 1),
                        foundation: format!("prflx_{}", from.ip()),
                    }
                }
            };

            socket
                .connect(from)
                .await
                .context("connect to selected pair failed")?;

            tracing::info!(
                "ICE: connected, local {}:{} <-> remote {}",
                local.ip,
                local.port,
                from
            );

            if let Some(cb) = self.on_connected.lock().unwrap().take() {
                cb(&local, &remote);
            }
            self.on_failed.lock().unwrap().take();

            return Ok(IceResult {
                socket,
                local,
                remote,
            });
        }
    }

    fn fire_failed(&self) {
        if let Some(cb) = self.on_failed.lock().unwrap().take() {
            cb();
        }
        self.on_connected.lock().unwrap().take();
    }
}
