//! Loss-resilient UDP transport: DTLS framing, fragmentation, selective
//! retransmission, XOR FEC, and jitter buffering.

pub mod cache;
pub mod dtls;
pub mod fec;
pub mod jitter;
pub mod nack;
pub mod udp;

pub use cache::RetransmitCache;
pub use dtls::{DtlsContext, DtlsRole};
pub use fec::{FecEncoder, FecRecovery};
pub use jitter::JitterBuffer;
pub use nack::NackTracker;
pub use udp::UdpTransport;
