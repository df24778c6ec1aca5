//! NAT traversal: STUN server-reflexive discovery, ICE-lite candidate
//! gathering and connectivity checks, and the TURN relay stub.

pub mod ice;
pub mod stun;
pub mod turn;

pub use ice::{compute_priority, Candidate, CandidateKind, IceAgent, IceConfig, IceResult};
pub use turn::{TurnClient, TurnConfig};
