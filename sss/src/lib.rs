//! A secure, multiplexed, stream-oriented transport over UDP: an authenticated
//! CurveCP-style handshake establishes a channel between two long-term
//! identities, which multiplexes an arbitrary number of byte/record streams
//! with independent flow control and survives endpoint migration.
//!
//! Layered bottom-up, the same way the teacher's `wireguard` crate separates
//! `noise` (handshake) from `tunnel` (the data channel) from the crate root
//! (the public surface):
//!
//! - [`wire`] — on-the-wire struct layouts for every packet type.
//! - [`crypto`] — the AEAD constructions (`crypto::armor`, `crypto::cookie`,
//!   `crypto::boxed`) the handshake and channel layers seal/open packets with.
//! - [`identity`] — long-term keypairs and the `Eid` they're named by.
//! - [`kex`] — the four-message handshake state machine.
//! - [`channel`] — sequencing, ACKs, retransmission, congestion control.
//! - [`stream`], [`mux`] — per-stream byte/record sequencing and the LSID/USID
//!   multiplexer that maps streams onto one channel's frames.
//! - [`peer`] — one remote identity's full coordinator state.
//! - [`host`] — the process-wide registry: sockets, peers, listeners.
//! - [`server`] — the public façade applications actually program against.

pub mod channel;
pub mod crypto;
pub mod host;
pub mod identity;
pub mod kex;
pub mod mux;
pub mod peer;
pub mod server;
pub mod stream;
pub mod timers;
pub mod wire;

pub use host::{Host, HostError};
pub use identity::{Eid, Identity, IdentitySource};
pub use peer::PeerEvent;
pub use server::{Server, ShutdownMode, Stream};
pub use stream::ListenMode;
