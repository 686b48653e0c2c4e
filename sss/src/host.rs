//! The host registry (spec.md §2, expanded in SPEC_FULL.md §4.7): process-wide
//! tables (bound sockets, peers by identity, service listeners) and the
//! dispatch-by-magic read path that hands each received datagram to the right
//! key-exchange phase or peer, generalizing `Wireguard::read`'s match on
//! `packet::Tag` from exactly one peer to an arbitrary number of them.
//!
//! Unlike `Wireguard`, a [`Host`] does not register itself with `runtime::Io`:
//! `Io<T: AsRawFd>` wraps one *connected* socket (`send`/`recv`, no peer address),
//! which fits the teacher's single-tunnel shape but not a socket shared by many
//! peers at different endpoints. `Host` owns its two `std::net::UdpSocket`s
//! directly and reads/writes them with `recv_from`/`send_to`, driven by an
//! explicit [`Instant`] the same way `channel`/`peer`/`kex` already are — the
//! embedding application's own reactor calls [`Host::poll`] instead of a
//! `stakker` actor being scheduled by one. This is a deliberate departure from a
//! `stakker`-actor-shaped host; see DESIGN.md.

use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::sync::Once;
use std::time::Instant;

use collections::bytes::Slice;
use log::{debug, info, warn};
use utils::bytes::cast_mut;
use utils::error::*;

use crate::crypto::cookie::{CookieIssuer, ReplayCache};
use crate::identity::{Eid, Identity, IdentitySource};
use crate::kex::Responder;
use crate::peer::{Location, Peer, PeerEvent};
use crate::stream::StreamId;
use crate::wire::kex::{Cookie, Hello, Initiate, MESSAGE_MAGIC};

/// Default listening port (spec.md §6.4), tried before falling back to an
/// ephemeral one.
pub const DEFAULT_PORT: u16 = 9660;

/// Maximum datagram this host will ever receive; comfortably above the channel
/// MTU (spec.md §4.1's 1280 bytes) to leave room for handshake packets, which
/// aren't subject to the same path-MTU budget.
const RECV_BUF_LEN: usize = 2048;

/// Replay cache size for completed handshakes (spec.md §4.5, §8 scenario 5).
const REPLAY_CACHE_CAPACITY: usize = 4096;

/// How many outbound packets one peer may flush in a single [`Host::poll`] call
/// (spec.md §5's cooperative, non-blocking scheduling — no peer may monopolize a
/// tick).
const DRAIN_BUDGET: usize = 64;

/// A long-term identity's raw bytes, used as the hash-map key for every table
/// below. `Eid` (`x25519_dalek::PublicKey`) is plain data but doesn't derive
/// `Hash`, so every table keys on the bytes directly rather than the type,
/// reconstructing an `Eid` with `Eid::from` at the API boundary.
type PeerKey = [u8; 32];

fn key(remote: Eid) -> PeerKey {
	*remote.as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
	/// `Server::listen` was called twice for the same (service, protocol) pair.
	ListenerExists,
	/// The operation named a cryptographically nonsensical identity (currently:
	/// this host's own).
	InvalidKey,
	/// `Stream::connect_to` had neither a known location for the remote identity
	/// nor a location hint to seed one.
	NoRoute,
}

/// One registered service, and the top-level streams accepted for it that the
/// application hasn't yet collected via `Server::accept` (spec.md §6.4).
struct Listener {
	service_desc: String,
	protocol_desc: String,
	accepted: VecDeque<(PeerKey, StreamId)>,
}

/// Encodes the (service, protocol) pair a freshly opened top-level stream
/// requests, as the first record written on it. Negotiation happens at the
/// stream's own record boundary rather than riding in the handshake's `Initiate`
/// metadata, so it works identically whether or not a channel to the remote
/// already exists — matching the original's remark that service/protocol
/// negotiation is implemented "by extending this class" (the stream), not the
/// key exchange.
fn encode_request(service: &str, protocol: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + service.len() + protocol.len());
	out.extend_from_slice(&(service.len() as u16).to_be_bytes());
	out.extend_from_slice(service.as_bytes());
	out.extend_from_slice(&(protocol.len() as u16).to_be_bytes());
	out.extend_from_slice(protocol.as_bytes());
	out
}

fn decode_request(buf: &[u8]) -> Option<(String, String)> {
	let service_len = *buf.get(0..2)?;
	let service_len = u16::from_be_bytes(service_len.try_into().ok()?) as usize;
	let rest = buf.get(2..)?;
	let service = rest.get(..service_len)?;
	let rest = rest.get(service_len..)?;

	let protocol_len = *rest.get(0..2)?;
	let protocol_len = u16::from_be_bytes(protocol_len.try_into().ok()?) as usize;
	let protocol = rest.get(2..2 + protocol_len)?;

	Some((String::from_utf8(service.to_vec()).ok()?, String::from_utf8(protocol.to_vec()).ok()?))
}

static LOGGER_INIT: Once = Once::new();

/// Installs `runtime::logger::Logger` as the process-wide `log` backend. Every
/// `Err(())` this crate produces is logged at the point it's raised (`warn!`) or,
/// for failures that force a channel down, at `error!`; without a logger
/// installed those calls are silently swallowed by the `log` crate's no-op
/// default. Idempotent, so it's safe to call from every [`Host::create`]
/// including in tests that stand up more than one host in a process.
fn init_logging() {
	LOGGER_INIT.call_once(|| {
		if log::set_boxed_logger(Box::new(runtime::logger::Logger)).is_ok() {
			log::set_max_level(log::LevelFilter::Trace);
		}
	});
}

fn bind(port: u16, v6: bool) -> Option<UdpSocket> {
	let addr: SocketAddr = if v6 {
		SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into()
	} else {
		SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()
	};

	let socket = UdpSocket::bind(addr).or_else(|_| {
		let ephemeral: SocketAddr =
			if v6 { SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into() } else { SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into() };

		UdpSocket::bind(ephemeral)
	});

	match socket {
		Ok(s) => {
			if let Err(err) = s.set_nonblocking(true) {
				warn!("failed to set socket nonblocking: {err}");
				return None;
			}

			Some(s)
		}
		Err(err) => {
			warn!("failed to bind {} socket: {err}", if v6 { "IPv6" } else { "IPv4" });
			None
		}
	}
}

/// Process-wide SSS state: this host's identity, its bound sockets, every peer
/// it knows about, and the services it listens for (spec.md §2's "Host
/// registry" table; §6.4's `host::create`).
pub struct Host {
	identity: Identity,
	v4: Option<UdpSocket>,
	v6: Option<UdpSocket>,

	peers: HashMap<PeerKey, Peer>,
	/// Source address a pending `Hello`/`Initiate` was sent to, reversed back to
	/// the peer that sent it — a `Cookie`/`Message` reply carries no cleartext
	/// identity to key on directly (spec.md §6.3).
	initiating_to: HashMap<SocketAddr, PeerKey>,
	/// Current send address for each peer's primary channel, updated whenever a
	/// channel starts or migrates.
	channel_addr: HashMap<PeerKey, SocketAddr>,
	/// Reverse of `channel_addr`, rebuilt alongside it, so a data packet's source
	/// address resolves straight back to the peer that owns it.
	addr_peer: HashMap<SocketAddr, PeerKey>,

	listeners: HashMap<(String, String), Listener>,
	/// Accepted substreams awaiting their first record (the service/protocol
	/// request) before they can be routed to a listener.
	awaiting_negotiation: Vec<(PeerKey, StreamId)>,

	cookies: CookieIssuer,
	replay: ReplayCache,
}

impl Host {
	/// Opens one IPv4 and one IPv6 socket on `port`, falling back to an ephemeral
	/// port per-family on failure (spec.md §6.4). Fails only if neither family
	/// could bind at all.
	pub fn create(identity: impl IdentitySource, port: u16) -> Result<Self, HostError> {
		init_logging();

		let identity = identity.into_identity();
		let v4 = bind(port, false);
		let v6 = bind(port, true);

		if v4.is_none() && v6.is_none() {
			return Err(HostError::NoRoute);
		}

		Ok(Self {
			identity,
			v4,
			v6,
			peers: HashMap::new(),
			initiating_to: HashMap::new(),
			channel_addr: HashMap::new(),
			addr_peer: HashMap::new(),
			listeners: HashMap::new(),
			awaiting_negotiation: Vec::new(),
			cookies: CookieIssuer::default(),
			replay: ReplayCache::new(REPLAY_CACHE_CAPACITY),
		})
	}

	pub fn identity(&self) -> Eid {
		self.identity.public()
	}

	/// The address this host's IPv4 or IPv6 socket actually bound to (after the
	/// ephemeral-port fallback in [`Self::create`]), for advertising to peers out
	/// of band. `None` if this host has no socket of that family.
	pub fn local_addr(&self, v6: bool) -> Option<SocketAddr> {
		if v6 { self.v6.as_ref() } else { self.v4.as_ref() }.and_then(|s| s.local_addr().ok())
	}

	/// Looks up a peer by identity for [`crate::server`]'s stream handles, which
	/// hold onto an `Eid` rather than a `Peer` reference since the peer itself
	/// may come and go between calls.
	pub(crate) fn peer_mut(&mut self, remote: Eid) -> Option<&mut Peer> {
		self.peers.get_mut(&key(remote))
	}

	fn socket_for(&self, addr: SocketAddr) -> Option<&UdpSocket> {
		match addr {
			SocketAddr::V4(_) => self.v4.as_ref(),
			SocketAddr::V6(_) => self.v6.as_ref(),
		}
	}

	fn send(&self, addr: SocketAddr, bytes: &[u8]) {
		let Some(socket) = self.socket_for(addr) else {
			warn!("no socket available to reach {addr}");
			return;
		};

		if let Err(err) = socket.send_to(bytes, addr) {
			warn!("failed to send {} bytes to {addr}: {err}", bytes.len());
		}
	}

	fn ensure_peer(&mut self, remote: Eid) -> &mut Peer {
		self.peers.entry(key(remote)).or_insert_with(|| Peer::new(remote, rand::random()))
	}

	fn bind_channel_addr(&mut self, remote: PeerKey, addr: SocketAddr) {
		if let Some(previous) = self.channel_addr.insert(remote, addr) {
			self.addr_peer.remove(&previous);
		}

		self.addr_peer.insert(addr, remote);
	}

	/// Registers a listener for `(service, protocol)`; fails if one is already
	/// registered for that pair (spec.md §6.4 `server::listen`).
	pub fn listen(&mut self, service: &str, service_desc: &str, protocol: &str, protocol_desc: &str) -> Result<(), HostError> {
		let listener_key = (service.to_string(), protocol.to_string());

		if self.listeners.contains_key(&listener_key) {
			return Err(HostError::ListenerExists);
		}

		self.listeners.insert(
			listener_key,
			Listener { service_desc: service_desc.to_string(), protocol_desc: protocol_desc.to_string(), accepted: VecDeque::new() },
		);
		Ok(())
	}

	pub fn stop_listening(&mut self, service: &str, protocol: &str) {
		self.listeners.remove(&(service.to_string(), protocol.to_string()));
	}

	pub fn listener_descriptions(&self, service: &str, protocol: &str) -> Option<(String, String)> {
		self.listeners.get(&(service.to_string(), protocol.to_string())).map(|l| (l.service_desc.clone(), l.protocol_desc.clone()))
	}

	/// Dequeues the next incoming top-level stream for `(service, protocol)`
	/// (spec.md §6.4 `server::accept`).
	pub fn accept(&mut self, service: &str, protocol: &str) -> Option<(Eid, StreamId)> {
		let (remote, id) = self.listeners.get_mut(&(service.to_string(), protocol.to_string()))?.accepted.pop_front()?;
		Some((Eid::from(remote), id))
	}

	/// Begins connecting a fresh top-level stream to `remote` for `(service,
	/// protocol)`, optionally seeding its location (spec.md §6.4
	/// `stream::connect_to`). The stream exists immediately and buffers its
	/// negotiation request even if no channel to `remote` exists yet.
	pub fn connect(&mut self, remote: Eid, service: &str, protocol: &str, hint: Option<SocketAddr>, now: Instant) -> Result<StreamId, HostError> {
		if remote.as_bytes() == self.identity.public().as_bytes() {
			return Err(HostError::InvalidKey);
		}

		let peer = self.ensure_peer(remote);

		if let Some(addr) = hint {
			if !peer.locations().iter().any(|l| l.addr == addr) {
				let mut locations = peer.locations().to_vec();
				locations.push(Location { addr });
				peer.set_locations(locations);
			}
		}

		if peer.locations().is_empty() {
			return Err(HostError::NoRoute);
		}

		let Some(id) = peer.open_substream() else {
			warn!("peer has exhausted its local stream ids");
			return Err(HostError::NoRoute);
		};

		if let Some(stream) = peer.streams.get_mut(id) {
			stream.write_record(&encode_request(service, protocol));
		}

		peer.mark_ready(id);
		self.try_connect(remote, now);

		Ok(id)
	}

	fn try_connect(&mut self, remote: Eid, now: Instant) {
		let identity = &self.identity;
		let Some(peer) = self.peers.get_mut(&key(remote)) else { return };

		if let Some((addr, bytes)) = peer.connect_channel(identity, now) {
			self.initiating_to.insert(addr, key(remote));
			self.send(addr, &bytes);
		}
	}

	/// Drains both sockets, dispatching every waiting datagram, then drives every
	/// peer's timers and pending writes. The embedding application's reactor
	/// calls this once per tick (spec.md §5).
	///
	/// Flushing happens before a peer's `ChannelFailed` event is allowed to drop
	/// its `channel_addr` entry: a channel torn down this same tick (a protocol
	/// violation, or a graceful CLOSE) may still have a goodbye RESET queued in
	/// `Peer::drain_outbound`, and it needs somewhere to be sent to.
	pub fn poll(&mut self, now: Instant) {
		self.read_socket(false, now);
		self.read_socket(true, now);

		let remotes: Vec<Eid> = self.peers.values().map(|p| p.remote).collect();

		for remote in &remotes {
			self.try_connect(*remote, now);
		}

		for remote in &remotes {
			let Some(peer) = self.peers.get_mut(&key(*remote)) else { continue };
			peer.on_timer(now);
		}

		for remote in &remotes {
			self.flush_peer(*remote, now);
		}

		for remote in &remotes {
			let Some(peer) = self.peers.get_mut(&key(*remote)) else { continue };

			for event in peer.poll_events() {
				match event {
					PeerEvent::ChannelUp => info!("peer channel up"),
					PeerEvent::ChannelStalled => warn!("peer channel stalled"),
					PeerEvent::ChannelFailed => {
						if let Some(addr) = self.channel_addr.remove(&key(*remote)) {
							self.addr_peer.remove(&addr);
						}
						warn!("peer channel failed");
					}
				}
			}
		}

		self.collect_negotiations();
		self.process_negotiations();
	}

	fn flush_peer(&mut self, remote: Eid, now: Instant) {
		let Some(addr) = self.channel_addr.get(&key(remote)).copied() else { return };
		let Some(peer) = self.peers.get_mut(&key(remote)) else { return };

		for packet in peer.drain_outbound(DRAIN_BUDGET, now) {
			let mut framed = MESSAGE_MAGIC.to_vec();
			framed.extend_from_slice(&packet);
			self.send(addr, &framed);
		}
	}

	fn collect_negotiations(&mut self) {
		for (remote, peer) in self.peers.iter_mut() {
			let root = peer.root;
			let Some(stream) = peer.streams.get_mut(root) else { continue };

			while let Some(id) = stream.received_substreams.pop_front() {
				self.awaiting_negotiation.push((*remote, id));
			}
		}
	}

	fn process_negotiations(&mut self) {
		let mut still_waiting = Vec::new();

		for (remote, id) in self.awaiting_negotiation.drain(..) {
			let Some(peer) = self.peers.get_mut(&remote) else { continue };
			let Some(stream) = peer.streams.get_mut(id) else { continue };

			let Some(record) = stream.read_record(RECV_BUF_LEN) else {
				still_waiting.push((remote, id));
				continue;
			};

			let Some((service, protocol)) = decode_request(&record) else {
				debug!("dropping substream with malformed negotiation request");
				peer.streams.remove(id);
				continue;
			};

			let listener_key = (service, protocol);

			match self.listeners.get_mut(&listener_key) {
				Some(listener) => listener.accepted.push_back((remote, id)),
				None => {
					debug!("no listener for {listener_key:?}, dropping substream");
					if let Some(peer) = self.peers.get_mut(&remote) {
						peer.streams.remove(id);
					}
				}
			}
		}

		self.awaiting_negotiation = still_waiting;
	}

	fn read_socket(&mut self, v6: bool, now: Instant) {
		loop {
			let socket = if v6 { self.v6.as_ref() } else { self.v4.as_ref() };
			let Some(socket) = socket else { return };

			let mut slice = Slice::new(RECV_BUF_LEN);

			match socket.recv_from(&mut slice) {
				Ok((n, src)) => {
					slice.truncate(n);
					self.dispatch(src, slice, now);
				}
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
				Err(err) => {
					warn!("socket read failed: {err}");
					return;
				}
			}
		}
	}

	fn dispatch(&mut self, src: SocketAddr, packet: Slice, now: Instant) {
		if packet.len() < 8 {
			return;
		}

		let magic: [u8; 8] = packet[..8].try_into().expect("checked length above");

		match magic {
			m if m == Hello::MAGIC => self.handle_hello(src, packet),
			m if m == Cookie::MAGIC => self.handle_cookie(src, packet),
			m if m == Initiate::MAGIC => self.handle_initiate(src, packet, now),
			m if m == MESSAGE_MAGIC => self.handle_message(src, packet, now),
			_ => warn!("received datagram with unrecognized magic from {src}"),
		}
	}

	fn handle_hello(&mut self, src: SocketAddr, mut packet: Slice) {
		if packet.len() != size_of::<Hello>() {
			return warn!("Hello from {src} has the wrong size");
		}

		let hello: &mut Hello = cast_mut(&mut packet[..]);
		let i_long_pk = hello.i_long_pk;

		let mut responder = Responder { identity: &self.identity, cookies: &mut self.cookies };

		let cookie = match responder.consume_hello(hello) {
			Ok(cookie) => cookie,
			Err(()) => return warn!("rejected Hello from {src}"),
		};

		let peer = self.ensure_peer(i_long_pk);
		if !peer.locations().iter().any(|l| l.addr == src) {
			let mut locations = peer.locations().to_vec();
			locations.push(Location { addr: src });
			peer.set_locations(locations);
		}

		self.send(src, utils::bytes::as_slice::<u8, _>(&cookie));
	}

	fn handle_cookie(&mut self, src: SocketAddr, mut packet: Slice) {
		if packet.len() != size_of::<Cookie>() {
			return warn!("Cookie from {src} has the wrong size");
		}

		let Some(&remote) = self.initiating_to.get(&src) else {
			return warn!("unexpected Cookie from {src}");
		};

		let cookie: &mut Cookie = cast_mut(&mut packet[..]);
		let identity = &self.identity;
		let Some(peer) = self.peers.get_mut(&remote) else { return };

		match peer.consume_cookie(src, cookie, identity, &[]) {
			Ok(bytes) => {
				self.bind_channel_addr(remote, src);
				self.send(src, &bytes);
			}
			Err(()) => warn!("rejected Cookie from {src}"),
		}
	}

	fn handle_initiate(&mut self, src: SocketAddr, mut packet: Slice, now: Instant) {
		packet.split_bytes(Initiate::MAGIC.len());

		let mut responder = Responder { identity: &self.identity, cookies: &mut self.cookies };

		let (i_long_pk, _metadata, keys) = match responder.consume_initiate(&mut packet, &mut self.replay) {
			Ok(result) => result,
			Err(()) => return warn!("rejected Initiate from {src}"),
		};

		let peer = self.ensure_peer(i_long_pk);
		peer.channel_started(src, keys, now);
		self.bind_channel_addr(key(i_long_pk), src);

		if let Some(peer) = self.peers.get_mut(&key(i_long_pk)) {
			if let Some(bytes) = peer.send_keepalive(now) {
				let mut framed = MESSAGE_MAGIC.to_vec();
				framed.extend_from_slice(&bytes);
				self.send(src, &framed);
			}
		}
	}

	fn handle_message(&mut self, src: SocketAddr, mut packet: Slice, now: Instant) {
		packet.split_bytes(MESSAGE_MAGIC.len());

		let Some(&remote) = self.addr_peer.get(&src) else {
			return warn!("data packet from unrecognized endpoint {src}");
		};

		let Some(peer) = self.peers.get_mut(&remote) else { return };

		let frames = match peer.receive_packet(&mut packet, now) {
			Ok(frames) => frames,
			Err(()) => return warn!("dropping unreadable data packet from {src}"),
		};

		peer.receive_frames(frames, now);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn listen_rejects_duplicate_registration() {
		let mut host = Host::create(Identity::generate(), 0).expect("should bind an ephemeral port");

		assert!(host.listen("echo", "echo service", "raw", "raw bytes").is_ok());
		assert_eq!(host.listen("echo", "echo service", "raw", "raw bytes"), Err(HostError::ListenerExists));
	}

	#[test]
	fn connect_to_self_is_rejected() {
		let mut host = Host::create(Identity::generate(), 0).expect("should bind an ephemeral port");
		let me = host.identity();

		assert_eq!(host.connect(me, "echo", "raw", None, Instant::now()), Err(HostError::InvalidKey));
	}

	#[test]
	fn connect_without_location_or_hint_has_no_route() {
		let mut host = Host::create(Identity::generate(), 0).expect("should bind an ephemeral port");
		let remote = Identity::generate().public();

		assert_eq!(host.connect(remote, "echo", "raw", None, Instant::now()), Err(HostError::NoRoute));
	}

	#[test]
	fn negotiation_request_round_trips() {
		let bytes = encode_request("echo", "raw");
		let (service, protocol) = decode_request(&bytes).expect("should decode");
		assert_eq!(service, "echo");
		assert_eq!(protocol, "raw");
	}

	#[test]
	fn two_hosts_complete_a_handshake_and_exchange_a_stream() {
		let i_identity = Identity::generate();
		let r_identity = Identity::generate();
		let r_public = r_identity.public();

		let mut initiator = Host::create(i_identity, 0).expect("should bind");
		let mut responder = Host::create(r_identity, 0).expect("should bind");

		responder.listen("echo", "echo service", "raw", "raw bytes").expect("should register listener");

		let responder_addr = responder.v4.as_ref().unwrap().local_addr().unwrap();

		let now = Instant::now();
		initiator.connect(r_public, "echo", "raw", Some(responder_addr), now).expect("should begin connecting");

		// Drive both hosts until the handshake and negotiation settle, or give up.
		for _ in 0..50 {
			let now = Instant::now();
			initiator.poll(now);
			responder.poll(now);

			if responder.accept("echo", "raw").is_some() {
				return;
			}

			std::thread::sleep(std::time::Duration::from_millis(5));
		}

		panic!("responder never accepted the incoming stream");
	}
}
