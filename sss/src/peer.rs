//! The peer coordinator (spec.md §4.6): everything this host tracks about one
//! remote identity — candidate endpoints, outstanding key exchanges, the primary
//! channel, and the substream arena that survives channel migration. Plain,
//! synchronous Rust taking an explicit [`Instant`] wherever time matters, the same
//! split `channel`/`kex`/`stream` already use; only [`crate::host`] wires this to
//! `stakker`'s wall clock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use utils::error::*;

use crate::channel::congestion::Reno;
use crate::channel::{Channel, LinkStatus};
use crate::crypto::armor::{BoxArmor, MTU};
use crate::identity::Eid;
use crate::kex::{Initiator, SessionKeys};
use crate::mux::{self, Multiplexer, StreamTable};
use crate::stream::{ListenMode, Slot, StreamId};
use crate::wire::frame::Frame;

/// Consecutive `Stalled` transitions on the primary channel before the peer gives up
/// waiting and starts a fresh handshake to a candidate location (spec.md §4.6).
pub const STALL_WARNINGS_MAX: u32 = 3;

/// How long a peer waits after its primary channel goes `Down` before retrying a
/// candidate location (spec.md §4.6's one-minute reconnect timer).
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// One (local socket, remote endpoint) pair this peer might reach its remote
/// identity through, in descending preference order as supplied by the embedding
/// application's `LocationHintSource` (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
	pub addr: SocketAddr,
}

/// A channel half not yet confirmed, tracked from the moment `connect_channel`
/// sends its `Hello` until either a `Cookie`/`Initiate` completes it or it times out.
struct PendingInitiation {
	initiator: Initiator,
	location: Location,
	sent_at: Instant,
}

/// Everything delivered to the application about a change in this peer's
/// reachability, polled by [`crate::server::Server`] rather than pushed through a
/// callback (spec.md §7's synchronous/asynchronous split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
	ChannelUp,
	ChannelStalled,
	ChannelFailed,
}

/// One remote identity's full coordinator state (spec.md §4.6): candidate
/// locations, in-flight handshakes, the live channel (if any), and the arena of
/// streams multiplexed over it.
pub struct Peer {
	pub remote: Eid,
	locations: Vec<Location>,
	key_exchanges_initiated: HashMap<SocketAddr, PendingInitiation>,

	channel: Option<Channel>,
	mux: Multiplexer,
	pub streams: StreamTable,
	pub root: StreamId,

	/// Control-frame packets (RESET, DETACH, ...) queued outside the per-stream
	/// ready scheduling, flushed by the next [`Self::drain_outbound`] ahead of any
	/// data. Outlives a torn-down channel just long enough to carry that channel's
	/// own goodbye RESET (see [`Self::reset_channel`]).
	pending_control: Vec<Vec<u8>>,

	stall_warnings: u32,
	down_since: Option<Instant>,
	events: Vec<PeerEvent>,
}

impl Peer {
	pub fn new(remote: Eid, tx_half_id: u64) -> Self {
		let mut streams = StreamTable::new(tx_half_id);
		let root = streams.create_root();

		let mut mux = Multiplexer::new();
		mux.bind_root(root);

		Self {
			remote,
			locations: Vec::new(),
			key_exchanges_initiated: HashMap::new(),
			channel: None,
			mux,
			streams,
			root,
			pending_control: Vec::new(),
			stall_warnings: 0,
			down_since: None,
			events: Vec::new(),
		}
	}

	/// Replaces this peer's ranked candidate locations, e.g. after a
	/// `LocationHintSource` lookup completes (spec.md §4.6).
	pub fn set_locations(&mut self, locations: Vec<Location>) {
		self.locations = locations;
	}

	pub fn locations(&self) -> &[Location] {
		&self.locations
	}

	pub fn has_channel(&self) -> bool {
		self.channel.is_some()
	}

	pub fn link_status(&self) -> Option<LinkStatus> {
		self.channel.as_ref().map(|c| c.link_status)
	}

	/// Drains events accumulated since the last poll (spec.md §7).
	pub fn poll_events(&mut self) -> Vec<PeerEvent> {
		std::mem::take(&mut self.events)
	}

	/// Begins a handshake to the most preferred location not already mid-handshake,
	/// returning the `Hello` bytes to send (spec.md §4.6 `connect_channel`). A no-op
	/// returning `None` if a channel is already up or every location is already
	/// being tried.
	pub fn connect_channel(&mut self, i_long_pk: &crate::identity::Identity, now: Instant) -> Option<(SocketAddr, Vec<u8>)> {
		if self.channel.is_some() {
			return None;
		}

		let location = *self.locations.iter().find(|loc| !self.key_exchanges_initiated.contains_key(&loc.addr))?;

		let initiator = Initiator::new(self.remote);
		let hello = initiator.hello(i_long_pk);

		let mut bytes = crate::wire::kex::Hello::MAGIC.to_vec();
		bytes.extend_from_slice(utils::bytes::as_slice::<u8, _>(&hello));

		self.key_exchanges_initiated.insert(location.addr, PendingInitiation { initiator, location, sent_at: now });

		Some((location.addr, bytes))
	}

	/// Consumes a `Cookie` reply for a pending handshake at `from`, returning the
	/// `Initiate` bytes to send.
	pub fn consume_cookie(
		&mut self,
		from: SocketAddr,
		cookie: &mut crate::wire::kex::Cookie,
		i_identity: &crate::identity::Identity,
		metadata: &[u8],
	) -> Result<Vec<u8>> {
		let pending = self.key_exchanges_initiated.get_mut(&from).ok_or_else(|| warn!("cookie from unexpected address"))?;
		let sent_at = pending.sent_at;

		pending.initiator.consume_cookie(cookie)?;
		let (bytes, keys) = pending.initiator.initiate(i_identity, metadata)?;

		// The channel is considered started the moment Initiate is sent: the
		// initiator already has everything it needs to send and receive data
		// (spec.md §4.5), it just hasn't heard back yet.
		self.channel_started(from, keys, sent_at);

		Ok(bytes)
	}

	/// Called once a channel's session keys are available, from either side of the
	/// handshake (spec.md §4.6 `channel_started`): the initiator once it sends
	/// `Initiate`, the responder once it accepts one.
	pub fn channel_started(&mut self, from: SocketAddr, keys: SessionKeys, _now: Instant) {
		self.key_exchanges_initiated.remove(&from);

		let tx_half_id = rand::random();
		let rx_half_id = rand::random();

		let armor = Box::new(BoxArmor { channel_box: keys.channel_box });
		let channel = Channel::new(tx_half_id, rx_half_id, armor, Box::new(Reno::default()));

		self.channel = Some(channel);
		self.stall_warnings = 0;
		self.down_since = None;
		self.events.push(PeerEvent::ChannelUp);

		info!("channel established with peer");
	}

	/// Encrypts and frames every stream with pending work into as many packets as
	/// needed, up to `budget` packets, returning their wire bytes. Any queued
	/// control frames (a stream RESET, a channel's goodbye RESET) go out first and
	/// count against `budget`, the same priority a retransmit gets over fresh data.
	/// Called once per reactor tick (spec.md §5's cooperative scheduling).
	pub fn drain_outbound(&mut self, budget: usize, now: Instant) -> Vec<Vec<u8>> {
		let mut packets = std::mem::take(&mut self.pending_control);

		let Some(channel) = self.channel.as_mut() else { return packets };

		for _ in packets.len()..budget {
			if !channel.may_transmit(u32::MAX) {
				break;
			}

			let Some(id) = self.mux.pop_ready() else { break };
			let Some(frame) = mux::take_outbound(&mut self.streams, &mut self.mux, id, Slot::Primary, MTU - 64) else { continue };

			packets.push(channel.send_packet(&[frame], now));
		}

		packets
	}

	/// Applies one received, already-decrypted-and-framed packet's frames to this
	/// peer's streams (spec.md §4.4's dispatch loop). A frame the protocol doesn't
	/// allow (unknown LSID, USID collision) is fatal for the owning channel per
	/// spec.md §7: the remaining frames in this packet are abandoned and the
	/// channel is torn down immediately.
	pub fn receive_frames(&mut self, frames: Vec<Frame>, now: Instant) {
		for frame in frames {
			match mux::dispatch_inbound(&mut self.streams, &mut self.mux, frame) {
				// `StreamTable::accept_substream` already pushed this onto its real
				// parent's `received_substreams` queue, not necessarily the channel root.
				mux::Dispatch::Accepted(_) => {}
				mux::Dispatch::Reset => {
					warn!("peer sent a frame the protocol does not allow, resetting channel");
					self.reset_channel(now);
					return;
				}
				mux::Dispatch::ChannelClosed => {
					info!("peer closed the channel");
					self.close_channel(now);
					return;
				}
				mux::Dispatch::Delivered | mux::Dispatch::Detached | mux::Dispatch::StreamReset(_) | mux::Dispatch::Ignored => {}
			}
		}
	}

	/// Tears a single stream down abortively, telling the peer with a RESET frame
	/// first if the stream is still reachable on the live channel (spec.md §4.4
	/// `shutdown(Reset)`).
	pub fn reset_stream(&mut self, id: StreamId, now: Instant) {
		if let Some(lsid) = self.mux.tx_lsid_of(id) {
			if let Some(channel) = self.channel.as_mut() {
				self.pending_control.push(channel.send_packet(&[Frame::Reset { lsid }], now));
			}

			self.mux.release_tx(lsid);
		}

		self.streams.remove(id);
	}

	/// Tears the current channel down as a fatal protocol violation (spec.md §7):
	/// a best-effort goodbye RESET goes out for whoever's still listening, then the
	/// channel itself is dropped, every attachment is cleared so streams detach and
	/// may reattach on a replacement channel, and `ChannelFailed` is raised the
	/// same as any other link-down transition.
	fn reset_channel(&mut self, now: Instant) {
		if let Some(channel) = self.channel.as_mut() {
			self.pending_control.push(channel.send_packet(&[Frame::Reset { lsid: mux::ROOT_LSID }], now));
			channel.force_down();
		}

		self.teardown_channel(now);
	}

	/// Tears the current channel down on a graceful CLOSE from the peer: the same
	/// detach/reattach machinery as [`Self::reset_channel`], minus the goodbye
	/// RESET (the peer already knows).
	fn close_channel(&mut self, now: Instant) {
		if let Some(channel) = self.channel.as_mut() {
			channel.force_down();
		}

		self.teardown_channel(now);
	}

	fn teardown_channel(&mut self, now: Instant) {
		self.channel = None;
		mux::detach_all(&mut self.streams, &mut self.mux, Slot::Primary);

		let root = self.streams.create_root();
		self.mux.bind_root(root);
		self.root = root;

		if self.down_since.is_none() {
			self.down_since = Some(now);
		}

		self.events.push(PeerEvent::ChannelFailed);
	}

	/// Marks `stream` ready to send and gives it the channel's priority-scheduling
	/// slot its `priority` field earns it (spec.md §9 Open Question 2).
	pub fn mark_ready(&mut self, stream: StreamId) {
		if let Some(s) = self.streams.get(stream) {
			self.mux.mark_ready(stream, s.priority);
		}
	}

	pub fn open_substream(&mut self) -> Option<StreamId> {
		let id = self.streams.open_substream(self.root)?;
		self.mark_ready(id);
		Some(id)
	}

	pub fn listen(&mut self, mode: ListenMode) {
		if let Some(root) = self.streams.get_mut(self.root) {
			root.listen_mode = mode;
		}
	}

	/// Called once per reactor tick to age out stalled/expired pending handshakes
	/// and drive the live channel's retransmission timer (spec.md §4.2, §4.6).
	pub fn on_timer(&mut self, now: Instant) {
		self.key_exchanges_initiated.retain(|_, p| now.duration_since(p.sent_at) < RECONNECT_INTERVAL);

		let Some(channel) = self.channel.as_mut() else { return };
		let (resend, expired) = channel.on_retransmit_timer(now);

		for seq in resend {
			debug!("retransmitting packet {seq}");
		}

		if !expired.is_empty() {
			mux::detach_all(&mut self.streams, &mut self.mux, Slot::Primary);

			let root = self.streams.create_root();
			self.mux.bind_root(root);
			self.root = root;
		}

		match channel.link_status {
			LinkStatus::Stalled => {
				self.stall_warnings += 1;

				if self.stall_warnings >= STALL_WARNINGS_MAX {
					self.events.push(PeerEvent::ChannelStalled);
				}
			}
			LinkStatus::Down => {
				if self.down_since.is_none() {
					self.down_since = Some(now);
					self.channel = None;
					self.events.push(PeerEvent::ChannelFailed);
				}
			}
			LinkStatus::Up => self.stall_warnings = 0,
		}
	}

	/// Processes one inbound packet already known to belong to this peer's primary
	/// channel, returning the frames it carried. Authentication failure (spec.md
	/// §7: drop silently, never touch the channel) and a frame that fails to parse
	/// (a protocol violation: fatal for the channel, spec.md §8 scenario 6) both
	/// surface as `Err(())` to the caller, but only the latter tears the channel
	/// down — done here, before returning, since this is the one place both the
	/// channel and `now` are in scope together.
	pub fn receive_packet(&mut self, packet: &mut collections::bytes::Slice, now: Instant) -> Result<Vec<Frame>> {
		let channel = self.channel.as_mut().ok_or_else(|| warn!("received a data packet with no channel established"))?;
		let payload = channel.open_payload(packet, now)?;

		match Frame::decode_all(payload) {
			Ok(frames) => Ok(frames),
			Err(()) => {
				warn!("received an unparseable frame payload, resetting channel");
				self.reset_channel(now);
				Err(())
			}
		}
	}

	/// Builds a bare pure-ACK packet on the primary channel, with no stream frames.
	/// Used to complete a handshake on the responder side (spec.md §4.5's "R sends
	/// the first MESSAGE, channel is now live") and for idle keepalives, the same
	/// role `Wireguard::send_keepalive` plays for the teacher's single tunnel.
	pub fn send_keepalive(&mut self, now: Instant) -> Option<Vec<u8>> {
		Some(self.channel.as_mut()?.send_packet(&[], now))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::Identity;

	#[test]
	fn connect_channel_picks_first_untried_location() {
		let identity = Identity::generate();
		let mut peer = Peer::new(identity.public(), 1);
		peer.set_locations(vec![Location { addr: "127.0.0.1:9660".parse().unwrap() }]);

		let now = Instant::now();
		let (addr, bytes) = peer.connect_channel(&identity, now).expect("should start a handshake");
		assert_eq!(addr.port(), 9660);
		assert!(!bytes.is_empty());

		// A second call before any reply finds every location already tried.
		assert!(peer.connect_channel(&identity, now).is_none());
	}

	#[test]
	fn opening_a_substream_marks_it_ready() {
		let identity = Identity::generate();
		let mut peer = Peer::new(identity.public(), 1);

		let id = peer.open_substream().expect("root should accept a substream");
		assert!(peer.streams.get(id).is_some());
	}

	#[test]
	fn channel_started_clears_pending_handshake_and_emits_event() {
		let i_identity = Identity::generate();
		let r_identity = Identity::generate();
		let mut peer = Peer::new(r_identity.public(), 1);

		let addr: SocketAddr = "127.0.0.1:9660".parse().unwrap();
		peer.set_locations(vec![Location { addr }]);
		peer.connect_channel(&i_identity, Instant::now());

		let a_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let b_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let channel_box = crypto_box::SalsaBox::new(&b_sk.public_key(), &a_sk);

		let keys = SessionKeys {
			channel_box,
			i_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
			r_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
		};

		peer.channel_started(addr, keys, Instant::now());

		assert!(peer.has_channel());
		assert_eq!(peer.poll_events(), vec![PeerEvent::ChannelUp]);
	}

	#[test]
	fn a_frame_naming_an_unknown_lsid_resets_the_channel() {
		// spec.md §7: a protocol violation (here, a STREAM frame for an LSID this
		// peer never attached and that carries no `init`/USID to bind one) is fatal
		// for the channel, not just the one frame.
		let i_identity = Identity::generate();
		let r_identity = Identity::generate();
		let mut peer = Peer::new(r_identity.public(), 1);

		let addr: SocketAddr = "127.0.0.1:9660".parse().unwrap();
		peer.set_locations(vec![Location { addr }]);
		peer.connect_channel(&i_identity, Instant::now());

		let a_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let b_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let channel_box = crypto_box::SalsaBox::new(&b_sk.public_key(), &a_sk);

		let keys = SessionKeys {
			channel_box,
			i_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
			r_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
		};

		let now = Instant::now();
		peer.channel_started(addr, keys, now);
		peer.poll_events();

		assert!(peer.has_channel());

		let bogus = Frame::Stream { lsid: 42, usid: None, parent: None, offset: None, data: b"x".to_vec(), fin: false, no_ack: false, record_end: false };
		peer.receive_frames(vec![bogus], now);

		assert!(!peer.has_channel());
		assert_eq!(peer.link_status(), None);
		assert_eq!(peer.poll_events(), vec![PeerEvent::ChannelFailed]);
	}

	/// Brings up a channel between two fresh identities and returns the peer with
	/// it installed, ready for `drain_outbound`/`receive_frames` in a test.
	fn peer_with_channel() -> Peer {
		let i_identity = Identity::generate();
		let r_identity = Identity::generate();
		let mut peer = Peer::new(r_identity.public(), 1);

		let addr: SocketAddr = "127.0.0.1:9660".parse().unwrap();
		peer.set_locations(vec![Location { addr }]);
		peer.connect_channel(&i_identity, Instant::now());

		let a_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let b_sk = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
		let channel_box = crypto_box::SalsaBox::new(&b_sk.public_key(), &a_sk);

		let keys = SessionKeys {
			channel_box,
			i_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
			r_shortterm_pk: crate::identity::Eid::from(&x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng)),
		};

		peer.channel_started(addr, keys, Instant::now());
		peer.poll_events();
		peer
	}

	#[test]
	fn reset_stream_sends_a_reset_frame_for_an_attached_stream() {
		let mut peer = peer_with_channel();
		let now = Instant::now();

		let id = peer.open_substream().expect("root should accept a substream");
		peer.streams.get_mut(id).unwrap().write_data(b"hello");

		// Attach it on the wire first: reset_stream only has something to tell the
		// peer about once a transmit LSID exists.
		let packets = peer.drain_outbound(8, now);
		assert_eq!(packets.len(), 1);

		peer.reset_stream(id, now);
		assert!(peer.streams.get(id).is_none());

		let pending = peer.drain_outbound(8, now);
		assert_eq!(pending.len(), 1, "the goodbye RESET should be the only thing queued");
	}

	#[test]
	fn reset_stream_on_a_never_attached_stream_sends_nothing() {
		let mut peer = peer_with_channel();
		let now = Instant::now();

		let id = peer.streams.open_substream(peer.root).expect("root should accept a substream");
		peer.reset_stream(id, now);

		assert!(peer.streams.get(id).is_none());
		assert!(peer.drain_outbound(8, now).is_empty());
	}

	#[test]
	fn a_close_frame_tears_the_channel_down_without_a_goodbye_reset() {
		let mut peer = peer_with_channel();
		let now = Instant::now();

		peer.receive_frames(vec![Frame::Close], now);

		assert!(!peer.has_channel());
		assert_eq!(peer.poll_events(), vec![PeerEvent::ChannelFailed]);
		assert!(peer.drain_outbound(8, now).is_empty());
	}
}
