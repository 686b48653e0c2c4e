//! The stream multiplexer (spec.md §4.4): LSID allocation, the substream tree,
//! priority scheduling, and the glue between [`crate::stream::Stream`]'s pure
//! per-stream state and the wire [`crate::wire::frame::Frame`]s a
//! [`crate::channel::Channel`] actually carries.
//!
//! Streams live in a `slab::Slab` arena (spec.md §9's "model as an arena with
//! stable indices" remapping of the source's cyclic stream/peer/channel graph);
//! attachments and LSID tables name a stream by its arena key rather than holding a
//! reference to it, so a channel tearing down and surrendering frames back to a
//! since-destroyed stream is simply a lookup miss instead of a dangling pointer.

use std::collections::{BinaryHeap, HashMap};

use crate::stream::{ListenMode, RxAttachState, Slot, State, Stream, StreamId, TxAttachState, Usid};
use crate::wire::frame::{Frame, Lsid};

/// LSID 0 is reserved for a channel's root stream on both sides (spec.md §3).
pub const ROOT_LSID: Lsid = 0;

fn lsid_to_key(lsid: Lsid) -> usize {
	lsid as usize
}

/// One channel-direction's worth of LSID bookkeeping: the tables mapping a local
/// stream ID to the stream it names, plus the transmit-side allocator. Embedded in
/// [`crate::peer::Peer`] once per channel the peer owns.
///
/// The transmit table is a `slab::Slab` (spec.md §4.2's "LSID allocation...use the
/// `slab` crate" design note): a transmit LSID is simply the key `slab::Slab::insert`
/// hands back, so allocation, reuse after release, and the `candidate in use` check
/// spec.md's `connect_channel` retry loop wants all fall out of the slab's own
/// freelist instead of a hand-rolled probe. The receive table stays a `HashMap`: its
/// keys are LSIDs the *remote* peer chose, not ones this side allocates, so there's
/// no freelist to share.
pub struct Multiplexer {
	/// LSID 0 is reserved for the root stream and never lives in `tx_lsids`/
	/// `rx_lsids` (a slab can't be told to hand out a specific key), so both
	/// directions of the root binding are tracked here instead.
	root: Option<StreamId>,
	tx_lsids: slab::Slab<StreamId>,
	tx_lsid_of: HashMap<StreamId, Lsid>,
	rx_lsids: HashMap<Lsid, StreamId>,
	/// Streams with data or control pending, ordered by priority (highest first);
	/// ties broken by insertion order via the monotone `seq` counter.
	ready: BinaryHeap<Ready>,
	ready_seq: u64,
}

#[derive(PartialEq, Eq)]
struct Ready {
	priority: u8,
	seq: u64,
	stream: StreamId,
}

impl Ord for Ready {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		// Higher priority first (spec.md §9 open question 2); ties favor the older
		// entry so a stream enqueued earlier isn't starved by one of equal priority
		// enqueued later.
		self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
	}
}

impl PartialOrd for Ready {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Multiplexer {
	pub fn new() -> Self {
		let mut tx_lsids = slab::Slab::new();
		// Permanently occupy key 0 so the slab never hands it out as a transmit
		// LSID: that value is reserved for the root stream binding, tracked
		// separately in `root` since a slab has no way to pin a specific key.
		tx_lsids.insert(StreamId::MAX);

		Self { root: None, tx_lsids, tx_lsid_of: HashMap::new(), rx_lsids: HashMap::new(), ready: BinaryHeap::new(), ready_seq: 0 }
	}

	pub fn tx_stream_for(&self, lsid: Lsid) -> Option<StreamId> {
		if lsid == ROOT_LSID {
			return self.root;
		}

		self.tx_lsids.get(lsid_to_key(lsid)).copied()
	}

	pub fn rx_stream_for(&self, lsid: Lsid) -> Option<StreamId> {
		if lsid == ROOT_LSID {
			return self.root;
		}

		self.rx_lsids.get(&lsid).copied()
	}

	pub fn bind_root(&mut self, stream: StreamId) {
		self.root = Some(stream);
	}

	/// Allocates a fresh transmit LSID for `stream` by inserting it into the slab
	/// and using the returned key as the LSID (widened back down from `usize`).
	/// Returns `None` if the slab has grown past `Lsid::MAX` entries, in which case
	/// the caller must reclaim an LSID (forcibly detaching some other stream) and
	/// retry (spec.md §4.4's LSID exhaustion handling).
	pub fn allocate_tx_lsid(&mut self, stream: StreamId) -> Option<Lsid> {
		let key = self.tx_lsids.insert(stream);
		let lsid = u16::try_from(key).ok()?;
		self.tx_lsid_of.insert(stream, lsid);
		Some(lsid)
	}

	/// The transmit LSID previously allocated to `stream`, if any.
	pub fn tx_lsid_of(&self, stream: StreamId) -> Option<Lsid> {
		if self.root == Some(stream) {
			return Some(ROOT_LSID);
		}

		self.tx_lsid_of.get(&stream).copied()
	}

	pub fn bind_rx(&mut self, lsid: Lsid, stream: StreamId) {
		self.rx_lsids.insert(lsid, stream);
	}

	pub fn release_tx(&mut self, lsid: Lsid) {
		if lsid == ROOT_LSID {
			return;
		}

		let key = lsid_to_key(lsid);
		if let Some(stream) = self.tx_lsids.try_remove(key) {
			self.tx_lsid_of.remove(&stream);
		}
	}

	pub fn release_rx(&mut self, lsid: Lsid) {
		self.rx_lsids.remove(&lsid);
	}

	/// Marks `stream` as having data or control to send. Idempotent: re-enqueuing an
	/// already-ready stream at the same priority is cheap (just another heap entry;
	/// `pop_ready` callers are expected to check `has_pending_write`/control flags
	/// themselves and simply skip a stream found to have nothing left).
	pub fn mark_ready(&mut self, stream: StreamId, priority: u8) {
		self.ready_seq += 1;
		self.ready.push(Ready { priority, seq: self.ready_seq, stream });
	}

	pub fn pop_ready(&mut self) -> Option<StreamId> {
		self.ready.pop().map(|r| r.stream)
	}
}

/// Arena of every stream this peer knows about, plus USID lookup. Owns no channel
/// state itself — [`Multiplexer`] (one per channel direction) holds the LSID tables
/// that point into this arena.
pub struct StreamTable {
	arena: slab::Slab<Stream>,
	by_usid: HashMap<Usid, StreamId>,
	tx_half_id: u64,
	next_usid_counter: u64,
}

impl StreamTable {
	pub fn new(tx_half_id: u64) -> Self {
		Self { arena: slab::Slab::new(), by_usid: HashMap::new(), tx_half_id, next_usid_counter: 0 }
	}

	pub fn get(&self, id: StreamId) -> Option<&Stream> {
		self.arena.get(id)
	}

	pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
		self.arena.get_mut(id)
	}

	pub fn by_usid(&self, usid: Usid) -> Option<StreamId> {
		self.by_usid.get(&usid).copied()
	}

	/// Mints a fresh USID rooted at this table's channel half — stable across
	/// channel migration since the half-id travels with the peer, not the channel
	/// (spec.md §3).
	fn fresh_usid(&mut self) -> Usid {
		let counter = self.next_usid_counter;
		self.next_usid_counter += 1;
		Usid(self.tx_half_id, counter)
	}

	/// Creates the channel's root stream, the one implicitly bound to LSID 0 on
	/// both sides the moment the channel starts (spec.md §4.2 `start`).
	pub fn create_root(&mut self) -> StreamId {
		let mut stream = Stream::new(None);
		let usid = self.fresh_usid();
		stream.usid = Some(usid);
		stream.state = State::Connected;
		stream.listen_mode = ListenMode::Unlimited;

		let id = self.arena.insert(stream);
		self.by_usid.insert(usid, id);
		id
	}

	/// Creates a new locally-initiated substream under `parent`, per spec.md §4.4
	/// step 1. The stream has no USID yet if `parent` is a USID the peer hasn't
	/// itself assigned (always true here, since `open_substream` always assigns a
	/// fresh one up front) — kept simple: USID is minted immediately rather than
	/// deferred to first write, since nothing here depends on deferring it.
	pub fn open_substream(&mut self, parent: StreamId) -> Option<StreamId> {
		let parent_usid = self.arena.get(parent)?.usid?;

		let mut stream = Stream::new(Some(parent_usid));
		let usid = self.fresh_usid();
		stream.usid = Some(usid);
		stream.state = State::Created;

		let id = self.arena.insert(stream);
		self.by_usid.insert(usid, id);

		if let Some(parent_stream) = self.arena.get_mut(parent) {
			parent_stream.children.push(usid);
		}

		Some(id)
	}

	/// Accepts an inbound substream `init` naming `parent` as its parent. Returns
	/// `None` if the parent doesn't exist or its listen mode rejects new opens
	/// (spec.md §4.4's accepting-a-substream algorithm, step 1).
	pub fn accept_substream(&mut self, parent: StreamId, usid: Usid) -> Option<StreamId> {
		let parent_stream = self.arena.get(parent)?;

		if self.effective_listen_mode(parent) == ListenMode::Reject {
			return None;
		}

		let parent_usid = parent_stream.usid?;

		let mut stream = Stream::new(Some(parent_usid));
		stream.usid = Some(usid);
		stream.state = State::Accepting;

		let id = self.arena.insert(stream);
		self.by_usid.insert(usid, id);

		if let Some(parent_stream) = self.arena.get_mut(parent) {
			parent_stream.children.push(usid);
			parent_stream.received_substreams.push_back(id);
		}

		Some(id)
	}

	/// Resolves `Inherit` listen mode by walking up the substream tree to the
	/// nearest ancestor with a concrete mode. The root stream is never `Inherit`.
	pub fn effective_listen_mode(&self, id: StreamId) -> ListenMode {
		let mut current = id;

		loop {
			let Some(stream) = self.arena.get(current) else { return ListenMode::Reject };

			match stream.listen_mode {
				ListenMode::Inherit => match stream.parent.and_then(|p| self.by_usid(p)) {
					Some(parent) => current = parent,
					None => return ListenMode::Reject,
				},
				mode => return mode,
			}
		}
	}

	pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
		let stream = self.arena.try_remove(id)?;

		if let Some(usid) = stream.usid {
			self.by_usid.remove(&usid);
		}

		Some(stream)
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = (StreamId, &mut Stream)> {
		self.arena.iter_mut()
	}
}

/// Applies one inbound [`Frame`] to `table`/`mux`, which together stand in for one
/// channel's receive side. Returns the set of newly-accepted substream ids (for the
/// caller to fire `on_new_substream` on) and whether the channel should be reset
/// (a protocol violation per spec.md §7 — unknown LSID on a non-init frame, or a
/// USID collision).
pub enum Dispatch {
	Accepted(StreamId),
	Delivered,
	/// A STREAM frame broke the protocol (unknown LSID, USID collision): fatal for
	/// the whole channel.
	Reset,
	/// A RESET frame named one stream; that stream alone is torn down.
	StreamReset(StreamId),
	/// A DETACH frame named one stream; its rx attachment on this channel is
	/// released but the stream itself survives (it may reattach on a replacement
	/// channel, spec.md §4.4 migration).
	Detached,
	/// A CLOSE frame: the peer is giving up the whole channel gracefully.
	ChannelClosed,
	Ignored,
}

pub fn dispatch_inbound(table: &mut StreamTable, mux: &mut Multiplexer, frame: Frame) -> Dispatch {
	match frame {
		Frame::Stream { lsid, usid, parent, offset, data, fin, record_end, .. } => {
			let existing = mux.rx_stream_for(lsid);

			let target = match (existing, usid) {
				(Some(id), _) => id,

				(None, Some((half, counter))) => {
					// An `init` frame names its parent by LSID on this same channel
					// (spec.md §4.4 step 2's parent-LSID); `None` only for the root
					// stream's own implicit binding, which has no parent to name.
					let Some(parent) = mux.rx_stream_for(parent.unwrap_or(ROOT_LSID)) else { return Dispatch::Ignored };

					let usid = Usid(half, counter);

					if table.by_usid(usid).is_some() {
						return Dispatch::Reset; // USID collision: protocol violation.
					}

					let Some(id) = table.accept_substream(parent, usid) else { return Dispatch::Reset };

					mux.bind_rx(lsid, id);
					return Dispatch::Accepted(id);
				}

				(None, None) => return Dispatch::Reset, // Unknown LSID, not an init: protocol violation.
			};

			let Some(stream) = table.get_mut(target) else { return Dispatch::Ignored };

			let offset = offset.unwrap_or_else(|| stream.rx_byte_seq());

			if !data.is_empty() || record_end {
				stream.receive_data(offset, data, record_end);
			}

			if fin {
				stream.state = State::Disconnected;
			}

			Dispatch::Delivered
		}

		Frame::Reset { lsid } => {
			let Some(id) = mux.rx_stream_for(lsid) else { return Dispatch::Ignored };

			if let Some(stream) = table.get_mut(id) {
				stream.mark_reset();
			}

			mux.release_rx(lsid);
			Dispatch::StreamReset(id)
		}

		Frame::Detach { lsid } => {
			let Some(id) = mux.rx_stream_for(lsid) else { return Dispatch::Ignored };

			if let Some(stream) = table.get_mut(id) {
				stream.rx_attach[Slot::Primary as usize] = RxAttachState::Unused;
			}

			mux.release_rx(lsid);
			Dispatch::Detached
		}

		Frame::Close => Dispatch::ChannelClosed,

		Frame::Ack { .. } | Frame::Padding { .. } | Frame::Decongestion | Frame::Settings { .. } | Frame::Priority { .. } | Frame::Empty => {
			Dispatch::Ignored
		}
	}
}

/// Builds the outbound [`Frame`] for a stream's next chunk of pending data, or its
/// initial `init` attachment frame if it isn't yet attached on this channel. `mtu`
/// bounds the frame's data payload.
pub fn take_outbound(table: &mut StreamTable, mux: &mut Multiplexer, id: StreamId, slot: Slot, mtu: usize) -> Option<Frame> {
	let stream = table.get_mut(id)?;

	let lsid = match mux.tx_lsid_of(id) {
		Some(l) => l,
		None => mux.allocate_tx_lsid(id)?,
	};

	let needs_init = matches!(stream.tx_attach[slot as usize], TxAttachState::Unused);
	let usid = stream.usid;
	let parent_usid = stream.parent;
	let (offset, data, fin, record_end) = stream.take_tx_chunk(mtu)?;

	if needs_init {
		stream.tx_attach[slot as usize] = TxAttachState::Attaching { init_seq: 0 };
	}

	// The parent-LSID is only meaningful on the frame that also carries the USID
	// (spec.md §4.4 step 2); a parent with no tx LSID of its own yet (it hasn't
	// been attached on this channel either) simply can't be named, so this attach
	// degrades to an unparented one rather than blocking on the parent's attach.
	let parent =
		if needs_init { parent_usid.and_then(|p| table.by_usid(p)).and_then(|pid| mux.tx_lsid_of(pid)) } else { None };

	Some(Frame::Stream {
		lsid,
		usid: needs_init.then_some(usid.map(|Usid(h, c)| (h, c))).flatten(),
		parent,
		offset: Some(offset),
		data,
		fin,
		no_ack: false,
		record_end,
	})
}

/// Records the sequence number at which `id`'s attaching frame was sent, so a later
/// ACK can mark the attachment Active once it's been acknowledged.
pub fn note_attach_sent(table: &mut StreamTable, id: StreamId, slot: Slot, seq: u64) {
	if let Some(stream) = table.get_mut(id) {
		if let TxAttachState::Attaching { .. } = stream.tx_attach[slot as usize] {
			stream.tx_attach[slot as usize] = TxAttachState::Attaching { init_seq: seq };
		}
	}
}

/// Called when an ACK's reconstructed rx-sequence reaches or exceeds the sequence an
/// attachment was sent at (spec.md §3's attachment-Active rule).
pub fn advance_attachments(table: &mut StreamTable, acked_through: u64) {
	for (_, stream) in table.iter_mut() {
		for attach in stream.tx_attach.iter_mut() {
			if let TxAttachState::Attaching { init_seq } = *attach {
				if init_seq <= acked_through {
					*attach = TxAttachState::Active;
				}
			}
		}
	}
}

/// A channel going down clears every attachment it held and hands lost data back to
/// the congestion-control-facing stream buffers for re-enqueueing on the next
/// channel (spec.md §4.2 `stop`, §4.4 migration).
pub fn detach_all(table: &mut StreamTable, mux: &mut Multiplexer, slot: Slot) {
	for (_, stream) in table.iter_mut() {
		if stream.is_attached(slot) {
			stream.tx_attach[slot as usize] = TxAttachState::Unused;
			stream.rx_attach[slot as usize] = RxAttachState::Unused;
			stream.requeue_lost();
		}
	}

	mux.root = None;
	mux.tx_lsids.clear();
	mux.tx_lsids.insert(StreamId::MAX); // re-reserve key 0 for the root binding.
	mux.tx_lsid_of.clear();
	mux.rx_lsids.clear();
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table_with_root() -> (StreamTable, StreamId) {
		let mut table = StreamTable::new(1);
		let root = table.create_root();
		(table, root)
	}

	#[test]
	fn opening_a_substream_links_parent_and_child() {
		let (mut table, root) = table_with_root();
		let child = table.open_substream(root).expect("root should accept a substream");

		let child_usid = table.get(child).unwrap().usid.unwrap();
		assert_eq!(table.get(root).unwrap().children, vec![child_usid]);
		assert_eq!(table.get(child).unwrap().parent, table.get(root).unwrap().usid);
	}

	#[test]
	fn usids_assigned_to_distinct_streams_never_collide() {
		let (mut table, root) = table_with_root();
		let a = table.open_substream(root).unwrap();
		let b = table.open_substream(root).unwrap();

		assert_ne!(table.get(a).unwrap().usid, table.get(b).unwrap().usid);
	}

	#[test]
	fn accept_substream_respects_reject_listen_mode() {
		let (mut table, root) = table_with_root();
		table.get_mut(root).unwrap().listen_mode = ListenMode::Reject;

		assert!(table.accept_substream(root, Usid(99, 1)).is_none());
	}

	#[test]
	fn accept_substream_queues_on_parent() {
		let (mut table, root) = table_with_root();
		table.get_mut(root).unwrap().listen_mode = ListenMode::Unlimited;

		let child = table.accept_substream(root, Usid(7, 1)).expect("should accept");
		assert_eq!(table.get(root).unwrap().received_substreams.front(), Some(&child));
	}

	#[test]
	fn inherit_listen_mode_resolves_to_nearest_concrete_ancestor() {
		let (mut table, root) = table_with_root();
		table.get_mut(root).unwrap().listen_mode = ListenMode::BufferLimit(4);

		let child = table.open_substream(root).unwrap();
		table.get_mut(child).unwrap().listen_mode = ListenMode::Inherit;

		assert_eq!(table.effective_listen_mode(child), ListenMode::BufferLimit(4));
	}

	#[test]
	fn priority_queue_pops_highest_priority_first() {
		let mut mux = Multiplexer::new();
		mux.mark_ready(StreamId::from(1usize), 1);
		mux.mark_ready(StreamId::from(2usize), 5);
		mux.mark_ready(StreamId::from(3usize), 3);

		assert_eq!(mux.pop_ready(), Some(2));
		assert_eq!(mux.pop_ready(), Some(3));
		assert_eq!(mux.pop_ready(), Some(1));
	}

	#[test]
	fn equal_priority_breaks_ties_in_insertion_order() {
		let mut mux = Multiplexer::new();
		mux.mark_ready(StreamId::from(1usize), 2);
		mux.mark_ready(StreamId::from(2usize), 2);

		assert_eq!(mux.pop_ready(), Some(1));
		assert_eq!(mux.pop_ready(), Some(2));
	}

	#[test]
	fn lsid_allocation_skips_in_use_ids() {
		let mut mux = Multiplexer::new();
		let a = mux.allocate_tx_lsid(StreamId::from(1usize)).unwrap();
		let b = mux.allocate_tx_lsid(StreamId::from(2usize)).unwrap();
		assert_ne!(a, b);
		assert_ne!(a, ROOT_LSID);
	}

	#[test]
	fn reset_frame_marks_the_named_stream_and_releases_its_rx_lsid() {
		let (mut table, root) = table_with_root();
		table.get_mut(root).unwrap().listen_mode = ListenMode::Unlimited;

		let mut mux = Multiplexer::new();
		mux.bind_root(root);

		let init = Frame::Stream { lsid: 5, usid: Some((9, 1)), parent: Some(ROOT_LSID), offset: Some(0), data: b"hi".to_vec(), fin: false, no_ack: false, record_end: false };
		let child = match dispatch_inbound(&mut table, &mut mux, init) {
			Dispatch::Accepted(id) => id,
			_ => panic!("expected Accepted"),
		};

		let reset = Frame::Reset { lsid: 5 };
		match dispatch_inbound(&mut table, &mut mux, reset) {
			Dispatch::StreamReset(id) => assert_eq!(id, child),
			_ => panic!("expected StreamReset"),
		}

		assert!(table.get(child).unwrap().is_reset());
		assert!(mux.rx_stream_for(5).is_none());
	}

	#[test]
	fn detach_frame_clears_rx_attachment_without_destroying_the_stream() {
		let (mut table, root) = table_with_root();
		table.get_mut(root).unwrap().listen_mode = ListenMode::Unlimited;

		let mut mux = Multiplexer::new();
		mux.bind_root(root);

		let init = Frame::Stream { lsid: 5, usid: Some((9, 1)), parent: Some(ROOT_LSID), offset: Some(0), data: Vec::new(), fin: false, no_ack: false, record_end: false };
		let child = match dispatch_inbound(&mut table, &mut mux, init) {
			Dispatch::Accepted(id) => id,
			_ => panic!("expected Accepted"),
		};
		table.get_mut(child).unwrap().rx_attach[Slot::Primary as usize] = RxAttachState::Active;

		match dispatch_inbound(&mut table, &mut mux, Frame::Detach { lsid: 5 }) {
			Dispatch::Detached => {}
			_ => panic!("expected Detached"),
		}

		assert!(!table.get(child).unwrap().is_reset());
		assert_eq!(table.get(child).unwrap().rx_attach[Slot::Primary as usize], RxAttachState::Unused);
		assert!(mux.rx_stream_for(5).is_none());
	}

	#[test]
	fn close_frame_surfaces_as_channel_closed() {
		let (mut table, root) = table_with_root();
		let mut mux = Multiplexer::new();
		mux.bind_root(root);

		assert!(matches!(dispatch_inbound(&mut table, &mut mux, Frame::Close), Dispatch::ChannelClosed));
	}
}
