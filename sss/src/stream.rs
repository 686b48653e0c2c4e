//! A single logical stream (spec.md §3, §4.4): per-direction byte sequencing, the
//! read-ahead reorder buffer, the record-boundary queue, and the two-slot
//! attachment state that lets a stream migrate from one channel to a replacement
//! without losing data.
//!
//! Streams here are plain data, held in the owning [`crate::peer::Peer`]'s arena
//! (`slab::Slab<Stream>`) rather than reached through shared pointers — the "cyclic
//! graphs between host, peer, channel, stream" remapping in spec.md §9: attachments
//! name a stream by id and look it up through the arena instead of holding a
//! reference to it directly.

use std::collections::{BTreeMap, VecDeque};

/// A stream's globally unique id: the channel-half that first allocated it, paired
/// with a per-channel-half counter. Stable across channel migration (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Usid(pub u64, pub u64);

/// Key into a [`crate::peer::Peer`]'s stream arena. Never reused for the lifetime of
/// the peer, so a stale id simply fails to resolve rather than resolving to the
/// wrong stream.
pub type StreamId = usize;

/// How a stream answers an inbound substream `init` naming it as parent (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
	/// Refuse every substream open attempt; the peer gets a RESET.
	Reject,
	/// Accept up to a bounded number of not-yet-`accept_substream`'d arrivals before
	/// refusing further opens.
	BufferLimit(u32),
	Unlimited,
	/// Defer to the parent stream's listen mode (the root stream has no parent, so
	/// this is only meaningful on a substream).
	Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Created,
	WaitService,
	Accepting,
	Connected,
	Disconnected,
	/// A RESET frame arrived (or was sent) for this stream: both directions are
	/// dead, buffers are discarded, writes fail (spec.md §4.4's stream-local reset).
	Reset,
}

/// One of a stream's (at most two) transmit-side channel bindings (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAttachState {
	Unused,
	/// Waiting for an ACK whose rx-sequence reaches `init_seq`, the sequence at
	/// which the attaching STREAM frame was sent.
	Attaching { init_seq: u64 },
	Active,
	/// Superseded by a newer attachment (channel migration, spec.md §4.4) but not
	/// yet released — retransmissions may still occur here until the replacement
	/// goes Active.
	Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAttachState {
	Unused,
	Active,
}

/// Which of a stream's two TX/RX attachment slots an operation concerns. Slot 1 is
/// only ever occupied during migration to a replacement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
	Primary = 0,
	Migrating = 1,
}

/// Upper bound, in bytes, on data buffered in the out-of-order read-ahead map before
/// further out-of-order segments are dropped (spec.md §4.4 receive path, step 2).
pub const READAHEAD_BUDGET: usize = 64 * 1024;

/// A byte range not yet contiguous with `rx_byte_seq`, keyed by its starting offset.
struct Readahead {
	data: Vec<u8>,
	record_end: bool,
}

/// One logical stream: a byte-and-record pipe, optionally nested under a parent,
/// with independent TX/RX flow control and up to two simultaneous channel
/// attachments per direction.
pub struct Stream {
	pub usid: Option<Usid>,
	pub parent: Option<Usid>,
	pub state: State,
	pub listen_mode: ListenMode,
	pub priority: u8,

	pub tx_attach: [TxAttachState; 2],
	pub rx_attach: [RxAttachState; 2],

	// --- transmit side ---
	/// Next byte offset to assign to newly written data.
	tx_byte_seq: u64,
	/// Data handed to `write_data`/`write_record` that hasn't been sent yet.
	tx_pending: VecDeque<u8>,
	/// Offsets at which a record boundary falls within `tx_pending` (absolute
	/// `tx_byte_seq` values, i.e. "the byte before this offset ends a record").
	tx_pending_record_ends: VecDeque<u64>,
	/// Sent-but-unacked ranges, by starting offset, kept for retransmission.
	tx_in_flight: BTreeMap<u64, Vec<u8>>,
	/// Cumulative count of bytes in `tx_in_flight`.
	tx_waiting_ack: u64,
	/// High-water mark past which `write_data` starts returning short counts.
	tx_high_water: usize,
	tx_fin_queued: bool,

	// --- receive side ---
	/// Next byte offset expected in order.
	rx_byte_seq: u64,
	delivered: VecDeque<u8>,
	/// Total bytes ever removed from `delivered` via `read_data`/`read_record`.
	consumed: u64,
	readahead: BTreeMap<u64, Readahead>,
	readahead_bytes: usize,
	/// Absolute `rx_byte_seq` values at which a completed record ends, oldest first.
	record_ends: VecDeque<u64>,
	rx_window_exponent: u8,

	pub received_substreams: VecDeque<StreamId>,
	pub children: Vec<Usid>,
}

impl Stream {
	pub fn new(parent: Option<Usid>) -> Self {
		Self {
			usid: None,
			parent,
			state: State::Created,
			listen_mode: ListenMode::Reject,
			priority: 0,

			tx_attach: [TxAttachState::Unused, TxAttachState::Unused],
			rx_attach: [RxAttachState::Unused, RxAttachState::Unused],

			tx_byte_seq: 0,
			tx_pending: VecDeque::new(),
			tx_pending_record_ends: VecDeque::new(),
			tx_in_flight: BTreeMap::new(),
			tx_waiting_ack: 0,
			tx_high_water: 256 * 1024,
			tx_fin_queued: false,

			rx_byte_seq: 0,
			delivered: VecDeque::new(),
			consumed: 0,
			readahead: BTreeMap::new(),
			readahead_bytes: 0,
			record_ends: VecDeque::new(),
			rx_window_exponent: 16, // 64KiB default advertised window

			received_substreams: VecDeque::new(),
			children: Vec::new(),
		}
	}

	pub fn is_attached(&self, slot: Slot) -> bool {
		!matches!(self.tx_attach[slot as usize], TxAttachState::Unused)
	}

	/// Bytes not yet handed to the channel for transmission.
	pub fn has_pending_write(&self) -> bool {
		!self.tx_pending.is_empty() || self.tx_fin_queued
	}

	// ---- write path ----

	/// Appends `data` to the stream's outbound buffer, up to the configured
	/// high-water mark. Returns the number of bytes actually accepted; a short
	/// count (or zero) means the caller should wait for backpressure to clear
	/// (spec.md §5 backpressure).
	pub fn write_data(&mut self, data: &[u8]) -> usize {
		if self.state == State::Reset {
			return 0;
		}

		let buffered = self.tx_pending.len() + self.tx_waiting_ack as usize;
		let room = self.tx_high_water.saturating_sub(buffered);
		let n = data.len().min(room);

		self.tx_pending.extend(data[..n].iter().copied());
		n
	}

	/// Like [`Self::write_data`], but marks the offset immediately after `data` as a
	/// record boundary once it is fully accepted. Returns `false` (writing nothing)
	/// if the whole record didn't fit, rather than splitting a record across a
	/// partial accept.
	pub fn write_record(&mut self, data: &[u8]) -> bool {
		if self.state == State::Reset {
			return false;
		}

		let buffered = self.tx_pending.len() + self.tx_waiting_ack as usize;

		if buffered + data.len() > self.tx_high_water {
			return false;
		}

		self.tx_pending.extend(data.iter().copied());
		let end = self.tx_byte_seq + self.tx_sent_and_pending_len();
		self.tx_pending_record_ends.push_back(end);
		true
	}

	fn tx_sent_and_pending_len(&self) -> u64 {
		self.tx_waiting_ack + self.tx_pending.len() as u64
	}

	pub fn queue_fin(&mut self) {
		self.tx_fin_queued = true;
	}

	/// Pops up to `max_len` bytes of pending data for transmission, returning the
	/// offset they start at, the bytes, whether this chunk's end coincides with a
	/// queued FIN, and whether it completes a record boundary queued by
	/// [`Self::write_record`]. Moves the bytes into `tx_in_flight` for
	/// retransmission.
	pub fn take_tx_chunk(&mut self, max_len: usize) -> Option<(u64, Vec<u8>, bool, bool)> {
		if self.tx_pending.is_empty() {
			if self.tx_fin_queued {
				self.tx_fin_queued = false;
				return Some((self.tx_byte_seq, Vec::new(), true, false));
			}

			return None;
		}

		let n = self.tx_pending.len().min(max_len.max(1));
		let offset = self.tx_byte_seq;
		let chunk: Vec<u8> = self.tx_pending.drain(..n).collect();

		self.tx_byte_seq += n as u64;
		self.tx_waiting_ack += n as u64;
		self.tx_in_flight.insert(offset, chunk.clone());

		let record_end = matches!(self.tx_pending_record_ends.front(), Some(&end) if end <= self.tx_byte_seq);
		if record_end {
			self.tx_pending_record_ends.pop_front();
		}

		let fin = self.tx_pending.is_empty() && self.tx_fin_queued;
		if fin {
			self.tx_fin_queued = false;
		}

		Some((offset, chunk, fin, record_end))
	}

	/// Retires every in-flight range whose offset is fully covered by an ack
	/// reaching `acked_through` (exclusive upper bound on acknowledged bytes).
	/// spec.md §3's invariant that a stream's byte-ack never advances past
	/// `tx_byte_seq` holds because `acked_through` is derived from offsets this
	/// stream itself assigned.
	pub fn ack_through(&mut self, acked_through: u64) {
		let acked_through = acked_through.min(self.tx_byte_seq);

		let keys: Vec<u64> = self
			.tx_in_flight
			.range(..)
			.take_while(|(&offset, data)| offset + data.len() as u64 <= acked_through)
			.map(|(&offset, _)| offset)
			.collect();

		for k in keys {
			if let Some(data) = self.tx_in_flight.remove(&k) {
				self.tx_waiting_ack = self.tx_waiting_ack.saturating_sub(data.len() as u64);
			}
		}
	}

	/// Re-enqueues every in-flight byte range for retransmission, e.g. when the
	/// owning channel surrenders lost frames back to the stream (spec.md §4.2).
	pub fn requeue_lost(&mut self) {
		for (offset, data) in std::mem::take(&mut self.tx_in_flight).into_iter().rev() {
			self.tx_waiting_ack = self.tx_waiting_ack.saturating_sub(data.len() as u64);

			let mut rest: VecDeque<u8> = data.into_iter().collect();
			rest.extend(self.tx_pending.drain(..));
			self.tx_pending = rest;

			let _ = offset;
		}
	}

	pub fn tx_inflight_bytes(&self) -> u64 {
		self.tx_waiting_ack
	}

	/// Applies an inbound RESET: closes the receive side, discards every buffer in
	/// both directions, and makes future writes fail (spec.md §4.4's stream-local
	/// reset: "close receive side, deliver on_reset_notify, discard buffers;
	/// outgoing writes fail with 'stream reset'").
	pub fn mark_reset(&mut self) {
		self.state = State::Reset;

		self.tx_pending.clear();
		self.tx_pending_record_ends.clear();
		self.tx_in_flight.clear();
		self.tx_waiting_ack = 0;
		self.tx_fin_queued = false;

		self.delivered.clear();
		self.readahead.clear();
		self.readahead_bytes = 0;
		self.record_ends.clear();
	}

	pub fn is_reset(&self) -> bool {
		self.state == State::Reset
	}

	// ---- receive path (spec.md §4.4) ----

	/// Accepts one inbound STREAM data frame's payload at absolute `offset`.
	pub fn receive_data(&mut self, offset: u64, data: Vec<u8>, record_end: bool) {
		if data.is_empty() && !record_end {
			return;
		}

		if offset == self.rx_byte_seq {
			self.deliver(data, record_end);
			self.drain_readahead();
		} else if offset > self.rx_byte_seq {
			if self.readahead_bytes + data.len() > READAHEAD_BUDGET {
				return;
			}

			self.readahead.entry(offset).or_insert_with(|| {
				self.readahead_bytes += data.len();
				Readahead { data, record_end }
			});
		}
		// offset < rx_byte_seq: duplicate, drop.
	}

	fn deliver(&mut self, data: Vec<u8>, record_end: bool) {
		self.rx_byte_seq += data.len() as u64;
		self.delivered.extend(data);

		if record_end {
			self.record_ends.push_back(self.rx_byte_seq);
		}
	}

	fn drain_readahead(&mut self) {
		while let Some(entry) = self.readahead.remove(&self.rx_byte_seq) {
			self.readahead_bytes -= entry.data.len();
			self.deliver(entry.data, entry.record_end);
		}
	}

	/// Reads up to `max` bytes of in-order data, ignoring record boundaries.
	pub fn read_data(&mut self, max: usize) -> Vec<u8> {
		let n = self.delivered.len().min(max);
		let out: Vec<u8> = self.delivered.drain(..n).collect();
		self.consumed += n as u64;
		self.retire_records();
		out
	}

	/// Reads the next completed record, or `None` if none has fully arrived yet.
	/// Truncates to `max`; a record longer than `max` can be drained across several
	/// calls (spec.md §4.4's "partial reads of a record are permitted").
	pub fn read_record(&mut self, max: usize) -> Option<Vec<u8>> {
		let end = *self.record_ends.front()?;
		let available = (end - self.consumed) as usize;
		let n = available.min(max);

		let out: Vec<u8> = self.delivered.drain(..n).collect();
		self.consumed += n as u64;
		self.retire_records();

		Some(out)
	}

	fn retire_records(&mut self) {
		while matches!(self.record_ends.front(), Some(&end) if end <= self.consumed) {
			self.record_ends.pop_front();
		}
	}

	pub fn pending_records(&self) -> usize {
		self.record_ends.len()
	}

	pub fn has_pending_records(&self) -> bool {
		self.pending_records() > 0
	}

	pub fn has_pending_read(&self) -> bool {
		!self.delivered.is_empty()
	}

	/// Free space left in the receive buffer, expressed as the 5-bit exponent
	/// STREAM frames advertise in their window byte (spec.md §4.4): recomputed on
	/// every delivery so the advertised window always reflects current headroom.
	pub fn advertised_window_exponent(&mut self) -> u8 {
		let free = READAHEAD_BUDGET.saturating_sub(self.delivered.len() + self.readahead_bytes);
		let exponent = (usize::BITS - free.leading_zeros()).saturating_sub(1).min(31);
		self.rx_window_exponent = exponent as u8;
		self.rx_window_exponent
	}

	pub fn rx_byte_seq(&self) -> u64 {
		self.rx_byte_seq
	}

	pub fn tx_byte_seq(&self) -> u64 {
		self.tx_byte_seq
	}
}
