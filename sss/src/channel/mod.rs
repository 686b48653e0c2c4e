//! The channel layer (spec.md §4.2): sequence assignment, ACK generation and
//! consumption, retransmission and loss inference, congestion control, and
//! link-status tracking. One [`Channel`] is exclusively owned by its [`crate::peer`]
//! and maps to one (local socket, remote endpoint) pair — the same responsibility
//! `tunnel::state::Tunnel` has in the teacher, rebuilt here around this protocol's
//! header/frame formats instead of WireGuard's single encrypted-data packet type.

pub mod congestion;

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use collections::bytes::Slice;
use log::debug;
use utils::bytes;
use utils::error::*;

use crate::crypto::armor::{self, ChannelArmor};
use crate::wire::frame::{self, Frame};
use crate::wire::header::{Header, PURE_ACK_CHANNEL};
use congestion::CongestionControl;

/// Initial retransmission backoff (spec.md §4.2).
pub const RETRY_MIN: Duration = Duration::from_millis(500);
/// Ceiling the backoff interval doubles towards.
pub const RETRY_MAX: Duration = Duration::from_secs(60);
/// Hard expiry: a packet still unacked this long after it was sent is given up on
/// regardless of the current backoff interval.
pub const FAIL_MAX: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
	Up,
	Stalled,
	Down,
}

struct InFlight {
	seq: u64,
	is_data: bool,
	sent_at: Instant,
	missed: bool,
}

/// One authenticated session between this host and one peer over one (local
/// socket, remote endpoint) pair.
pub struct Channel {
	pub tx_half_id: u64,
	pub rx_half_id: u64,

	armor: Box<dyn ChannelArmor + Send>,
	congestion: Box<dyn CongestionControl + Send>,

	next_tx_seq: u64,
	highest_ack: u64,
	in_flight: VecDeque<InFlight>,
	retry_interval: Duration,
	next_retry_at: Option<Instant>,

	rx_highest_contiguous: u64,
	rx_out_of_order: BTreeSet<u64>,

	pub link_status: LinkStatus,
	stall_warnings: u32,
}

/// Sequence numbers (and their frames) that the retransmission timer gave up on;
/// the owning peer surrenders these back to their streams for re-enqueueing
/// (spec.md §4.2's "the channel treats them as lost").
pub struct Expired {
	pub seq: u64,
}

impl Channel {
	pub fn new(tx_half_id: u64, rx_half_id: u64, armor: Box<dyn ChannelArmor + Send>, congestion: Box<dyn CongestionControl + Send>) -> Self {
		Self {
			tx_half_id,
			rx_half_id,
			armor,
			congestion,
			next_tx_seq: 1,
			highest_ack: 0,
			in_flight: VecDeque::new(),
			retry_interval: RETRY_MIN,
			next_retry_at: None,
			rx_highest_contiguous: 0,
			rx_out_of_order: BTreeSet::new(),
			link_status: LinkStatus::Up,
			stall_warnings: 0,
		}
	}

	fn ack_count(&self) -> u8 {
		self.rx_highest_contiguous.min(15) as u8
	}

	/// In-flight byte/packet count currently unacknowledged.
	pub fn tx_inflight(&self) -> usize {
		self.in_flight.len()
	}

	/// The sequence number [`Self::send_packet`] most recently assigned. Used by the
	/// owning peer to record the sequence a stream's attaching frame went out on
	/// (spec.md §3: a TX attachment becomes Active once an ACK's rx-sequence reaches
	/// that sequence).
	pub fn last_tx_seq(&self) -> u64 {
		self.next_tx_seq - 1
	}

	/// The highest sequence this channel's peer has acknowledged so far, i.e. how far
	/// our own transmissions have been confirmed received (spec.md §4.2).
	pub fn highest_ack(&self) -> u64 {
		self.highest_ack
	}

	/// Whether the channel may transmit another data packet right now, per
	/// spec.md §8's `tx_inflight <= min(cwnd, peer_advertised_window)` invariant.
	/// `peer_advertised_window` is supplied by the stream layer, which tracks it.
	pub fn may_transmit(&self, peer_advertised_window: u32) -> bool {
		(self.in_flight.len() as u32) < self.congestion.tx_window().min(peer_advertised_window)
	}

	/// Builds one packet's wire bytes: plaintext header, then the encrypted
	/// frames, then the armor's detached tag. Non-data packets (pure ACKs, the
	/// occasional keepalive) aren't added to the retransmission FIFO.
	pub fn send_packet(&mut self, frames: &[Frame], now: Instant) -> Vec<u8> {
		let seq = self.next_tx_seq;
		self.next_tx_seq += 1;

		let is_data = !is_pure_ack(frames);
		let mut payload = frame::encode_all(frames);

		let channel_tag = if is_data { 1 } else { PURE_ACK_CHANNEL };
		let header = Header::new(channel_tag, seq, self.rx_highest_contiguous, self.ack_count());
		let mut out = bytes::as_slice::<u8, _>(&header).to_vec();

		let tag = self.armor.seal(self.tx_half_id, seq, &mut payload);
		out.extend_from_slice(&payload);
		out.extend_from_slice(&tag);

		if is_data {
			self.in_flight.push_back(InFlight { seq, is_data, sent_at: now, missed: false });

			if self.next_retry_at.is_none() {
				self.next_retry_at = Some(now + self.retry_interval);
			}
		}

		out
	}

	/// Decrypts one received packet and updates ACK/retransmission state, but does
	/// not parse its payload into frames. Kept separate from [`Self::receive_packet`]
	/// so a caller can tell an authentication failure (spec.md §7: drop silently,
	/// channel unaffected) apart from a frame that fails to parse (a protocol
	/// violation: fatal for the channel) — both would otherwise come back as the
	/// same `Err(())` from one call.
	pub fn open_payload(&mut self, packet: &mut Slice, now: Instant) -> Result<Slice> {
		let header = *packet.split::<Header>();

		let expected_rx = self.rx_highest_contiguous + 1;
		let seq = Header::extend_sequence(header.seq_low(), expected_rx);
		let ack_seq = Header::extend_sequence(header.ack_seq_low(), self.highest_ack);

		let tag = *packet.rsplit::<[u8; armor::TAG_LEN]>();
		self.armor.open(self.rx_half_id, seq, packet, &tag)?;

		self.record_received(seq);
		self.on_ack(ack_seq, now);

		Ok(packet.clone())
	}

	/// Decrypts and parses one received packet, updating ACK and retransmission
	/// state along the way. Returns the frames the packet carried. A thin
	/// convenience wrapper over [`Self::open_payload`] for callers (tests, mainly)
	/// that don't need to distinguish the two failure modes above.
	pub fn receive_packet(&mut self, packet: &mut Slice, now: Instant) -> Result<Vec<Frame>> {
		let payload = self.open_payload(packet, now)?;
		frame::Frame::decode_all(payload)
	}

	/// Immediately tears the channel down: clears in-flight retransmission state
	/// and declares the link down (spec.md §7's "protocol violation...tear down,
	/// fire `on_link_status_changed(down)`"). The caller is responsible for
	/// detaching streams and sending a RESET frame where one is still reachable.
	pub fn force_down(&mut self) {
		self.in_flight.clear();
		self.next_retry_at = None;
		self.set_link_status(LinkStatus::Down);
	}

	fn record_received(&mut self, seq: u64) {
		if seq == self.rx_highest_contiguous + 1 {
			self.rx_highest_contiguous = seq;

			while self.rx_out_of_order.remove(&(self.rx_highest_contiguous + 1)) {
				self.rx_highest_contiguous += 1;
			}
		} else if seq > self.rx_highest_contiguous {
			self.rx_out_of_order.insert(seq);
		}
	}

	/// Consumes a piggybacked or pure ACK advancing `highest_ack` to `ack_seq`.
	pub fn on_ack(&mut self, ack_seq: u64, now: Instant) {
		if ack_seq <= self.highest_ack {
			return;
		}

		self.highest_ack = ack_seq;

		let before = self.in_flight.len();
		self.in_flight.retain(|p| p.seq > ack_seq);
		let newly_acked = before - self.in_flight.len();

		if newly_acked > 0 {
			self.congestion.update(newly_acked as u32);
			self.retry_interval = RETRY_MIN;
			self.next_retry_at = self.in_flight.front().map(|_| now + self.retry_interval);
			self.set_link_status(LinkStatus::Up);
		}
	}

	/// Called by the owning peer when the retransmission timer fires. Returns the
	/// sequence numbers that should be resent, and the ones that expired outright
	/// (spec.md §4.2's hard `fail_max` cutoff).
	pub fn on_retransmit_timer(&mut self, now: Instant) -> (Vec<u64>, Vec<Expired>) {
		let mut resend = Vec::new();
		let mut expired = Vec::new();

		let Some(oldest) = self.in_flight.front() else {
			self.next_retry_at = None;
			return (resend, expired);
		};

		if now < oldest.sent_at + self.retry_interval {
			return (resend, expired);
		}

		self.congestion.timeout();

		while let Some(front) = self.in_flight.front() {
			if now.duration_since(front.sent_at) >= FAIL_MAX {
				expired.push(Expired { seq: front.seq });
				self.in_flight.pop_front();
				continue;
			}

			break;
		}

		if let Some(front) = self.in_flight.front_mut() {
			if !front.missed {
				front.missed = true;
				self.congestion.missed(front.seq);
			}

			resend.push(front.seq);
			self.set_link_status(LinkStatus::Stalled);
		}

		self.retry_interval = (self.retry_interval * 2).min(RETRY_MAX);
		self.next_retry_at = if self.in_flight.is_empty() { None } else { Some(now + self.retry_interval) };

		if !expired.is_empty() && self.in_flight.is_empty() {
			self.set_link_status(LinkStatus::Down);
		}

		(resend, expired)
	}

	fn set_link_status(&mut self, status: LinkStatus) {
		if self.link_status == status {
			return;
		}

		debug!("channel link status {:?} -> {:?}", self.link_status, status);

		if status == LinkStatus::Stalled {
			self.stall_warnings += 1;
		} else if status == LinkStatus::Up {
			self.stall_warnings = 0;
		}

		self.link_status = status;
	}
}

fn is_pure_ack(frames: &[Frame]) -> bool {
	frames.iter().all(|f| matches!(f, Frame::Ack { .. } | Frame::Empty))
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use collections::bytes::Bytes;
	use crypto_box::{SalsaBox, SecretKey};
	use rand::rngs::OsRng;

	use super::*;
	use crate::channel::congestion::Reno;
	use crate::crypto::armor::BoxArmor;

	fn linked_pair() -> (Channel, Channel) {
		let a_sk = SecretKey::generate(&mut OsRng);
		let b_sk = SecretKey::generate(&mut OsRng);

		let a_box = SalsaBox::new(&b_sk.public_key(), &a_sk);
		let b_box = SalsaBox::new(&a_sk.public_key(), &b_sk);

		let a = Channel::new(1, 2, Box::new(BoxArmor { channel_box: a_box }), Box::new(Reno::default()));
		let b = Channel::new(2, 1, Box::new(BoxArmor { channel_box: b_box }), Box::new(Reno::default()));

		(a, b)
	}

	fn to_slice(bytes: &[u8]) -> Slice {
		let mut slice = Bytes::new(bytes.len()).slice(..);
		slice.copy_from_slice(bytes);
		slice
	}

	#[test]
	fn a_data_packet_round_trips_and_is_acked() {
		let (mut a, mut b) = linked_pair();
		let now = Instant::now();

		let packet = a.send_packet(&[Frame::Stream { lsid: 1, usid: None, parent: None, offset: None, data: b"hi".to_vec(), fin: false, no_ack: false, record_end: false }], now);
		assert_eq!(a.tx_inflight(), 1);

		let frames = b.receive_packet(&mut to_slice(&packet), now).expect("packet should decode");
		assert!(matches!(&frames[0], Frame::Stream { data, .. } if data == b"hi"));

		let ack_packet = b.send_packet(&[Frame::Empty], now);
		a.receive_packet(&mut to_slice(&ack_packet), now).expect("ack should decode");

		assert_eq!(a.tx_inflight(), 0);
		assert_eq!(a.link_status, LinkStatus::Up);
	}

	#[test]
	fn retransmit_timer_marks_stalled_then_down() {
		let (mut a, _b) = linked_pair();
		let start = Instant::now();

		a.send_packet(&[Frame::Stream { lsid: 1, usid: None, parent: None, offset: None, data: b"x".to_vec(), fin: false, no_ack: false, record_end: false }], start);

		let (resend, expired) = a.on_retransmit_timer(start + RETRY_MIN);
		assert_eq!(resend, vec![1]);
		assert!(expired.is_empty());
		assert_eq!(a.link_status, LinkStatus::Stalled);

		let (_, expired) = a.on_retransmit_timer(start + FAIL_MAX + Duration::from_millis(1));
		assert_eq!(expired.len(), 1);
		assert_eq!(a.link_status, LinkStatus::Down);
		assert_eq!(a.tx_inflight(), 0);
	}

	#[test]
	fn tampered_packet_is_rejected_without_disturbing_rx_state() {
		let (mut a, mut b) = linked_pair();
		let now = Instant::now();

		let mut packet = a.send_packet(&[Frame::Stream { lsid: 1, usid: None, parent: None, offset: None, data: b"hi".to_vec(), fin: false, no_ack: false, record_end: false }], now);
		let last = packet.len() - 1;
		packet[last] ^= 1;

		assert!(b.receive_packet(&mut to_slice(&packet), now).is_err());
	}
}
