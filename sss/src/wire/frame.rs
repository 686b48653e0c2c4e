//! The frames multiplexed inside a single packet's encrypted payload (spec.md §6.2).
//!
//! A packet's payload is a sequence of frames packed back to back until the packet
//! reaches the path MTU (spec.md §4.1, 1280 bytes). Every frame opens with a one-byte
//! tag; for `STREAM` that tag doubles as a flags byte (no separate flags field), the
//! same trick `net::tcp`'s `Control` bitfield plays with the TCP header's data-offset
//! nibble.
//!
//! Open decision — `record_end` needed a bit and spec.md §6.2's flag layout has none
//! spare (its 3-bit `off-width` already spans all 8 offset width classes, using every
//! remaining bit). Since spec.md §1's non-goals explicitly drop wire compatibility
//! with any existing transport, `off_width` is narrowed here to 2 bits covering the
//! widths this implementation actually emits (0, 2, 4, 8 bytes — enough for any u64
//! offset without the finer-grained classes spec.md's byte-exact layout reserves for
//! them), freeing the bit `record_end` needed. Recorded in DESIGN.md.

use bilge::prelude::*;
use collections::bytes::Slice;
use utils::error::*;

pub type Lsid = u16;

#[bitsize(8)]
#[derive(FromBits, Clone, Copy)]
pub struct StreamFlags {
	/// Width class of the `offset` field: 0 = absent (offset continues from the last
	/// frame on this LSID), 1 = 2 bytes, 2 = 4 bytes, 3 = 8 bytes.
	pub off_width: u2,
	pub usid_present: bool,
	pub data_present: bool,
	pub fin: bool,
	pub no_ack: bool,
	/// This frame's data ends a record (spec.md §4.4's record-end marker).
	pub record_end: bool,
	/// Always set to 1. Lets a receiver tell a STREAM flags byte apart from a plain
	/// frame tag, all of which stay below 0x80.
	marker: u1,
}

const TAG_EMPTY: u8 = 0;
/// High bit of the tag byte: set only on a STREAM frame, whose remaining 7 bits are
/// `StreamFlags` rather than a plain tag value.
const TAG_STREAM: u8 = 0x80;
const TAG_ACK: u8 = 2;
const TAG_PADDING: u8 = 3;
const TAG_DECONGESTION: u8 = 4;
const TAG_DETACH: u8 = 5;
const TAG_RESET: u8 = 6;
const TAG_CLOSE: u8 = 7;
const TAG_SETTINGS: u8 = 8;
const TAG_PRIORITY: u8 = 9;

/// A contiguous run of missing sequence numbers between two received ranges,
/// reported so the sender knows what to retransmit beyond the cumulative ACK
/// already piggybacked in the packet header (spec.md §6.1, §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckRange {
	pub gap: u16,
	pub len: u16,
}

#[derive(Debug)]
pub enum Frame {
	/// Carries no information; used to pad a pure keepalive or to round a packet up
	/// to a minimum size.
	Empty,
	Stream {
		lsid: Lsid,
		/// Present only on the first frame referencing a newly attached stream.
		usid: Option<(u64, u64)>,
		/// The parent's LSID on this channel, present exactly when `usid` is
		/// (spec.md §4.4 step 2: an init frame names `parent-LSID`). `None` for
		/// the root stream's own init, which has no parent.
		parent: Option<Lsid>,
		/// `None` means "continue from the last frame written on this LSID".
		offset: Option<u64>,
		data: Vec<u8>,
		fin: bool,
		no_ack: bool,
		/// This frame's data completes a record (spec.md §4.4).
		record_end: bool,
	},
	Ack {
		ranges: Vec<AckRange>,
	},
	Padding {
		len: u16,
	},
	/// Requests the peer stop sending on this channel direction momentarily
	/// (spec.md §4.3 decongestion signal).
	Decongestion,
	Detach {
		lsid: Lsid,
	},
	Reset {
		lsid: Lsid,
	},
	Close,
	Settings {
		receive_window_exponent: u8,
	},
	Priority {
		lsid: Lsid,
		priority: u8,
	},
}

fn offset_width(offset: u64) -> (u8, usize) {
	match offset {
		0 => (0, 0),
		o if o <= u16::MAX as u64 => (1, 2),
		o if o <= u32::MAX as u64 => (2, 4),
		_ => (3, 8),
	}
}

impl Frame {
	/// Appends this frame's wire encoding onto `out`.
	pub fn encode(&self, out: &mut Vec<u8>) {
		match self {
			Frame::Empty => out.push(TAG_EMPTY),

			Frame::Stream { lsid, usid, parent, offset, data, fin, no_ack, record_end } => {
				let (width_class, width_bytes) = offset.map(offset_width).unwrap_or((0, 0));

				let flags =
					StreamFlags::new(u2::new(width_class), usid.is_some(), !data.is_empty(), *fin, *no_ack, *record_end, u1::new(1));

				out.push(u8::from(flags));
				out.extend_from_slice(&lsid.to_le_bytes());

				if let Some((half, counter)) = usid {
					out.extend_from_slice(&half.to_le_bytes());
					out.extend_from_slice(&counter.to_le_bytes());
					out.extend_from_slice(&parent.unwrap_or(0).to_le_bytes());
				}

				if let Some(offset) = offset {
					out.extend_from_slice(&offset.to_le_bytes()[..width_bytes]);
				}

				if !data.is_empty() {
					out.extend_from_slice(&(data.len() as u16).to_le_bytes());
					out.extend_from_slice(data);
				}
			}

			Frame::Ack { ranges } => {
				out.push(TAG_ACK);
				out.extend_from_slice(&(ranges.len() as u16).to_le_bytes());

				for range in ranges {
					out.extend_from_slice(&range.gap.to_le_bytes());
					out.extend_from_slice(&range.len.to_le_bytes());
				}
			}

			Frame::Padding { len } => {
				out.push(TAG_PADDING);
				out.extend_from_slice(&len.to_le_bytes());
				out.resize(out.len() + *len as usize, 0);
			}

			Frame::Decongestion => out.push(TAG_DECONGESTION),

			Frame::Detach { lsid } => {
				out.push(TAG_DETACH);
				out.extend_from_slice(&lsid.to_le_bytes());
			}

			Frame::Reset { lsid } => {
				out.push(TAG_RESET);
				out.extend_from_slice(&lsid.to_le_bytes());
			}

			Frame::Close => out.push(TAG_CLOSE),

			Frame::Settings { receive_window_exponent } => {
				out.push(TAG_SETTINGS);
				out.push(*receive_window_exponent);
			}

			Frame::Priority { lsid, priority } => {
				out.push(TAG_PRIORITY);
				out.extend_from_slice(&lsid.to_le_bytes());
				out.push(*priority);
			}
		}
	}

	/// Decodes one frame from the front of `buf`, advancing past it. Every length
	/// implied by the wire bytes is checked against what's actually left in `buf`
	/// before being acted on: a malformed or hostile frame (spec.md §8 scenario 6,
	/// a `data-length` claiming more than the packet holds) is a protocol violation
	/// the caller resets the channel over, not a panic (`Slice::split*` asserts on
	/// out-of-bounds access, so this function must never call them with an unchecked
	/// length drawn from the wire).
	pub fn decode(buf: &mut Slice) -> Result<Self> {
		fn need(buf: &Slice, n: usize) -> Result<()> {
			if buf.len() < n {
				return Err(warn!("frame truncated: needed {n} bytes, {} left", buf.len()));
			}
			Ok(())
		}

		if buf.is_empty() {
			return Err(warn!("frame buffer exhausted"));
		}

		let tag = *buf.split::<u8>();

		if tag & TAG_STREAM != 0 {
			let flags = StreamFlags::from(tag);

			need(buf, 2)?;
			let lsid = u16::from_le_bytes(*buf.split::<[u8; 2]>());

			let (usid, parent) = if flags.usid_present() {
				need(buf, 18)?;
				let half = u64::from_le_bytes(*buf.split::<[u8; 8]>());
				let counter = u64::from_le_bytes(*buf.split::<[u8; 8]>());
				let parent = u16::from_le_bytes(*buf.split::<[u8; 2]>());
				(Some((half, counter)), Some(parent))
			} else {
				(None, None)
			};

			let offset = match flags.off_width().value() {
				0 => None,
				1 => {
					need(buf, 2)?;
					Some(u16::from_le_bytes(*buf.split::<[u8; 2]>()) as u64)
				}
				2 => {
					need(buf, 4)?;
					Some(u32::from_le_bytes(*buf.split::<[u8; 4]>()) as u64)
				}
				3 => {
					need(buf, 8)?;
					Some(u64::from_le_bytes(*buf.split::<[u8; 8]>()))
				}
				_ => return Err(warn!("invalid stream frame offset width")),
			};

			let data = if flags.data_present() {
				need(buf, 2)?;
				let len = u16::from_le_bytes(*buf.split::<[u8; 2]>()) as usize;
				need(buf, len)?;
				buf.split_bytes(len).to_vec()
			} else {
				Vec::new()
			};

			return Ok(Frame::Stream { lsid, usid, parent, offset, data, fin: flags.fin(), no_ack: flags.no_ack(), record_end: flags.record_end() });
		}

		match tag {
			TAG_EMPTY => Ok(Frame::Empty),

			TAG_ACK => {
				need(buf, 2)?;
				let count = u16::from_le_bytes(*buf.split::<[u8; 2]>()) as usize;
				need(buf, count * 4)?;
				let mut ranges = Vec::with_capacity(count);

				for _ in 0..count {
					let gap = u16::from_le_bytes(*buf.split::<[u8; 2]>());
					let len = u16::from_le_bytes(*buf.split::<[u8; 2]>());
					ranges.push(AckRange { gap, len });
				}

				Ok(Frame::Ack { ranges })
			}

			TAG_PADDING => {
				need(buf, 2)?;
				let len = u16::from_le_bytes(*buf.split::<[u8; 2]>());
				need(buf, len as usize)?;
				buf.split_bytes(len as usize);
				Ok(Frame::Padding { len })
			}

			TAG_DECONGESTION => Ok(Frame::Decongestion),

			TAG_DETACH => {
				need(buf, 2)?;
				Ok(Frame::Detach { lsid: u16::from_le_bytes(*buf.split::<[u8; 2]>()) })
			}

			TAG_RESET => {
				need(buf, 2)?;
				Ok(Frame::Reset { lsid: u16::from_le_bytes(*buf.split::<[u8; 2]>()) })
			}

			TAG_CLOSE => Ok(Frame::Close),

			TAG_SETTINGS => {
				need(buf, 1)?;
				Ok(Frame::Settings { receive_window_exponent: *buf.split::<u8>() })
			}

			TAG_PRIORITY => {
				need(buf, 3)?;
				let lsid = u16::from_le_bytes(*buf.split::<[u8; 2]>());
				let priority = *buf.split::<u8>();
				Ok(Frame::Priority { lsid, priority })
			}

			_ => Err(warn!("unrecognized frame tag {tag}")),
		}
	}

	/// Decodes every frame packed into `buf` until it is empty.
	pub fn decode_all(mut buf: Slice) -> Result<Vec<Self>> {
		let mut frames = Vec::new();

		while !buf.is_empty() {
			frames.push(Self::decode(&mut buf)?);
		}

		Ok(frames)
	}
}

/// Packs `frames` into a fresh buffer, for handing to the channel layer to seal.
pub fn encode_all(frames: &[Frame]) -> Vec<u8> {
	let mut out = Vec::new();

	for frame in frames {
		frame.encode(&mut out);
	}

	out
}

#[cfg(test)]
mod tests {
	use collections::bytes::Bytes;

	use super::*;

	fn to_slice(bytes: &[u8]) -> Slice {
		let mut slice = Bytes::new(bytes.len()).slice(..);
		slice.copy_from_slice(bytes);
		slice
	}

	#[test]
	fn stream_frame_round_trips_with_offset_and_usid() {
		let frame = Frame::Stream {
			lsid: 7,
			usid: Some((1, 2)),
			parent: Some(0),
			offset: Some(4096),
			data: b"hello stream".to_vec(),
			fin: false,
			no_ack: false,
			record_end: true,
		};

		let mut out = Vec::new();
		frame.encode(&mut out);

		let decoded = Frame::decode(&mut to_slice(&out)).unwrap();
		match decoded {
			Frame::Stream { lsid, usid, parent, offset, data, fin, no_ack, record_end } => {
				assert_eq!(lsid, 7);
				assert_eq!(usid, Some((1, 2)));
				assert_eq!(parent, Some(0));
				assert_eq!(offset, Some(4096));
				assert_eq!(data, b"hello stream");
				assert!(!fin);
				assert!(!no_ack);
				assert!(record_end);
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn stream_frame_without_offset_or_data_round_trips() {
		let frame =
			Frame::Stream { lsid: 3, usid: None, parent: None, offset: None, data: Vec::new(), fin: true, no_ack: true, record_end: false };

		let mut out = Vec::new();
		frame.encode(&mut out);
		assert_eq!(out.len(), 3); // flags byte + lsid

		let decoded = Frame::decode(&mut to_slice(&out)).unwrap();
		match decoded {
			Frame::Stream { offset, data, fin, no_ack, .. } => {
				assert_eq!(offset, None);
				assert!(data.is_empty());
				assert!(fin);
				assert!(no_ack);
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn ack_frame_round_trips() {
		let frame = Frame::Ack { ranges: vec![AckRange { gap: 3, len: 1 }, AckRange { gap: 10, len: 5 }] };

		let mut out = Vec::new();
		frame.encode(&mut out);

		let decoded = Frame::decode(&mut to_slice(&out)).unwrap();
		match decoded {
			Frame::Ack { ranges } => assert_eq!(ranges, vec![AckRange { gap: 3, len: 1 }, AckRange { gap: 10, len: 5 }]),
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn multiple_frames_share_one_packet() {
		let frames = vec![
			Frame::Priority { lsid: 1, priority: 9 },
			Frame::Stream { lsid: 1, usid: None, parent: None, offset: None, data: b"abc".to_vec(), fin: false, no_ack: false, record_end: false },
			Frame::Close,
		];

		let bytes = encode_all(&frames);
		let decoded = Frame::decode_all(to_slice(&bytes)).unwrap();

		assert_eq!(decoded.len(), 3);
		assert!(matches!(decoded[0], Frame::Priority { lsid: 1, priority: 9 }));
		assert!(matches!(decoded[2], Frame::Close));
	}

	#[test]
	fn decode_rejects_unrecognized_tag() {
		assert!(Frame::decode(&mut to_slice(&[0xfe])).is_err());
	}

	#[test]
	fn decode_rejects_a_data_length_longer_than_the_remaining_buffer() {
		// spec.md §8 scenario 6: a STREAM frame claims 0xFFFF bytes of data but the
		// packet only has a few left. This must be a clean `Err`, not a panic.
		let flags = StreamFlags::new(u2::new(0), false, true, false, false, false, u1::new(1));

		let mut bytes = vec![u8::from(flags)];
		bytes.extend_from_slice(&7u16.to_le_bytes()); // lsid
		bytes.extend_from_slice(&0xFFFFu16.to_le_bytes()); // data-length, way too large
		bytes.extend_from_slice(b"short"); // far fewer bytes actually present

		assert!(Frame::decode(&mut to_slice(&bytes)).is_err());
	}

	#[test]
	fn decode_rejects_a_stream_frame_truncated_before_its_lsid() {
		let flags = StreamFlags::new(u2::new(0), false, false, false, false, false, u1::new(1));
		assert!(Frame::decode(&mut to_slice(&[u8::from(flags)])).is_err());
	}

	#[test]
	fn decode_all_rejects_an_oversized_frame_anywhere_in_the_payload() {
		let flags = StreamFlags::new(u2::new(0), false, true, false, false, false, u1::new(1));

		let mut bytes = vec![TAG_PRIORITY];
		bytes.extend_from_slice(&1u16.to_le_bytes());
		bytes.push(5);

		bytes.push(u8::from(flags));
		bytes.extend_from_slice(&7u16.to_le_bytes());
		bytes.extend_from_slice(&0xFFFFu16.to_le_bytes());

		assert!(Frame::decode_all(to_slice(&bytes)).is_err());
	}
}
