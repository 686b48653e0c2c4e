//! Packet armor: the per-channel AEAD wrapping every packet's encrypted frame
//! payload (spec.md §4.1, §6.2). Two schemes share one [`ChannelArmor`] trait,
//! negotiated once at key-exchange time and fixed for the channel's lifetime —
//! the same shape as `sss::channel_armor` in the original's
//! `include/sss/channel_armor.h`, generalized here to a Rust trait object instead
//! of a C vtable struct.

use crypto_box::aead::{AeadInPlace, Tag};
use crypto_box::SalsaBox;
use log::warn;
use utils::error::*;

pub const TAG_LEN: usize = 16;

/// The path MTU this protocol targets (spec.md §4.1); a channel never builds a
/// packet larger than this.
pub const MTU: usize = 1280;

/// Builds the 24-byte nonce for `seq` on a channel half identified by `half_id`:
/// the sequence, little-endian, XORed into the low 8 bytes with the half-id and
/// zero-padded out to 24 bytes. Binds both sequence and channel identity into
/// every nonce, so a packet replayed onto the wrong channel half never decrypts.
pub fn channel_nonce(half_id: u64, seq: u64) -> crypto_box::Nonce {
	let mut bytes = [0u8; 24];
	let seq = seq.to_le_bytes();
	let half_id = half_id.to_le_bytes();

	for i in 0..8 {
		bytes[i] = seq[i] ^ half_id[i];
	}

	crypto_box::Nonce::from(bytes)
}

/// Encrypts and authenticates one channel packet's payload. `half_id` is the
/// sending half's channel id (spec.md §3's transmit/receive channel ID), `seq`
/// the packet's 64-bit sequence.
pub trait ChannelArmor {
	fn seal(&self, half_id: u64, seq: u64, payload: &mut [u8]) -> [u8; TAG_LEN];
	fn open(&self, half_id: u64, seq: u64, payload: &mut [u8], tag: &[u8; TAG_LEN]) -> Result;
}

/// The production armor: a `SalsaBox` precomputed once from the channel's two
/// short-term keys at handshake completion (`kex::SessionKeys::channel_box`).
pub struct BoxArmor {
	pub channel_box: SalsaBox,
}

impl ChannelArmor for BoxArmor {
	fn seal(&self, half_id: u64, seq: u64, payload: &mut [u8]) -> [u8; TAG_LEN] {
		let nonce = channel_nonce(half_id, seq);
		let tag = self
			.channel_box
			.encrypt_in_place_detached(&nonce, &[], payload)
			.expect("encrypting a channel payload should not fail");

		tag.into()
	}

	fn open(&self, half_id: u64, seq: u64, payload: &mut [u8], tag: &[u8; TAG_LEN]) -> Result {
		let nonce = channel_nonce(half_id, seq);
		let tag: Tag<SalsaBox> = generic_array::GenericArray::clone_from_slice(tag);

		self.channel_box
			.decrypt_in_place_detached(&nonce, &[], payload, &tag)
			.map_err(|_| warn!("channel box armor authentication failed"))
	}
}

/// The legacy armor (feature `legacy-aes-armor`): AES-128-CTR + truncated
/// HMAC-SHA-256, for interoperating with peers unable to negotiate the box.
#[cfg(feature = "legacy-aes-armor")]
pub struct LegacyArmor {
	pub key: [u8; crate::crypto::legacy::KEY_LEN],
}

#[cfg(feature = "legacy-aes-armor")]
impl ChannelArmor for LegacyArmor {
	fn seal(&self, half_id: u64, seq: u64, payload: &mut [u8]) -> [u8; TAG_LEN] {
		crate::crypto::legacy::seal(&self.key, seq ^ half_id, payload)
	}

	fn open(&self, half_id: u64, seq: u64, payload: &mut [u8], tag: &[u8; TAG_LEN]) -> Result {
		crate::crypto::legacy::open(&self.key, seq ^ half_id, payload, tag)
	}
}

#[cfg(test)]
mod tests {
	use crypto_box::SecretKey;
	use rand::rngs::OsRng;

	use super::*;

	#[test]
	fn box_armor_round_trips_and_binds_half_id() {
		let a = SecretKey::generate(&mut OsRng);
		let b = SecretKey::generate(&mut OsRng);
		let channel_box = SalsaBox::new(&b.public_key(), &a);
		let armor = BoxArmor { channel_box };

		let mut payload = b"a framed payload".to_vec();
		let tag = armor.seal(7, 42, &mut payload);
		armor.open(7, 42, &mut payload, &tag).expect("should open with matching half_id/seq");
		assert_eq!(payload, b"a framed payload");

		let mut payload = b"a framed payload".to_vec();
		let tag = armor.seal(7, 42, &mut payload);
		assert!(armor.open(8, 42, &mut payload, &tag).is_err());
	}
}
