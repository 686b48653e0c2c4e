//! The legacy AES armor (spec.md §4.1): AES-128-CTR for confidentiality and
//! HMAC-SHA-256 (truncated to 16 bytes) for integrity, kept only for interoperating
//! with peers that can't do the curve25519 box armor. Gated behind the
//! `legacy-aes-armor` feature; new deployments should never need it.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;
use utils::error::*;

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;

pub const KEY_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

fn mac(key: &[u8; KEY_LEN], counter: u64, data: &[u8]) -> [u8; TAG_LEN] {
	let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
	mac.update(&counter.to_le_bytes());
	mac.update(data);

	let full = mac.finalize().into_bytes();
	let mut tag = [0u8; TAG_LEN];
	tag.copy_from_slice(&full[..TAG_LEN]);
	tag
}

fn iv(counter: u64) -> [u8; 16] {
	let mut iv = [0u8; 16];
	iv[..8].copy_from_slice(&counter.to_be_bytes());
	iv
}

/// Encrypts `data` in place under `key`, keyed to `counter` (the packet sequence
/// number), and returns the authentication tag to append to the packet.
pub fn seal(key: &[u8; KEY_LEN], counter: u64, data: &mut [u8]) -> [u8; TAG_LEN] {
	let tag = mac(key, counter, data);
	Aes128Ctr::new(key.into(), &iv(counter).into()).apply_keystream(data);
	tag
}

/// Verifies `tag` and decrypts `data` in place under `key` and `counter`. Leaves
/// `data` untouched if the tag doesn't match.
pub fn open(key: &[u8; KEY_LEN], counter: u64, data: &mut [u8], tag: &[u8; TAG_LEN]) -> Result {
	let expected = mac(key, counter, data);

	// `Mac::verify_slice`-style constant-time comparison without pulling in subtle as
	// a direct dependency: XOR-accumulate rather than short-circuit `==`.
	let diff = expected.iter().zip(tag).fold(0u8, |acc, (a, b)| acc | (a ^ b));

	if diff != 0 {
		return Err(warn!("legacy armor authentication failed"));
	}

	Aes128Ctr::new(key.into(), &iv(counter).into()).apply_keystream(data);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let key = [0x42u8; KEY_LEN];
		let mut data = *b"a legacy armored payload!!";

		let tag = seal(&key, 7, &mut data);
		assert_ne!(&data, b"a legacy armored payload!!");

		open(&key, 7, &mut data, &tag).unwrap();
		assert_eq!(&data, b"a legacy armored payload!!");
	}

	#[test]
	fn rejects_tampered_tag() {
		let key = [0x11u8; KEY_LEN];
		let mut data = *b"some plaintext bytes......";
		let tag = seal(&key, 1, &mut data);

		let mut bad_tag = tag;
		bad_tag[0] ^= 1;

		assert!(open(&key, 1, &mut data, &bad_tag).is_err());
	}

	#[test]
	fn rejects_wrong_counter() {
		let key = [0x99u8; KEY_LEN];
		let mut data = *b"another plaintext message.";
		let tag = seal(&key, 5, &mut data);

		assert!(open(&key, 6, &mut data, &tag).is_err());
	}
}
