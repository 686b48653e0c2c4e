//! The preferred channel/handshake armor: curve25519 key agreement with an
//! `XSalsa20Poly1305` box, the same primitive pairing as `sodiumpp::boxer`/`unboxer`
//! in `cryptobox_armor.h`. All nonces here are "structured": an 8-byte ASCII phase
//! prefix followed by an 8-byte little-endian counter, per spec.md §4.5.

use crypto_box::aead::{AeadInPlace, Tag};
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use log::warn;
use utils::bytes;
use utils::bytes::Cast;
use utils::error::*;
use xsalsa20poly1305::XSalsa20Poly1305;

/// Builds a 24-byte structured nonce: an 8-byte phase label followed by an 8-byte
/// little-endian counter and 8 zero bytes. `label` must be exactly 8 bytes.
pub fn nonce(label: &[u8; 8], counter: u64) -> Nonce {
	let mut bytes = [0u8; 24];
	bytes[..8].copy_from_slice(label);
	bytes[8..16].copy_from_slice(&counter.to_le_bytes());
	Nonce::from(bytes)
}

/// Seals `plaintext` in place, appending a detached tag, keyed by an asymmetric box
/// between `our_secret` and `their_public`.
pub fn seal(our_secret: &SecretKey, their_public: &PublicKey, nonce: &Nonce, plaintext: &mut [u8]) -> Tag<SalsaBox> {
	SalsaBox::new(their_public, our_secret)
		.encrypt_in_place_detached(nonce, &[], plaintext)
		.expect("encrypting a box payload should not fail")
}

/// Opens `ciphertext` in place given its detached `tag`, keyed by an asymmetric box
/// between `our_secret` and `their_public`.
pub fn open(our_secret: &SecretKey, their_public: &PublicKey, nonce: &Nonce, ciphertext: &mut [u8], tag: &Tag<SalsaBox>) -> Result {
	SalsaBox::new(their_public, our_secret)
		.decrypt_in_place_detached(nonce, &[], ciphertext, tag)
		.map_err(|_| warn!("Failed to open box: authentication failed"))
}

/// Seals `plaintext` in place under a symmetric secret (used for the minute-key
/// cookie, which per spec.md §4.5 the responder keeps only as a bare secret, never
/// per-connection state).
pub fn seal_secret(key: &xsalsa20poly1305::Key, nonce: &Nonce, plaintext: &mut [u8]) -> Tag<XSalsa20Poly1305> {
	use crypto_box::aead::KeyInit;

	XSalsa20Poly1305::new(key)
		.encrypt_in_place_detached(nonce, &[], plaintext)
		.expect("encrypting a secretbox payload should not fail")
}

pub fn open_secret(key: &xsalsa20poly1305::Key, nonce: &Nonce, ciphertext: &mut [u8], tag: &Tag<XSalsa20Poly1305>) -> Result {
	use crypto_box::aead::KeyInit;

	XSalsa20Poly1305::new(key)
		.decrypt_in_place_detached(nonce, &[], ciphertext, tag)
		.map_err(|_| warn!("Failed to open secretbox: authentication failed"))
}

/// A fixed-layout `T` alongside the detached tag from sealing it under an asymmetric
/// box, embeddable directly in a wire struct the way `noise::aead::Sealed` embeds a
/// `ChaCha20Poly1305` tag next to its plaintext.
///
/// The nonce is never stored here: every caller derives it from context (a structured
/// phase label and counter, or an explicit nonce field alongside the `Sealed<T>`).
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct Sealed<T: Cast + Clone + Copy>(T, Tag<SalsaBox>);

impl<T: Cast + Clone + Copy> Sealed<T> {
	pub fn seal(t: T, our_secret: &SecretKey, their_public: &PublicKey, nonce: &Nonce) -> Self {
		let mut inner = t;
		let tag = seal(our_secret, their_public, nonce, bytes::as_slice_mut(&mut inner));
		Self(inner, tag)
	}

	pub fn open(&mut self, our_secret: &SecretKey, their_public: &PublicKey, nonce: &Nonce) -> Result<&T> {
		open(our_secret, their_public, nonce, bytes::as_slice_mut(&mut self.0), &self.1)?;
		Ok(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use crypto_box::SecretKey;
	use rand::rngs::OsRng;

	use super::*;

	#[test]
	fn box_round_trips() {
		let a = SecretKey::generate(&mut OsRng);
		let b = SecretKey::generate(&mut OsRng);

		let n = nonce(b"CurveCP-", 7);
		let mut data = *b"hello, responder";

		let tag = seal(&a, &b.public_key(), &n, &mut data);
		assert_ne!(&data, b"hello, responder");

		open(&b, &a.public_key(), &n, &mut data, &tag).unwrap();
		assert_eq!(&data, b"hello, responder");
	}

	#[test]
	fn box_open_rejects_tampering() {
		let a = SecretKey::generate(&mut OsRng);
		let b = SecretKey::generate(&mut OsRng);

		let n = nonce(b"CurveCP-", 1);
		let mut data = *b"authenticate me!";
		let tag = seal(&a, &b.public_key(), &n, &mut data);

		data[0] ^= 1;
		assert!(open(&b, &a.public_key(), &n, &mut data, &tag).is_err());
	}

	#[test]
	fn sealed_wrapper_round_trips() {
		let a = SecretKey::generate(&mut OsRng);
		let b = SecretKey::generate(&mut OsRng);
		let n = nonce(b"CurveCP-", 0);

		let mut sealed = Sealed::seal(*b"0123456789abcdef", &a, &b.public_key(), &n);
		let opened = sealed.open(&b, &a.public_key(), &n).unwrap();
		assert_eq!(opened, b"0123456789abcdef");
	}

	#[test]
	fn secretbox_round_trips() {
		let key = xsalsa20poly1305::Key::default();
		let n = nonce(b"mincooki", 3);
		let mut data = *b"minute-key cookie payload bytes!";

		let tag = seal_secret(&key, &n, &mut data);
		open_secret(&key, &n, &mut data, &tag).unwrap();
		assert_eq!(&data, b"minute-key cookie payload bytes!");
	}
}
