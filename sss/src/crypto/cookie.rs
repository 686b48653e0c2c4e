//! The key-exchange responder's minute-key cookie mechanism (spec.md §4.5).
//!
//! A `CookieIssuer` never holds per-initiator state: it can mint and validate cookies
//! from nothing but the current (and, during a grace window, the previous) minute
//! key. A `ReplayCache` bounds how many distinct initiations the responder remembers
//! having already completed, to silently drop a captured-and-replayed INITIATE
//! (spec.md §8 scenario 5) without growing unbounded.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crypto_box::aead::Tag;
use rand::rngs::OsRng;
use rand::RngCore;
use xsalsa20poly1305::{Key, XSalsa20Poly1305};

use super::boxed;
use crate::identity::Eid;

pub const MINUTE_COOKIE_LEN: usize = 32 + 32 + 16; // I_shortterm_pk || R_shortterm_sk, detached tag
const ROTATE_AFTER: Duration = Duration::from_secs(60);
const MINUTE_LABEL: &[u8; 8] = b"sss-mcki";

struct MinuteKey {
	key: Key,
	issued: Instant,
}

fn fresh_key() -> Key {
	let mut bytes = [0u8; 32];
	OsRng.fill_bytes(&mut bytes);
	Key::from(bytes)
}

/// Mints and validates minute cookies. Held by a key-exchange responder; carries no
/// per-initiator state.
pub struct CookieIssuer {
	current: MinuteKey,
	previous: Option<MinuteKey>,
	counter: u64,
}

impl Default for CookieIssuer {
	fn default() -> Self {
		Self {
			current: MinuteKey { key: fresh_key(), issued: Instant::now() },
			previous: None,
			counter: 0,
		}
	}
}

impl CookieIssuer {
	/// Rotates the minute key if `ROTATE_AFTER` has elapsed since it was minted. The
	/// prior key is kept for one further rotation so cookies minted near the boundary
	/// remain valid.
	pub fn maybe_rotate(&mut self, now: Instant) {
		if now.duration_since(self.current.issued) >= ROTATE_AFTER {
			let expired = std::mem::replace(&mut self.current, MinuteKey { key: fresh_key(), issued: now });
			self.previous = Some(expired);
		}
	}

	/// Mints a cookie binding `i_short` to `r_short_sk`. Returns the cookie's nonce
	/// and its sealed bytes (ciphertext + detached tag, `MINUTE_COOKIE_LEN` long).
	pub fn mint(&mut self, i_short: &Eid, r_short_sk: &x25519_dalek::StaticSecret) -> ([u8; 24], [u8; MINUTE_COOKIE_LEN]) {
		let n = boxed::nonce(MINUTE_LABEL, self.counter);
		self.counter += 1;

		let mut plaintext = [0u8; 64];
		plaintext[..32].copy_from_slice(i_short.as_bytes());
		plaintext[32..].copy_from_slice(&r_short_sk.to_bytes());

		let tag = boxed::seal_secret(&self.current.key, &n, &mut plaintext);

		let mut out = [0u8; MINUTE_COOKIE_LEN];
		out[..64].copy_from_slice(&plaintext);
		out[64..].copy_from_slice(&tag);

		(n.into(), out)
	}

	/// Opens a cookie previously minted by [`Self::mint`], trying the current key and
	/// then the previous one. Returns `(I_shortterm_pk, R_shortterm_sk)` on success.
	pub fn open(&self, nonce: &[u8; 24], cookie: &[u8; MINUTE_COOKIE_LEN]) -> Option<(Eid, x25519_dalek::StaticSecret)> {
		let nonce = (*nonce).into();

		for key in [Some(&self.current), self.previous.as_ref()].into_iter().flatten() {
			let mut plaintext = [0u8; 64];
			plaintext.copy_from_slice(&cookie[..64]);
			let tag: Tag<XSalsa20Poly1305> = generic_array::GenericArray::clone_from_slice(&cookie[64..]);

			if boxed::open_secret(&key.key, &nonce, &mut plaintext, &tag).is_ok() {
				let i_short = Eid::from(<[u8; 32]>::try_from(&plaintext[..32]).unwrap());
				let r_short_sk = x25519_dalek::StaticSecret::from(<[u8; 32]>::try_from(&plaintext[32..]).unwrap());
				return Some((i_short, r_short_sk));
			}
		}

		None
	}
}

/// Bounds the number of distinct completed initiations a responder remembers, so a
/// captured INITIATE cannot be replayed to spin up a second channel.
pub struct ReplayCache {
	capacity: usize,
	seen: HashSet<[u8; 32]>,
	order: VecDeque<[u8; 32]>,
}

impl ReplayCache {
	pub fn new(capacity: usize) -> Self {
		Self { capacity, seen: HashSet::new(), order: VecDeque::new() }
	}

	/// Records `i_short` as completed. Returns `false` (and records nothing further)
	/// if this initiator short-term key has already been seen — the caller should
	/// treat the INITIATE as a silently-dropped replay.
	pub fn observe(&mut self, i_short: &Eid) -> bool {
		let key = *i_short.as_bytes();

		if !self.seen.insert(key) {
			return false;
		}

		self.order.push_back(key);

		if self.order.len() > self.capacity {
			if let Some(oldest) = self.order.pop_front() {
				self.seen.remove(&oldest);
			}
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use x25519_dalek::StaticSecret;

	use super::*;

	#[test]
	fn cookie_round_trips() {
		let mut issuer = CookieIssuer::default();
		let i_short = Eid::from(&StaticSecret::random_from_rng(OsRng));
		let r_short_sk = StaticSecret::random_from_rng(OsRng);

		let (nonce, cookie) = issuer.mint(&i_short, &r_short_sk);
		let (got_i, got_r) = issuer.open(&nonce, &cookie).expect("cookie should open");

		assert_eq!(got_i.as_bytes(), i_short.as_bytes());
		assert_eq!(got_r.to_bytes(), r_short_sk.to_bytes());
	}

	#[test]
	fn cookie_rejects_tampering() {
		let mut issuer = CookieIssuer::default();
		let i_short = Eid::from(&StaticSecret::random_from_rng(OsRng));
		let r_short_sk = StaticSecret::random_from_rng(OsRng);

		let (nonce, mut cookie) = issuer.mint(&i_short, &r_short_sk);
		cookie[0] ^= 1;

		assert!(issuer.open(&nonce, &cookie).is_none());
	}

	#[test]
	fn cookie_survives_one_rotation_but_not_two() {
		let mut issuer = CookieIssuer::default();
		let i_short = Eid::from(&StaticSecret::random_from_rng(OsRng));
		let r_short_sk = StaticSecret::random_from_rng(OsRng);

		let (nonce, cookie) = issuer.mint(&i_short, &r_short_sk);

		issuer.maybe_rotate(Instant::now() + ROTATE_AFTER);
		assert!(issuer.open(&nonce, &cookie).is_some());

		issuer.maybe_rotate(Instant::now() + ROTATE_AFTER * 2);
		assert!(issuer.open(&nonce, &cookie).is_none());
	}

	#[test]
	fn replay_cache_rejects_second_observation() {
		let mut cache = ReplayCache::new(2);
		let a = Eid::from(&StaticSecret::random_from_rng(OsRng));

		assert!(cache.observe(&a));
		assert!(!cache.observe(&a));
	}

	#[test]
	fn replay_cache_evicts_oldest_past_capacity() {
		let mut cache = ReplayCache::new(1);
		let a = Eid::from(&StaticSecret::random_from_rng(OsRng));
		let b = Eid::from(&StaticSecret::random_from_rng(OsRng));

		assert!(cache.observe(&a));
		assert!(cache.observe(&b));
		// `a` has been evicted, so it is no longer tracked as seen.
		assert!(cache.observe(&a));
	}
}
