//! The CurveCP-style handshake state machine: an [`Initiator`] drives the
//! Hello → Cookie → Initiate exchange from the connecting side; a stateless
//! [`Responder`] answers Hellos and consumes Initiates from the listening side,
//! exactly mirroring how `wireguard::noise`'s `InitiatorHandshake`/`ResponderHandshake`
//! split the same responsibilities for WireGuard's Noise-IK exchange.

use std::time::Instant;

use collections::bytes::Slice;
use crypto_box::SalsaBox;
use log::warn;
use rand::rngs::OsRng;
use utils::error::*;
use x25519_dalek::StaticSecret;

use crate::crypto::boxed;
use crate::crypto::cookie::{CookieIssuer, ReplayCache, MINUTE_COOKIE_LEN};
use crate::identity::{self, Eid, Identity};
use crate::wire::kex::{Cookie, Hello, Initiate, Vouch};

const HELLO_LABEL: &[u8; 8] = b"CurveCP-";
const COOKIE_LABEL: &[u8; 8] = b"rl3Anmxk";
const VOUCH_LABEL: &[u8; 8] = b"vouch-CC";
const INITIATE_LABEL: &[u8; 8] = b"qVNq5xLi";

/// The box used for every packet exchanged on a channel once the handshake
/// completes, precomputed once from the two parties' short-term keys rather than
/// recomputed per packet.
pub struct SessionKeys {
	pub channel_box: SalsaBox,
	pub i_shortterm_pk: Eid,
	pub r_shortterm_pk: Eid,
}

enum InitiatorState {
	AwaitingCookie,
	AwaitingConfirmation { r_shortterm_pk: Eid, cookie_nonce: [u8; 24], cookie: [u8; MINUTE_COOKIE_LEN] },
	Done,
}

/// Drives a handshake from the connecting side. One `Initiator` per outstanding
/// connection attempt; dropped once [`Self::initiate`] succeeds or the attempt is
/// abandoned.
pub struct Initiator {
	r_long_pk: Eid,
	i_shortterm_sk: StaticSecret,
	i_shortterm_pk: Eid,
	state: InitiatorState,
}

impl Initiator {
	pub fn new(r_long_pk: Eid) -> Self {
		let i_shortterm_sk = StaticSecret::random_from_rng(OsRng);
		let i_shortterm_pk = Eid::from(&i_shortterm_sk);

		Self { r_long_pk, i_shortterm_sk, i_shortterm_pk, state: InitiatorState::AwaitingCookie }
	}

	/// Builds the `Hello` packet to send (or resend, on a handshake retry timer).
	pub fn hello(&self, i_identity: &Identity) -> Hello {
		let nonce = boxed::nonce(HELLO_LABEL, 0);
		Hello::new(i_identity, &self.i_shortterm_pk, &self.r_long_pk, &nonce)
	}

	/// Consumes a received `Cookie`, recording the responder's short-term key and
	/// its proof-of-work cookie for the follow-up `Initiate`.
	pub fn consume_cookie(&mut self, cookie: &mut Cookie) -> Result {
		let payload = cookie.open(&self.i_shortterm_sk, &self.r_long_pk)?;

		self.state = InitiatorState::AwaitingConfirmation {
			r_shortterm_pk: payload.r_shortterm_pk,
			cookie_nonce: payload.cookie_nonce,
			cookie: payload.cookie,
		};

		Ok(())
	}

	/// Builds the final `Initiate` packet, vouching for this handshake's short-term
	/// key with `i_identity`'s long-term key and attaching `metadata` (spec.md §4.6).
	/// Returns the packet bytes and the session keys for the channel this handshake
	/// establishes.
	pub fn initiate(&mut self, i_identity: &Identity, metadata: &[u8]) -> Result<(Vec<u8>, SessionKeys)> {
		let InitiatorState::AwaitingConfirmation { r_shortterm_pk, cookie_nonce, cookie } = self.state else {
			return Err(warn!("Initiate built before a Cookie was consumed"));
		};

		let vouch_nonce = boxed::nonce(VOUCH_LABEL, 0);
		let vouch = Vouch::new(i_identity, &self.r_long_pk, &self.i_shortterm_pk, &vouch_nonce);

		let outer_nonce = boxed::nonce(INITIATE_LABEL, 0);
		let bytes = Initiate::encode(
			&self.i_shortterm_pk,
			cookie_nonce,
			cookie,
			&outer_nonce,
			&i_identity.public(),
			&vouch,
			metadata,
			&self.i_shortterm_sk,
			&r_shortterm_pk,
		);

		let channel_box = SalsaBox::new(&identity::box_public(&r_shortterm_pk), &identity::box_secret(&self.i_shortterm_sk));
		self.state = InitiatorState::Done;

		Ok((bytes, SessionKeys { channel_box, i_shortterm_pk: self.i_shortterm_pk, r_shortterm_pk }))
	}
}

/// Answers Hellos and consumes Initiates from the listening side. Carries no
/// per-initiator state of its own — just the minute-key cookie issuer and the
/// replay cache, both shared across every handshake a listener answers.
pub struct Responder<'a> {
	pub identity: &'a Identity,
	pub cookies: &'a mut CookieIssuer,
}

impl<'a> Responder<'a> {
	/// Verifies a received `Hello` and, if it checks out, mints a fresh short-term
	/// key and cookie and returns the `Cookie` reply. No state is retained: if the
	/// initiator never follows up with an `Initiate`, nothing here needs cleaning up
	/// (spec.md §4.5's stateless-responder requirement).
	pub fn consume_hello(&mut self, hello: &mut Hello) -> Result<Cookie> {
		hello.verify(self.identity)?;

		let r_shortterm_sk = StaticSecret::random_from_rng(OsRng);
		let r_shortterm_pk = Eid::from(&r_shortterm_sk);

		self.cookies.maybe_rotate(Instant::now());
		let (cookie_nonce, cookie) = self.cookies.mint(&hello.i_shortterm_pk, &r_shortterm_sk);

		let outer_nonce = boxed::nonce(COOKIE_LABEL, 0);
		Ok(Cookie::new(self.identity, &hello.i_shortterm_pk, &r_shortterm_pk, cookie_nonce, cookie, &outer_nonce))
	}

	/// Validates and opens a received `Initiate`. `buf` must already have the
	/// leading magic bytes stripped by the caller's dispatch table. On success
	/// returns the initiator's long-term identity, its connection metadata, and the
	/// session keys for the new channel.
	pub fn consume_initiate(&mut self, buf: &mut Slice, replay: &mut ReplayCache) -> Result<(Eid, Vec<u8>, SessionKeys)> {
		let prefix = Initiate::peel(buf)?;

		let (cookie_i_shortterm_pk, r_shortterm_sk) =
			self.cookies.open(&prefix.cookie_nonce, &prefix.cookie).ok_or_else(|| warn!("Initiate cookie did not open"))?;

		if cookie_i_shortterm_pk.as_bytes() != prefix.i_shortterm_pk.as_bytes() {
			return Err(warn!("Initiate cookie does not match its own short-term key"));
		}

		let (i_long_pk, mut vouch) = Initiate::open_body(buf, &prefix, &r_shortterm_sk)?;
		vouch.verify(&i_long_pk, self.identity, &prefix.i_shortterm_pk)?;

		if !replay.observe(&prefix.i_shortterm_pk) {
			return Err(warn!("Initiate replayed a completed handshake"));
		}

		let channel_box = SalsaBox::new(&identity::box_public(&prefix.i_shortterm_pk), &identity::box_secret(&r_shortterm_sk));
		let r_shortterm_pk = Eid::from(&r_shortterm_sk);

		let metadata = buf.to_vec();

		Ok((
			i_long_pk,
			metadata,
			SessionKeys { channel_box, i_shortterm_pk: prefix.i_shortterm_pk, r_shortterm_pk },
		))
	}
}
