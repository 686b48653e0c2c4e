//! The four key-exchange packet formats (spec.md §4.5, §6.3): `Hello`, `Cookie`,
//! `Initiate`, and the `Message` framing used once a channel is established.
//!
//! `Hello` and `Cookie` are fixed-size and built the way `packet::Initiation` and
//! `packet::Response` are: plain `Cast` structs with a [`Sealed`] field standing in for
//! a ciphertext-plus-tag pair. `Initiate` carries caller-supplied metadata of unknown
//! length, so it is assembled with a [`Cursor`] and parsed back out of a [`Slice`], the
//! same way `tunnel::state::Tunnel::send`/`open` frame the data channel.
//!
//! Every message here deviates from the distilled handshake in one place: `Hello`
//! carries `i_long_pk` in cleartext alongside the sealed commitment. Without it R has
//! no key to open I's box with, since R only learns I's long-term identity once the
//! box is opened — so the cleartext copy has to come first. This is recorded as a
//! design decision, not inferred from a missing requirement.

use core::mem::size_of;

use collections::bytes::{Cursor, Slice};
use crypto_box::aead::Tag;
use crypto_box::{Nonce, SalsaBox};
use utils::bytes::Cast;
use utils::error::*;
use x25519_dalek::StaticSecret;

use crate::crypto::boxed::{self, Sealed};
use crate::crypto::cookie::MINUTE_COOKIE_LEN;
use crate::identity::{self, Eid, Identity};

/// Length in bytes of the detached tag appended by every box/secretbox seal in this
/// module (`XSalsa20Poly1305`'s Poly1305 tag).
pub const TAG_LEN: usize = 16;

#[derive(Cast)]
#[repr(C)]
pub struct Hello {
	pub magic: [u8; 8],
	pub i_shortterm_pk: Eid,
	pub i_long_pk: Eid,
	pub nonce: [u8; 24],
	pub commitment: Sealed<[u8; 32]>,
}

impl Hello {
	pub const MAGIC: [u8; 8] = *b"qVNq5xLh";

	pub fn new(i_identity: &Identity, i_short_pk: &Eid, r_long_pk: &Eid, nonce: &Nonce) -> Self {
		let commitment = Sealed::seal([0u8; 32], &identity::box_secret(i_identity.secret()), &identity::box_public(r_long_pk), nonce);

		Self {
			magic: Self::MAGIC,
			i_shortterm_pk: *i_short_pk,
			i_long_pk: i_identity.public(),
			nonce: (*nonce).into(),
			commitment,
		}
	}

	/// Opens the sealed commitment, proving this `Hello` really comes from the holder
	/// of `i_long_pk`'s secret. Takes `r_identity` rather than a bare secret so callers
	/// can't accidentally verify against the wrong keypair.
	pub fn verify(&mut self, r_identity: &Identity) -> Result {
		let nonce = Nonce::from(self.nonce);
		self.commitment
			.open(&identity::box_secret(r_identity.secret()), &identity::box_public(&self.i_long_pk), &nonce)?;
		Ok(())
	}
}

#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct CookiePayload {
	pub r_shortterm_pk: Eid,
	pub cookie_nonce: [u8; 24],
	pub cookie: [u8; MINUTE_COOKIE_LEN],
}

#[derive(Cast)]
#[repr(C)]
pub struct Cookie {
	pub magic: [u8; 8],
	pub nonce: [u8; 24],
	pub payload: Sealed<CookiePayload>,
}

impl Cookie {
	pub const MAGIC: [u8; 8] = *b"rl3Anmxk";

	pub fn new(
		r_identity: &Identity,
		i_short_pk: &Eid,
		r_short_pk: &Eid,
		cookie_nonce: [u8; 24],
		cookie: [u8; MINUTE_COOKIE_LEN],
		nonce: &Nonce,
	) -> Self {
		let payload = CookiePayload { r_shortterm_pk: *r_short_pk, cookie_nonce, cookie };
		let payload = Sealed::seal(payload, &identity::box_secret(r_identity.secret()), &identity::box_public(i_short_pk), nonce);

		Self { magic: Self::MAGIC, nonce: (*nonce).into(), payload }
	}

	/// Opens the cookie envelope. `i_short_sk` is the initiator's own short-term
	/// secret from the `Hello` that prompted this reply; `r_long_pk` is the responder
	/// identity the handshake was addressed to.
	pub fn open(&mut self, i_short_sk: &StaticSecret, r_long_pk: &Eid) -> Result<&CookiePayload> {
		let nonce = Nonce::from(self.nonce);
		self.payload.open(&identity::box_secret(i_short_sk), &identity::box_public(r_long_pk), &nonce)
	}
}

/// I's proof that its long-term identity really authorized the short-term key used in
/// this handshake, sealed between the two parties' long-term keys.
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct Vouch {
	nonce: [u8; 24],
	sealed: Sealed<Eid>,
}

impl Vouch {
	pub fn new(i_identity: &Identity, r_long_pk: &Eid, i_short_pk: &Eid, nonce: &Nonce) -> Self {
		let sealed = Sealed::seal(*i_short_pk, &identity::box_secret(i_identity.secret()), &identity::box_public(r_long_pk), nonce);
		Self { nonce: (*nonce).into(), sealed }
	}

	/// Verifies that `i_long_pk` vouches for `i_short_pk` as this handshake's
	/// initiator short-term key.
	pub fn verify(&mut self, i_long_pk: &Eid, r_identity: &Identity, i_short_pk: &Eid) -> Result {
		let nonce = Nonce::from(self.nonce);
		let vouched = self.sealed.open(&identity::box_secret(r_identity.secret()), &identity::box_public(i_long_pk), &nonce)?;

		if vouched.as_bytes() == i_short_pk.as_bytes() {
			Ok(())
		} else {
			Err(warn!("vouch does not cover this handshake's initiator short-term key"))
		}
	}
}

/// Everything in an `Initiate` packet ahead of the encrypted body: enough for the
/// responder to recover `R_shortterm_sk` from the cookie before it can even attempt to
/// open the box.
pub struct InitiatePrefix {
	pub i_shortterm_pk: Eid,
	pub cookie_nonce: [u8; 24],
	pub cookie: [u8; MINUTE_COOKIE_LEN],
	pub nonce: [u8; 24],
}

pub struct Initiate;

impl Initiate {
	pub const MAGIC: [u8; 8] = *b"qVNq5xLi";

	/// Builds a complete `Initiate` packet. `metadata` is the caller-supplied
	/// connection metadata from spec.md §4.6, opaque to the key exchange itself.
	pub fn encode(
		i_short_pk: &Eid,
		cookie_nonce: [u8; 24],
		cookie: [u8; MINUTE_COOKIE_LEN],
		nonce: &Nonce,
		i_long_pk: &Eid,
		vouch: &Vouch,
		metadata: &[u8],
		i_short_sk: &StaticSecret,
		r_short_pk: &Eid,
	) -> Vec<u8> {
		let body_len = size_of::<Eid>() + size_of::<Vouch>() + size_of::<u16>() + metadata.len();
		let total = Self::MAGIC.len() + size_of::<Eid>() + 24 + MINUTE_COOKIE_LEN + 24 + body_len + TAG_LEN;

		let mut out = vec![0u8; total];

		Cursor::vec(&mut out, |c| {
			let c = c.push(&Self::MAGIC);
			let c = c.push(i_short_pk);
			let c = c.push(&cookie_nonce);
			let c = c.push(&cookie);
			let mut c = c.push(&<[u8; 24]>::from(*nonce));

			{
				let body = c.rlim(TAG_LEN);
				let body = body.push(i_long_pk);
				let body = body.push(vouch);
				let body = body.push(&(metadata.len() as u16));
				body.push(metadata);
			}

			let (mut data, tag): (_, &mut Tag<SalsaBox>) = c.rsplit();
			*tag = boxed::seal(&identity::box_secret(i_short_sk), &identity::box_public(r_short_pk), nonce, &mut data);
		});

		out
	}

	/// Strips the cleartext framing off a received `Initiate`, leaving `buf`
	/// positioned at the encrypted body. The caller must recover `R_shortterm_sk`
	/// from the returned cookie fields (via [`cookie::CookieIssuer::open`]) before
	/// calling [`Self::open_body`].
	///
	/// `buf` is attacker-controlled and unauthenticated at this point (the
	/// responder hasn't even recovered a key to check it with yet), so every
	/// length here is checked against what's actually left rather than trusted:
	/// a short or truncated `Initiate`-tagged datagram must be rejected, not
	/// panic the process (spec.md §7, the same hazard as a malformed frame).
	pub fn peel(buf: &mut Slice) -> Result<InitiatePrefix> {
		let prefix_len = size_of::<Eid>() + 24 + MINUTE_COOKIE_LEN + 24;
		if buf.len() < prefix_len + TAG_LEN {
			return Err(warn!("Initiate truncated before its cleartext prefix"));
		}

		let i_shortterm_pk = *buf.split::<Eid>();
		let cookie_nonce = *buf.split::<[u8; 24]>();
		let cookie = *buf.split::<[u8; MINUTE_COOKIE_LEN]>();
		let nonce = *buf.split::<[u8; 24]>();

		Ok(InitiatePrefix { i_shortterm_pk, cookie_nonce, cookie, nonce })
	}

	/// Decrypts the body following a [`Self::peel`] call. On success `buf` is left
	/// spanning exactly the trailing connection metadata, and the caller's identity
	/// plus its handshake vouch are returned for the caller to verify.
	pub fn open_body(buf: &mut Slice, prefix: &InitiatePrefix, r_short_sk: &StaticSecret) -> Result<(Eid, Vouch)> {
		if buf.len() < size_of::<Eid>() + size_of::<Vouch>() + size_of::<u16>() + TAG_LEN {
			return Err(warn!("Initiate body too short to hold its fixed fields"));
		}

		let tag: Tag<SalsaBox> = *buf.rsplit();
		let nonce = Nonce::from(prefix.nonce);

		boxed::open(&identity::box_secret(r_short_sk), &identity::box_public(&prefix.i_shortterm_pk), &nonce, buf, &tag)?;

		let i_long_pk = *buf.split::<Eid>();
		let vouch = *buf.split::<Vouch>();
		let metadata_len = *buf.split::<u16>();

		if metadata_len as usize > buf.len() {
			return Err(warn!("Initiate metadata length exceeds what's left of the body"));
		}
		buf.truncate(metadata_len as usize);

		Ok((i_long_pk, vouch))
	}
}

/// Magic prefix on every packet sent once a channel is established (spec.md §6.3);
/// framed with the plaintext [`crate::wire::header::Header`] and encrypted under the
/// channel's session box, with the packet sequence doubling as the nonce counter.
pub const MESSAGE_MAGIC: [u8; 8] = *b"rl3q5xLm";
