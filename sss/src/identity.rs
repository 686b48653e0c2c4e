use rand::rngs::OsRng;
use utils::bytes::Cast;
use x25519_dalek::{PublicKey, StaticSecret as SecretKey};

/// A stable, content-addressed name for a host: a long-term curve25519 public key.
///
/// `PublicKey` already implements `Cast`/`Unaligned` (see `utils::bytes::cast`), so an
/// `Eid` can be embedded directly in wire structs without a wrapper.
pub type Eid = PublicKey;

/// A local host's long-term identity keypair.
///
/// Persistence of this keypair (reading/writing it to disk) is out of scope for the
/// core; callers obtain one however they like (freshly generated, or loaded from
/// whatever settings store the embedding application uses) and hand it to
/// [`crate::host::Host::create`].
pub struct Identity {
	secret: SecretKey,
	public: Eid,
}

impl Identity {
	pub fn generate() -> Self {
		let secret = SecretKey::random_from_rng(OsRng);
		let public = Eid::from(&secret);
		Self { secret, public }
	}

	pub fn from_secret(secret: [u8; 32]) -> Self {
		let secret = SecretKey::from(secret);
		let public = Eid::from(&secret);
		Self { secret, public }
	}

	pub fn secret(&self) -> &SecretKey {
		&self.secret
	}

	pub fn public(&self) -> Eid {
		self.public
	}
}

/// The seam through which a local identity keypair reaches [`crate::host::Host::create`]
/// without the core depending on any particular persistence scheme (spec.md §1 puts
/// identity persistence out of scope). A freshly generated [`Identity`] satisfies it
/// directly; an embedding application can implement it for whatever loads a keypair
/// out of its own settings store.
pub trait IdentitySource {
	fn into_identity(self) -> Identity;
}

impl IdentitySource for Identity {
	fn into_identity(self) -> Identity {
		self
	}
}

/// Converts between the wire-friendly `x25519_dalek` key types used for EIDs and the
/// `crypto_box` key types used internally by the channel/handshake AEAD boxes.
pub(crate) fn box_public(k: &Eid) -> crypto_box::PublicKey {
	crypto_box::PublicKey::from(*k.as_bytes())
}

pub(crate) fn box_secret(k: &SecretKey) -> crypto_box::SecretKey {
	crypto_box::SecretKey::from(k.to_bytes())
}
