//! Ed25519 identities: keypairs, PeerIds and detached signatures.
//!
//! A PeerId is the Base58 rendering of a fixed six-byte header followed by
//! the 32-byte public key. The header is the protobuf-encoded identity
//! multihash used for ed25519 keys, so every PeerId starts with `12D3KooW`.

use crate::Pubkey;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Header prepended to the public key before Base58 encoding.
pub const PEER_ID_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Errors that can occur when importing a secret key.
#[derive(Debug, Error)]
pub enum SecretKeyError {
    /// The secret is not valid standard Base64.
    #[error("invalid base64 secret: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded secret is neither a 32-byte seed nor a 64-byte keypair.
    #[error("secret key must be 32 or 64 bytes, got {0}")]
    WrongLength(usize),
}

/// Generate a fresh Ed25519 keypair using OS randomness.
#[must_use]
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Builds a keypair from a 32-byte private seed.
#[must_use]
pub fn keypair_from_seed(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_bytes(seed)
}

/// Imports a Base64 secret key.
///
/// Accepts either the bare 32-byte seed or the 64-byte `seed ‖ public`
/// form; only the seed is used and the public half is re-derived.
///
/// # Errors
///
/// Returns [`SecretKeyError`] if the input is not Base64 or has the wrong
/// length.
///
/// # Examples
///
/// ```
/// use base64::Engine;
/// use fleet_common::identity;
///
/// let key = identity::keypair_from_seed(&[5u8; 32]);
/// let full = [key.to_bytes(), key.verifying_key().to_bytes()].concat();
/// let secret = base64::engine::general_purpose::STANDARD.encode(full);
/// let imported = identity::keypair_from_secret(&secret).unwrap();
/// assert_eq!(imported.to_bytes(), key.to_bytes());
/// ```
pub fn keypair_from_secret(secret: &str) -> Result<SigningKey, SecretKeyError> {
    let bytes = Zeroizing::new(BASE64.decode(secret.trim())?);
    if bytes.len() != 32 && bytes.len() != 64 {
        return Err(SecretKeyError::WrongLength(bytes.len()));
    }
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&bytes[..32]);
    Ok(SigningKey::from_bytes(&seed))
}

/// Exports a keypair as Base64 `seed ‖ public`, the form accepted by
/// [`keypair_from_secret`].
#[must_use]
pub fn secret_to_base64(key: &SigningKey) -> String {
    let mut full = Zeroizing::new([0u8; 64]);
    full[..32].copy_from_slice(&key.to_bytes());
    full[32..].copy_from_slice(key.verifying_key().as_bytes());
    BASE64.encode(full.as_slice())
}

/// Derives the PeerId for a public key.
///
/// Pure and total: identical keys always give identical PeerIds.
///
/// # Examples
///
/// ```
/// let id = fleet_common::identity::peer_id(&[1u8; 32]);
/// assert!(id.starts_with("12D3KooW"));
/// ```
#[must_use]
pub fn peer_id(public_key: &Pubkey) -> String {
    let mut buf = [0u8; PEER_ID_PREFIX.len() + 32];
    buf[..PEER_ID_PREFIX.len()].copy_from_slice(&PEER_ID_PREFIX);
    buf[PEER_ID_PREFIX.len()..].copy_from_slice(public_key);
    crate::base58::encode(&buf)
}

/// Recovers the public key embedded in a PeerId.
///
/// # Errors
///
/// Returns [`PeerIdDecodeError`](crate::base58::PeerIdDecodeError) if the
/// string is not an ed25519 PeerId.
pub fn public_key_from_peer_id(
    peer_id: &str,
) -> Result<Pubkey, crate::base58::PeerIdDecodeError> {
    crate::base58::decode_peer_id(peer_id)
}

/// Signs arbitrary bytes, returning the raw 64-byte signature.
#[must_use]
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    use ed25519_dalek::Signer;
    signing_key.sign(message).to_bytes()
}

/// Verifies a signature over `message` against raw public key bytes.
///
/// Returns `false` for malformed keys or signatures as well as for
/// signatures that do not verify. Inbound messages may come from any peer,
/// so the key is always taken from the message, never from local state.
///
/// # Examples
///
/// ```
/// use fleet_common::identity;
///
/// let key = identity::keypair_from_seed(&[3u8; 32]);
/// let sig = identity::sign(&key, b"hello");
/// assert!(identity::verify(&sig, b"hello", key.verifying_key().as_bytes()));
/// assert!(!identity::verify(&sig, b"hellO", key.verifying_key().as_bytes()));
/// ```
#[must_use]
pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8]) -> bool {
    use ed25519_dalek::Verifier;
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
