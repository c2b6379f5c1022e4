//! Base58 encoding and PeerId decoding.
//!
//! Wraps the `bs58` crate (Bitcoin alphabet). Encoding a byte string
//! emits one leading `'1'` per leading zero byte followed by the big-endian
//! base58 digits of the remainder, which is exactly the PeerId rendering.

use crate::identity::PEER_ID_PREFIX;
use crate::Pubkey;
use thiserror::Error;

pub use bs58::decode::Error as DecodeError;

/// Errors that can occur when decoding a PeerId back into a public key.
///
/// # Examples
///
/// ```
/// use fleet_common::base58;
/// // A bare key without the PeerId prefix is rejected.
/// let bare = base58::encode(&[7u8; 32]);
/// assert!(base58::decode_peer_id(&bare).is_err());
/// ```
#[derive(Debug, Error)]
pub enum PeerIdDecodeError {
    /// The input is not valid Base58.
    #[error("invalid base58: {0}")]
    Base58(#[from] DecodeError),
    /// The decoded bytes are not prefix plus a 32-byte key.
    #[error(
        "peer id must decode to {expected} bytes, got {0}",
        expected = PEER_ID_PREFIX.len() + 32
    )]
    WrongLength(usize),
    /// The decoded bytes do not start with the ed25519 PeerId prefix.
    #[error("peer id does not carry the ed25519 key prefix")]
    WrongPrefix,
}

/// Encodes raw bytes to a Base58 string.
///
/// # Examples
///
/// ```
/// assert_eq!(fleet_common::base58::encode(&[0, 0, 1]), "112");
/// ```
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58 string to raw bytes.
///
/// # Errors
///
/// Returns `DecodeError` if the input is not valid Base58.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    bs58::decode(s).into_vec()
}

/// Recovers the 32-byte public key embedded in a PeerId.
///
/// # Errors
///
/// Returns [`PeerIdDecodeError`] if the input is not valid Base58, has the
/// wrong length, or lacks the ed25519 prefix.
///
/// # Examples
///
/// ```
/// use fleet_common::{base58, identity};
///
/// let key = [0x42u8; 32];
/// let peer_id = identity::peer_id(&key);
/// assert_eq!(base58::decode_peer_id(&peer_id).unwrap(), key);
/// ```
pub fn decode_peer_id(s: &str) -> Result<Pubkey, PeerIdDecodeError> {
    let bytes = decode(s)?;
    if bytes.len() != PEER_ID_PREFIX.len() + 32 {
        return Err(PeerIdDecodeError::WrongLength(bytes.len()));
    }
    let (prefix, key) = bytes.split_at(PEER_ID_PREFIX.len());
    if prefix != PEER_ID_PREFIX {
        return Err(PeerIdDecodeError::WrongPrefix);
    }
    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(key);
    Ok(pubkey)
}
