//! Common types and utilities shared by fleet relay clients.
//!
//! This crate provides:
//! - Ed25519 identities and PeerId derivation ([`identity`])
//! - Base58 encoding and PeerId decoding ([`base58`])
//! - The JSON wire codec for relay frames and signed envelopes ([`codec`])
//! - Job-control payload shapes ([`message`])
//! - Fleet data types and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod base58;
pub mod codec;
pub mod identity;
pub mod message;
pub mod types;

pub use codec::CodecError;
pub use types::Pubkey;
