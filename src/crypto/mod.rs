//! Key Management
//!
//! Schnorr (BIP340) keypair generation and parsing. Stream identities are
//! 32-byte x-only public keys in lowercase hex.

pub mod keys;

pub use keys::{generate_keypair, keypair_from_hex, pubkey_for_privkey};
