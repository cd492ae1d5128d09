//! Signed Stream Events
//!
//! A stream event is a Nostr NIP-01 note carrying a `prev` tag that links it
//! to its predecessor by id, plus a detached OpenTimestamps attestation in a
//! non-signed top-level `ots` field. The id is the SHA-256 digest of the
//! canonical serialization `[0, pubkey, created_at, kind, tags, content]`;
//! the signature is BIP340 Schnorr over that digest.

use secp256k1::{schnorr, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::error::{Result, StreamError};

/// Sentinel `prev` value of a genesis event.
pub const GENESIS: &str = "NULL";

/// `prev` value reported for events that carry no `prev` tag.
pub const PREV_NOT_SET: &str = "Not set";

/// NIP-01 text note kind. The engine treats text notes uniformly; other
/// kinds pass through untouched.
pub const KIND_TEXT_NOTE: u16 = 1;

/// A signed, hash-chained stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
    /// Base64-encoded detached OTS file for this event's digest. Not part
    /// of the canonical serialization, so upgrading the attestation never
    /// changes the event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ots: Option<String>,
}

impl Event {
    /// Build an unsigned text note linking to `prev`.
    pub fn new_text_note(pubkey: String, prev: String, content: String, created_at: i64) -> Self {
        Self {
            id: String::new(),
            pubkey,
            created_at,
            kind: KIND_TEXT_NOTE,
            tags: vec![vec!["prev".to_string(), prev]],
            content,
            sig: String::new(),
            ots: None,
        }
    }

    /// Canonical serialization used for the event id: the compact JSON array
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn serialize_canonical(&self) -> String {
        serde_json::json!([
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content
        ])
        .to_string()
    }

    /// SHA-256 digest of the canonical serialization.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.serialize_canonical().as_bytes());
        hasher.finalize().into()
    }

    /// Compute the id and sign the digest, filling in `id` and `sig`.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<()> {
        let digest = self.digest();
        self.id = hex::encode(digest);
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| StreamError::Key(format!("invalid digest: {}", e)))?;
        let signature = secp.sign_schnorr_no_aux_rand(&message, keypair);
        self.sig = signature.to_string();
        Ok(())
    }

    /// Recompute the digest and check the Schnorr signature against the
    /// author's x-only public key.
    pub fn verify(&self) -> Result<()> {
        let digest = self.digest();
        if hex::encode(digest) != self.id {
            return Err(StreamError::InvalidSignature(self.id.clone()));
        }
        let secp = Secp256k1::verification_only();
        let message = Message::from_digest_slice(&digest)
            .map_err(|_| StreamError::InvalidSignature(self.id.clone()))?;
        let pubkey = XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|_| StreamError::InvalidSignature(self.id.clone()))?;
        let signature = schnorr::Signature::from_str(&self.sig)
            .map_err(|_| StreamError::InvalidSignature(self.id.clone()))?;
        secp.verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| StreamError::InvalidSignature(self.id.clone()))
    }

    /// Value of the first `prev` tag, or `"Not set"` when absent.
    pub fn prev(&self) -> String {
        for tag in &self.tags {
            if tag.len() >= 2 && tag[0] == "prev" {
                return tag[1].clone();
            }
        }
        PREV_NOT_SET.to_string()
    }

    /// Human-readable kind label.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            0 => "Profile Metadata",
            1 => "Text Note",
            2 => "Relay Recommendation",
            3 => "Contact List",
            4 => "Encrypted Message",
            5 => "Deletion Notice",
            _ => "Unknown Kind",
        }
    }

    /// Pretty-print the event for CLI output. `name` is the local label of
    /// the author's stream when known.
    pub fn display(&self, name: Option<&str>, verbose: bool) -> String {
        let id = if verbose {
            self.id.clone()
        } else {
            shorten(&self.id)
        };
        let from = match (name, verbose) {
            (Some(n), true) => format!("{} ({})", n, self.pubkey),
            (Some(n), false) => format!("{} ({})", n, shorten(&self.pubkey)),
            (None, true) => self.pubkey.clone(),
            (None, false) => shorten(&self.pubkey),
        };
        let time = chrono::DateTime::from_timestamp(self.created_at, 0)
            .map(|t| t.to_rfc2822())
            .unwrap_or_else(|| self.created_at.to_string());
        let content = if self.kind == KIND_TEXT_NOTE {
            format!("  {}", self.content.replace('\n', "\n  "))
        } else {
            self.content.clone()
        };
        format!(
            "Id: {}\nPrev: {}\nFrom: {}\nTime: {}\nType: {}\n\n{}\n",
            id,
            self.prev(),
            from,
            time,
            self.kind_name(),
            content
        )
    }
}

/// Shorten an id to `abcd...wxyz` for display.
pub fn shorten(id: &str) -> String {
    if id.len() < 12 {
        return id.to_string();
    }
    format!("{}...{}", &id[..4], &id[id.len() - 4..])
}
