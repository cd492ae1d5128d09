use secp256k1::rand::rngs::OsRng;
use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::error::{Result, StreamError};

/// Generate a fresh keypair, returning `(privkey_hex, pubkey_hex)`.
pub fn generate_keypair() -> (String, String) {
    let secp = Secp256k1::new();
    let mut rng = OsRng;
    let secret_key = SecretKey::new(&mut rng);
    let keypair = Keypair::from_secret_key(&secp, &secret_key);
    let (xonly, _parity) = keypair.x_only_public_key();
    (
        hex::encode(secret_key.secret_bytes()),
        hex::encode(xonly.serialize()),
    )
}

/// Parse a hex private key into a signing keypair.
pub fn keypair_from_hex(privkey: &str) -> Result<Keypair> {
    let secp = Secp256k1::new();
    Keypair::from_seckey_str(&secp, privkey)
        .map_err(|e| StreamError::Key(format!("invalid private key: {}", e)))
}

/// Derive the x-only public key (hex) for a hex private key.
pub fn pubkey_for_privkey(privkey: &str) -> Result<String> {
    let keypair = keypair_from_hex(privkey)?;
    let (xonly, _parity) = keypair.x_only_public_key();
    Ok(hex::encode(xonly.serialize()))
}
