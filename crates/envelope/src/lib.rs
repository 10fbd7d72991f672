//! Sealed message envelopes for the bus: AES-256-GCM over a per-message key
//! derived from the process master key and a fresh nonce, with the nonce
//! appended to the ciphertext.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Wire layout is `ciphertext || nonce`, nonce exactly this long.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("master key is not valid hex")]
    MalformedMasterKey(#[from] hex::FromHexError),
    #[error("sealing failed")]
    Seal,
    #[error("sealed payload is shorter than a nonce ({0} bytes)")]
    Truncated(usize),
    #[error("authentication failed: wrong key or corrupted payload")]
    Auth,
}

/// MasterKey is the process-wide envelope encryption key, configured as hex.
/// Its absence or malformation is a fatal startup error for every service
/// that touches the bus.
#[derive(Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn from_hex(hex_key: &str) -> Result<MasterKey, Error> {
        Ok(MasterKey(hex::decode(hex_key.trim())?))
    }

    /// Per-message key: HMAC-SHA256(master, nonce). Deterministic, so the
    /// consumer re-derives it from the appended nonce alone.
    fn derive(&self, nonce: &[u8]) -> Key<Aes256Gcm> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(nonce);
        let derived = mac.finalize().into_bytes();
        Key::<Aes256Gcm>::clone_from_slice(&derived)
    }

    /// Seal `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(plaintext, &nonce)
    }

    fn seal_with_nonce(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new(&self.derive(nonce));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| Error::Seal)?;
        sealed.extend_from_slice(nonce);
        Ok(sealed)
    }

    /// Open a sealed payload: split the trailing nonce, re-derive, decrypt.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Truncated(sealed.len()));
        }
        let (ciphertext, nonce) = sealed.split_at(sealed.len() - NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.derive(nonce));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Auth)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("MasterKey(..)")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_hex(&hex::encode([byte; 32])).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let master = key(1);
        for plaintext in [&b""[..], b"x", b"{\"source_id\":\"INC001\"}", &[0u8; 4096]] {
            let sealed = master.seal(plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + 16 + NONCE_LEN);
            assert_eq!(master.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let master = key(1);
        let a = master.seal(b"payload").unwrap();
        let b = master.seal(b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = key(1).seal(b"payload").unwrap();
        assert!(matches!(key(2).open(&sealed), Err(Error::Auth)));
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let master = key(1);
        let mut sealed = master.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert!(matches!(master.open(&sealed), Err(Error::Auth)));
    }

    #[test]
    fn test_truncated_payload() {
        assert!(matches!(key(1).open(&[0u8; 5]), Err(Error::Truncated(5))));
    }

    #[test]
    fn test_malformed_master_key() {
        assert!(matches!(
            MasterKey::from_hex("not hex"),
            Err(Error::MalformedMasterKey(_))
        ));
    }
}
