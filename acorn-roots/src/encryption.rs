use acorn_core::error::{AcornResult, PipelineError};
use acorn_core::Root;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Authenticated AES-256-GCM pipeline stage. Every record gets a fresh random
/// nonce, prepended to the ciphertext; a failed tag check surfaces as
/// `Pipeline(AuthenticationFailed)` so callers can tell tampering from a
/// reconfigured pipeline.
pub struct EncryptionRoot {
    sequence: u32,
    cipher: Aes256Gcm,
}

impl EncryptionRoot {
    pub fn from_key(sequence: u32, key: [u8; KEY_LEN]) -> Self {
        EncryptionRoot {
            sequence,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    pub fn from_password(sequence: u32, password: &str, salt: &str) -> Self {
        Self::from_key(sequence, derive_key(password, salt))
    }

    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }
}

/// PBKDF2-HMAC-SHA256 key derivation; deterministic for a password/salt pair
/// so re-opened stores derive the same key.
pub fn derive_key(password: &str, salt: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ROUNDS,
        &mut key,
    );
    key
}

impl Root for EncryptionRoot {
    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn encode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), input)
            .map_err(|_| PipelineError::Corrupt("encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, input: &[u8]) -> AcornResult<Vec<u8>> {
        if input.len() < NONCE_LEN {
            return Err(PipelineError::Corrupt("ciphertext shorter than nonce".into()).into());
        }
        let (nonce, ciphertext) = input.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PipelineError::AuthenticationFailed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorn_core::AcornError;
    use proptest::prelude::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let root = EncryptionRoot::from_password(200, "hunter2", "per-store-salt");
        let sealed = root.encode(b"sensitive bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"sensitive bytes".as_slice());
        assert_eq!(root.decode(&sealed).unwrap(), b"sensitive bytes");
    }

    #[test]
    fn nonces_are_unique_per_record() {
        let root = EncryptionRoot::from_key(200, [7u8; 32]);
        let a = root.encode(b"same input").unwrap();
        let b = root.encode(b"same input").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_fails_authentication() {
        let root = EncryptionRoot::from_key(200, [9u8; 32]);
        let mut sealed = root.encode(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            root.decode(&sealed).unwrap_err(),
            AcornError::Pipeline(PipelineError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = EncryptionRoot::from_key(200, [1u8; 32])
            .encode(b"payload")
            .unwrap();
        let other = EncryptionRoot::from_key(200, [2u8; 32]);
        assert!(matches!(
            other.decode(&sealed).unwrap_err(),
            AcornError::Pipeline(PipelineError::AuthenticationFailed)
        ));
    }

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(derive_key("pw", "salt"), derive_key("pw", "salt"));
        assert_ne!(derive_key("pw", "salt"), derive_key("pw", "other-salt"));
        assert_ne!(derive_key("pw", "salt"), derive_key("other-pw", "salt"));
    }

    proptest! {
        #[test]
        fn inverts_arbitrary_bytes(input in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let root = EncryptionRoot::from_key(200, [42u8; 32]);
            let sealed = root.encode(&input).unwrap();
            prop_assert_eq!(root.decode(&sealed).unwrap(), input);
        }
    }
}
