use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the indexed lookup prefix stored alongside each key hash.
pub const API_KEY_PREFIX_LEN: usize = 12;

/// A freshly minted API key. The plaintext is returned exactly once, at
/// creation time; only the salted hash is persisted.
pub struct GeneratedApiKey {
    pub plaintext: String,
    pub prefix: String,
    pub salt: String,
    pub hash: String,
}

/// Mint a high-entropy key of the form `ck_<64 hex chars>`.
pub fn generate_api_key() -> GeneratedApiKey {
    let mut rng = rand::thread_rng();
    let key_bytes: [u8; 32] = rng.gen();
    let salt_bytes: [u8; 16] = rng.gen();

    let plaintext = format!("ck_{}", hex::encode(key_bytes));
    let salt = hex::encode(salt_bytes);
    let hash = hash_api_key(&salt, &plaintext);
    let prefix = key_prefix(&plaintext).to_string();

    GeneratedApiKey {
        plaintext,
        prefix,
        salt,
        hash,
    }
}

/// Salted SHA-256 of the full key string, hex-encoded.
pub fn hash_api_key(salt: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison against the stored hash.
pub fn verify_api_key(salt: &str, key: &str, expected_hash: &str) -> bool {
    let computed = hash_api_key(salt, key);
    computed.as_bytes().ct_eq(expected_hash.as_bytes()).into()
}

/// Indexed lookup prefix for a key string. Generated keys are ASCII, but
/// this must not panic on arbitrary header bytes.
pub fn key_prefix(key: &str) -> &str {
    key.get(..API_KEY_PREFIX_LEN).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_verify() {
        let generated = generate_api_key();
        assert!(generated.plaintext.starts_with("ck_"));
        assert_eq!(generated.prefix.len(), API_KEY_PREFIX_LEN);
        assert!(verify_api_key(
            &generated.salt,
            &generated.plaintext,
            &generated.hash
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let generated = generate_api_key();
        assert!(!verify_api_key(
            &generated.salt,
            "ck_not_the_key",
            &generated.hash
        ));
    }

    #[test]
    fn distinct_keys_get_distinct_salts() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.plaintext, b.plaintext);
    }
}
