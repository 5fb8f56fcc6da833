use ring::{
    hkdf::{HKDF_SHA256, Salt},
    rand::{SecureRandom, SystemRandom},
};

use crate::{CryptoError, Result};

const MASTER_KEY_SIZE: usize = 32;
const HKDF_SALT: &[u8] = b"archivist-sse-v1";

#[derive(Clone)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_SIZE],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    pub fn generate() -> Result<Self> {
        let mut key = [0_u8; MASTER_KEY_SIZE];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CryptoError::Random)?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MASTER_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }

        let mut key = [0_u8; MASTER_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| CryptoError::InvalidKeyEncoding(err.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Derives the data key for one stored object.
    pub fn derive_object_key(&self, bucket: &str, key: &str) -> Result<[u8; 32]> {
        let info = format!("bucket={bucket};key={key}");
        let info_parts = [info.as_bytes()];
        let prk = Salt::new(HKDF_SHA256, HKDF_SALT).extract(&self.key);
        let okm = prk
            .expand(&info_parts, HKDF_SHA256)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut output = [0_u8; 32];
        okm.fill(&mut output)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::MasterKey;

    #[test]
    fn derived_keys_differ_per_object() {
        let master = MasterKey::from_bytes(&[1_u8; 32]).unwrap();
        let first = master.derive_object_key("archives", "a.zip").unwrap();
        let second = master.derive_object_key("archives", "b.zip").unwrap();
        assert_ne!(first, second);
        assert_eq!(first, master.derive_object_key("archives", "a.zip").unwrap());
    }

    #[test]
    fn hex_key_must_be_32_bytes() {
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_hex(&"ab".repeat(32)).is_ok());
    }
}
