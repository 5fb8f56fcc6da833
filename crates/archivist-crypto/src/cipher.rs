use ring::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    rand::{SecureRandom, SystemRandom},
};

use crate::{CryptoError, Result};

/// Seals `plaintext` with AES-256-GCM. Output layout is `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = less_safe_key(key)?;
    let mut nonce_bytes = [0_u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Random)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut output = Vec::with_capacity(NONCE_LEN + in_out.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&in_out);
    Ok(output)
}

pub fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::InvalidCiphertext("missing nonce"));
    }

    let key = less_safe_key(key)?;
    let (nonce_bytes, encrypted) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| CryptoError::InvalidCiphertext("bad nonce"))?;

    let mut in_out = encrypted.to_vec();
    let plaintext_len = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Decrypt)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

fn less_safe_key(key: &[u8; 32]) -> Result<LessSafeKey> {
    let unbound =
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    Ok(LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::{open, seal};

    #[test]
    fn sealed_part_opens_with_same_aad() {
        let key = [7_u8; 32];
        let sealed = seal(&key, b"part-1", b"archive bytes").unwrap();
        assert_ne!(&sealed[12..], b"archive bytes");
        assert_eq!(open(&key, b"part-1", &sealed).unwrap(), b"archive bytes");
    }

    #[test]
    fn reordered_part_fails_authentication() {
        let key = [7_u8; 32];
        let sealed = seal(&key, b"part-1", b"archive bytes").unwrap();
        assert!(open(&key, b"part-2", &sealed).is_err());
    }
}
