pub mod cipher;
pub mod key;

pub use cipher::{open, seal};
pub use key::MasterKey;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(&'static str),
    #[error("random generator failure")]
    Random,
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure")]
    Decrypt,
    #[error("key derivation failure")]
    KeyDerivation,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
