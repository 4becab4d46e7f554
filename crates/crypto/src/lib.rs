//! q2cloud Crypto - Encryption, signing, and key management
//!
//! This crate provides:
//! - RSA-2048 key loading, PKCS#1 v1.5 encryption and SHA-256 signatures
//! - AES-128-CBC session encryption with IV chaining and key rotation
//! - SHA-256 / MD5 digests and a random nonce source
//! - Constant-time comparison

mod digest;
mod keys;
mod symmetric;

pub use digest::*;
pub use keys::*;
pub use symmetric::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key load failed: {0}")]
    KeyLoad(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Signature verification failed")]
    Verify,

    #[error("Bad padding")]
    Padding,

    #[error("Invalid length: {0}")]
    InvalidLength(usize),
}
