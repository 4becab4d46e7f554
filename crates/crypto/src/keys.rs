//! RSA key management
//!
//! Backend and frontend identities are RSA-2048 key pairs stored as PEM.
//! Both PKCS#1 (`RSA PRIVATE KEY` / `RSA PUBLIC KEY`) and PKCS#8/SPKI
//! (`PRIVATE KEY` / `PUBLIC KEY`) encodings are accepted.

use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::CryptoError;

/// Private half of an RSA identity
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Parse a PEM encoded key (PKCS#8 or PKCS#1)
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Read and parse a PEM file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::KeyLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(&pem)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// Modulus length in bytes
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// PKCS#1 v1.5 decrypt
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// SHA-256 + PKCS#1 v1.5 signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.inner.clone());
        signing_key.sign(message).to_vec()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &(self.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Public half of an RSA identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Parse a PEM encoded key (SPKI or PKCS#1)
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::KeyLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(&pem)
    }

    /// SPKI PEM encoding
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// PKCS#1 v1.5 encrypt
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    /// Verify a SHA-256 + PKCS#1 v1.5 signature
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::try_from(signature).map_err(|_| CryptoError::Verify)?;
        VerifyingKey::<Sha256>::new(self.inner.clone())
            .verify(message, &signature)
            .map_err(|_| CryptoError::Verify)
    }
}
