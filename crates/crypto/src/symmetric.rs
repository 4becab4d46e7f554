//! AES-128-CBC session encryption
//!
//! Sessions chain their IV across the backend's messages: the last
//! ciphertext block of each one becomes the IV for the next, and the IV it
//! replaced is kept so a frontend message that crossed one in flight can
//! still be read.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::CryptoError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_SIZE: usize = 16;

/// Encrypt with PKCS#7 padding under an explicit IV
pub fn symmetric_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt and strip PKCS#7 padding; bad padding is an error, never a panic
pub fn symmetric_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(ciphertext.len()));
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Padding)
}

/// Key material negotiated at handshake or rotation
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl SessionKey {
    /// Fresh random key and IV
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Key followed by IV, as carried in handshake blobs
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.key);
        out[16..].copy_from_slice(&self.iv);
        out
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != 32 {
            return Err(CryptoError::InvalidLength(data.len()));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&data[..16]);
        iv.copy_from_slice(&data[16..]);
        Ok(Self { key, iv })
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct Retired {
    key: [u8; 16],
    iv: [u8; 16],
    previous_iv: [u8; 16],
}

/// Which direction's ciphertext moves the IV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    /// Backend side: each sealed message moves the IV
    Outbound,
    /// Frontend side: each opened message moves the IV
    Inbound,
}

/// Stateful cipher for one encrypted session
///
/// Only backend output drives the IV chain. The backend moves its IV after
/// every encrypt and leaves it alone on decrypt; a frontend follows the same
/// chain by moving its IV after every decrypt and sealing its own messages
/// under whatever IV it last saw.
#[derive(Debug, Clone)]
pub struct SessionCipher {
    key: [u8; 16],
    iv: [u8; 16],
    previous_iv: [u8; 16],
    chain: Chain,
    /// Key and IV chain in force before the last rekey, until the peer moves over
    retired: Option<Retired>,
}

impl SessionCipher {
    /// Backend end of a session
    pub fn new(material: &SessionKey) -> Self {
        Self::with_chain(material, Chain::Outbound)
    }

    /// Frontend end of a session, following the backend's IV chain
    pub fn follower(material: &SessionKey) -> Self {
        Self::with_chain(material, Chain::Inbound)
    }

    fn with_chain(material: &SessionKey, chain: Chain) -> Self {
        Self {
            key: material.key,
            iv: material.iv,
            previous_iv: material.iv,
            chain,
            retired: None,
        }
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn previous_iv(&self) -> &[u8; 16] {
        &self.previous_iv
    }

    fn advance(&mut self, ciphertext: &[u8]) {
        if ciphertext.len() >= BLOCK_SIZE {
            let mut next = [0u8; 16];
            next.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
            self.previous_iv = self.iv;
            self.iv = next;
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = symmetric_encrypt(&self.key, &self.iv, plaintext);
        if self.chain == Chain::Outbound {
            self.advance(&ciphertext);
        }
        ciphertext
    }

    /// Decrypt, accepting the first candidate with valid padding
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_checked(ciphertext, |_| true)
    }

    /// Decrypt with the current IV, then the previous IV, then the retired
    /// key's two IVs. A candidate counts only if its padding is valid and
    /// `accept` takes the plaintext.
    ///
    /// A wrong IV garbles just the first block of a CBC message, so longer
    /// messages keep valid padding under the wrong IV. `accept` is how the
    /// caller tells a real plaintext from that.
    pub fn decrypt_checked(
        &mut self,
        ciphertext: &[u8],
        accept: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut last = CryptoError::Decrypt;
        let mut attempt = |key: &[u8; 16], iv: &[u8; 16]| {
            match symmetric_decrypt(key, iv, ciphertext) {
                Ok(plaintext) if accept(plaintext.as_slice()) => Some(plaintext),
                Ok(_) => None,
                Err(err) => {
                    last = err;
                    None
                }
            }
        };

        let current = attempt(&self.key, &self.iv)
            .or_else(|| attempt(&self.key, &self.previous_iv));
        if let Some(plaintext) = current {
            self.retired = None;
            if self.chain == Chain::Inbound {
                self.advance(ciphertext);
            }
            return Ok(plaintext);
        }

        let retired = self.retired.and_then(|old| {
            attempt(&old.key, &old.iv).or_else(|| attempt(&old.key, &old.previous_iv))
        });
        retired.ok_or(last)
    }

    /// Switch to new key material, keeping the old key for messages still in flight
    pub fn rekey(&mut self, material: &SessionKey) {
        self.retired = Some(Retired {
            key: self.key,
            iv: self.iv,
            previous_iv: self.previous_iv,
        });
        self.key = material.key;
        self.iv = material.iv;
        self.previous_iv = material.iv;
    }
}
