//! Session key schedule
//!
//! An encrypted session swaps to fresh key material every
//! [`ROTATION_PINGS`] pings. The new key travels in a `Key` frame placed
//! at the head of the next flush, which is still sealed under the old key;
//! only after that flush does the cipher move over. The old key is kept
//! for inbound packets the frontend sent before it saw the rotation.

use bytes::Bytes;
use q2cloud_crypto::{SessionCipher, SessionKey};
use q2cloud_protocol::{ClientFrame, MessageWriter, ServerFrame};
use tracing::debug;

use crate::error::SessionError;

/// Pings between key rotations
pub const ROTATION_PINGS: u64 = 64;

#[derive(Debug)]
pub struct SessionCrypto {
    cipher: SessionCipher,
    /// Announced to the peer, installed after the next seal
    pending: Option<SessionKey>,
    rotations: u64,
}

impl SessionCrypto {
    pub fn new(material: &SessionKey) -> Self {
        Self {
            cipher: SessionCipher::new(material),
            pending: None,
            rotations: 0,
        }
    }

    /// Check if rotation is due after `ping_count` pings
    pub fn should_rotate(&self, ping_count: u64) -> bool {
        self.pending.is_none() && ping_count > 0 && ping_count % ROTATION_PINGS == 0
    }

    /// Generate the next key and put its `Key` frame in front of
    /// everything already queued in `outbound`
    pub fn stage(&mut self, outbound: &mut MessageWriter) {
        self.stage_with(SessionKey::generate(), outbound);
    }

    fn stage_with(&mut self, next: SessionKey, outbound: &mut MessageWriter) {
        let mut head = MessageWriter::new();
        ServerFrame::Key {
            key: next.key,
            iv: next.iv,
        }
        .encode(&mut head);
        outbound.prepend(head.as_slice());
        self.pending = Some(next);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Encrypt one flush, then install any staged key
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let sealed = self.cipher.encrypt(plaintext);
        if let Some(next) = self.pending.take() {
            self.cipher.rekey(&next);
            self.rotations += 1;
            debug!("Session key rotated ({} so far)", self.rotations);
        }
        sealed
    }

    /// Decrypt one inbound packet. A candidate IV only counts if the
    /// plaintext decodes as whole frames.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.cipher
            .decrypt_checked(ciphertext, |plain| {
                ClientFrame::decode_all(Bytes::copy_from_slice(plain)).is_ok()
            })
            .map_err(|_| SessionError::DecryptFail)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}
