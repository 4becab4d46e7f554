//! Handshake structures

use bytes::Bytes;

use crate::frame::{MessageReader, MessageWriter, ProtocolError};

/// "Q2AC" read as a little-endian long
pub const MAGIC: u32 = 1_128_346_193;

/// Oldest frontend protocol version accepted at handshake
pub const MIN_VERSION: u32 = 715;

/// Largest single packet read off a frontend socket
pub const MAX_PACKET: usize = 5000;

/// Size of an RSA-2048 modulus, and of every RSA ciphertext on the wire
pub const RSA_KEY_LENGTH: usize = 256;

/// Full greeting size for a frontend using a 36 character UUID:
/// magic, opcode, uuid + NUL, version, port, max players, encrypted, challenge
pub const GREETING_LENGTH: usize = 4 + 1 + 37 + 4 + 2 + 1 + 1 + RSA_KEY_LENGTH;

/// Smallest structurally valid greeting (single character identifier)
pub const GREETING_MIN_LENGTH: usize = 4 + 1 + 2 + 4 + 2 + 1 + 1 + RSA_KEY_LENGTH;

/// Length of the nonce the backend challenges a frontend with
pub const CHALLENGE_LENGTH: usize = 16;

/// AES-128 key and CBC IV lengths
pub const AES_KEY_LENGTH: usize = 16;
pub const AES_IV_LENGTH: usize = 16;

/// Severity sent with `ServerFrame::Error` when a handshake is refused
pub const ERROR_SEVERITY_FATAL: u32 = 500;

/// Consume and check the session magic
pub fn read_magic(r: &mut MessageReader) -> Result<(), ProtocolError> {
    let magic = r.read_long()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    Ok(())
}

pub fn write_magic(w: &mut MessageWriter) {
    w.write_long(MAGIC);
}

/// Greeting sent by a frontend right after the magic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Registry identifier of the frontend
    pub uuid: String,

    /// Frontend protocol version
    pub version: u32,

    /// UDP port the game server listens on
    pub port: u16,

    /// Player slot count (`maxclients`)
    pub max_players: u8,

    /// Frontend wants the session symmetrically encrypted
    pub encrypted: bool,

    /// Frontend nonce, RSA encrypted to the backend public key
    pub challenge: Bytes,
}

impl Greeting {
    /// Decode the payload following the `Hello` opcode
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let uuid = r.read_string()?;
        let version = r.read_long()?;
        let port = r.read_short()?;
        let max_players = r.read_byte()?;
        let encrypted = r.read_byte()? != 0;
        let challenge = r.read_data(RSA_KEY_LENGTH)?;

        Ok(Self {
            uuid,
            version,
            port,
            max_players,
            encrypted,
            challenge,
        })
    }

    /// Encode the payload following the `Hello` opcode
    pub fn encode(&self, w: &mut MessageWriter) {
        w.write_string(&self.uuid);
        w.write_long(self.version);
        w.write_short(self.port);
        w.write_byte(self.max_players);
        w.write_byte(u8::from(self.encrypted));
        w.write_data(&self.challenge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ClientFrame;

    fn greeting(uuid: &str) -> Greeting {
        Greeting {
            uuid: uuid.to_string(),
            version: 715,
            port: 27910,
            max_players: 16,
            encrypted: true,
            challenge: Bytes::from(vec![7u8; RSA_KEY_LENGTH]),
        }
    }

    #[test]
    fn test_magic_is_q2ac() {
        assert_eq!(MAGIC.to_le_bytes(), *b"Q2AC");
    }

    #[test]
    fn test_bad_magic() {
        let mut r = MessageReader::new(b"Q2AX".to_vec());
        assert!(matches!(read_magic(&mut r), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn test_greeting_length_with_full_uuid() {
        let mut w = MessageWriter::new();
        write_magic(&mut w);
        ClientFrame::Hello(greeting("3f2b8c44-9f0e-4d7c-a1b2-0c1d2e3f4a5b")).encode(&mut w);
        assert_eq!(w.len(), GREETING_LENGTH);

        let mut w = MessageWriter::new();
        write_magic(&mut w);
        ClientFrame::Hello(greeting("a")).encode(&mut w);
        assert_eq!(w.len(), GREETING_MIN_LENGTH);
    }

    #[test]
    fn test_greeting_decode() {
        let mut w = MessageWriter::new();
        write_magic(&mut w);
        ClientFrame::Hello(greeting("f1")).encode(&mut w);

        let mut r = MessageReader::new(w.take());
        read_magic(&mut r).unwrap();
        match ClientFrame::decode(&mut r).unwrap() {
            ClientFrame::Hello(g) => assert_eq!(g, greeting("f1")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_challenge() {
        let mut w = MessageWriter::new();
        greeting("f1").encode(&mut w);
        let bytes = w.take();
        let mut r = MessageReader::new(bytes.slice(..bytes.len() - 1));
        assert!(matches!(
            Greeting::decode(&mut r),
            Err(ProtocolError::ShortRead { .. })
        ));
    }
}
