//! Frontend handshake
//!
//! ```text
//! ACCEPTED -> GREETED -> CHALLENGED -> TRUSTED
//! ```
//!
//! The frontend opens with the magic and a greeting carrying a nonce
//! encrypted to the backend key. The backend answers with the nonce's
//! SHA-256 and a challenge of its own (plus session key material when
//! asked for), all encrypted to the frontend's registered key. The
//! frontend proves possession of its private key by returning the
//! challenge's SHA-256 encrypted to the backend, or a signature over it.

use std::sync::Arc;

use bytes::Bytes;
use q2cloud_crypto::{PublicKey, SessionKey, constant_time_eq, random_bytes, sha256};
use q2cloud_protocol::{
    CHALLENGE_LENGTH, ClientFrame, ERROR_SEVERITY_FATAL, GREETING_MIN_LENGTH, Greeting,
    MIN_VERSION, MessageReader, MessageWriter, ServerFrame, read_magic,
};
use tracing::{debug, info, warn};

use crate::Context;
use crate::error::SessionError;
use crate::frontend::Frontend;

/// Handshake state between the greeting and the frontend's proof
pub struct Challenged {
    pub frontend: Arc<Frontend>,
    pub greeting: Greeting,
    pub session_key: Option<SessionKey>,
    public_key: PublicKey,
    server_challenge: [u8; CHALLENGE_LENGTH],
}

impl std::fmt::Debug for Challenged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenged")
            .field("frontend", &self.frontend.name())
            .field("greeting", &self.greeting)
            .finish_non_exhaustive()
    }
}

/// Process the first packet of a connection.
///
/// Returns the handshake state and the encoded `HelloAck` to write back.
pub fn greet(ctx: &Context, packet: &[u8]) -> Result<(Challenged, Bytes), SessionError> {
    let mut r = MessageReader::new(Bytes::copy_from_slice(packet));
    read_magic(&mut r)?;

    if packet.len() < GREETING_MIN_LENGTH {
        return Err(SessionError::BadGreeting(format!(
            "{} bytes, need at least {}",
            packet.len(),
            GREETING_MIN_LENGTH
        )));
    }

    let greeting = match ClientFrame::decode(&mut r) {
        Ok(ClientFrame::Hello(greeting)) => greeting,
        Ok(_) => return Err(SessionError::BadGreeting("expected hello".into())),
        Err(e) => return Err(SessionError::BadGreeting(e.to_string())),
    };

    let frontend = ctx.registry.find_by_id(&greeting.uuid)?;

    if greeting.version < MIN_VERSION {
        refuse_version(ctx, &frontend, greeting.version);
        return Err(SessionError::VersionTooOld {
            version: greeting.version,
            required: MIN_VERSION,
        });
    }

    let public_key = frontend.load_key()?;
    let nonce = ctx.private_key.decrypt(&greeting.challenge)?;
    let server_challenge = random_bytes::<CHALLENGE_LENGTH>();

    let session_key = greeting.encrypted.then(SessionKey::generate);

    let mut blob = Vec::with_capacity(32 + CHALLENGE_LENGTH + 32);
    blob.extend_from_slice(&sha256(&nonce));
    blob.extend_from_slice(&server_challenge);
    if let Some(key) = &session_key {
        blob.extend_from_slice(&key.to_bytes());
    }
    let sealed = public_key.encrypt(&blob)?;

    let mut w = MessageWriter::new();
    ServerFrame::HelloAck {
        blob: Bytes::from(sealed),
    }
    .encode(&mut w);

    debug!(
        "Greeted {} (version {}, encrypted {})",
        frontend.name(),
        greeting.version,
        greeting.encrypted
    );

    Ok((
        Challenged {
            frontend,
            greeting,
            session_key,
            public_key,
            server_challenge,
        },
        w.take(),
    ))
}

/// Check the frontend's answer to the server challenge
pub fn authenticate(
    ctx: &Context,
    challenged: &Challenged,
    packet: &[u8],
) -> Result<(), SessionError> {
    let mut r = MessageReader::new(Bytes::copy_from_slice(packet));
    let payload = match ClientFrame::decode(&mut r)? {
        ClientFrame::Auth { payload } => payload,
        _ => return Err(SessionError::BadGreeting("expected auth".into())),
    };

    let expected = sha256(&challenged.server_challenge);
    if let Ok(answer) = ctx.private_key.decrypt(&payload) {
        if constant_time_eq(&answer, &expected) {
            return Ok(());
        }
    }

    // frontends that sign instead of encrypting the hash
    challenged
        .public_key
        .verify(&challenged.server_challenge, &payload)?;
    Ok(())
}

/// Encoded `Error` frame sent before closing a refused handshake
pub fn refusal(message: &str) -> Bytes {
    let mut w = MessageWriter::new();
    ServerFrame::Error {
        severity: ERROR_SEVERITY_FATAL,
        message: message.to_string(),
    }
    .encode(&mut w);
    w.take()
}

fn refuse_version(ctx: &Context, frontend: &Frontend, version: u32) {
    warn!(
        "Frontend {} runs version {}, need {}",
        frontend.name(),
        version,
        MIN_VERSION
    );
    frontend.audit().write(format!(
        "refused: version {} below {}",
        version, MIN_VERSION
    ));

    let owner = frontend.settings().owner;
    if owner.is_empty() {
        return;
    }
    let notifier = ctx.services.notifier.clone();
    let subject = format!("{} needs an update", frontend.name());
    let body = format!(
        "Frontend {} connected with protocol version {}; version {} or later is required.",
        frontend.name(),
        version,
        MIN_VERSION
    );
    tokio::spawn(async move {
        notifier.send(&owner, &subject, &body).await;
    });
    info!("Notified {} of outdated frontend", frontend.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use q2cloud_crypto::PrivateKey;
    use q2cloud_protocol::{RSA_KEY_LENGTH, write_magic};

    fn hello(uuid: &str, version: u32, encrypted: bool, nonce: &[u8]) -> Vec<u8> {
        let backend = backend_private().public_key();
        let mut w = MessageWriter::new();
        write_magic(&mut w);
        ClientFrame::Hello(Greeting {
            uuid: uuid.into(),
            version,
            port: 27910,
            max_players: 16,
            encrypted,
            challenge: Bytes::from(backend.encrypt(nonce).unwrap()),
        })
        .encode(&mut w);
        w.take().to_vec()
    }

    fn open_ack(ack: &Bytes) -> Vec<u8> {
        match ServerFrame::decode_all(ack.clone()).unwrap().remove(0) {
            ServerFrame::HelloAck { blob } => frontend_private().decrypt(&blob).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn auth_frame(payload: Vec<u8>) -> Vec<u8> {
        let mut w = MessageWriter::new();
        ClientFrame::Auth {
            payload: Bytes::from(payload),
        }
        .encode(&mut w);
        w.take().to_vec()
    }

    #[tokio::test]
    async fn test_encrypted_handshake() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let nonce = [9u8; 32];
        let (challenged, ack) = greet(&fx.ctx, &hello("f1", 715, true, &nonce)).unwrap();

        let blob = open_ack(&ack);
        assert_eq!(blob.len(), 32 + 16 + 32);
        assert_eq!(&blob[..32], &sha256(&nonce));
        let key = SessionKey::from_slice(&blob[48..]).unwrap();
        assert_eq!(Some(key), challenged.session_key);

        let answer = backend_private()
            .public_key()
            .encrypt(&sha256(&blob[32..48]))
            .unwrap();
        authenticate(&fx.ctx, &challenged, &auth_frame(answer)).unwrap();
    }

    #[tokio::test]
    async fn test_plain_handshake_has_no_key() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let (challenged, ack) = greet(&fx.ctx, &hello("f1", 715, false, b"nonce")).unwrap();
        assert_eq!(open_ack(&ack).len(), 48);
        assert!(challenged.session_key.is_none());
    }

    #[tokio::test]
    async fn test_signed_answer_accepted() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let (challenged, ack) = greet(&fx.ctx, &hello("f1", 715, false, b"nonce")).unwrap();
        let blob = open_ack(&ack);

        let signature = frontend_private().sign(&blob[32..48]);
        assert_eq!(signature.len(), RSA_KEY_LENGTH);
        authenticate(&fx.ctx, &challenged, &auth_frame(signature)).unwrap();
    }

    #[tokio::test]
    async fn test_wrong_answer_rejected() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let (challenged, _) = greet(&fx.ctx, &hello("f1", 715, false, b"nonce")).unwrap();

        let wrong = backend_private()
            .public_key()
            .encrypt(&sha256(b"not the challenge"))
            .unwrap();
        assert!(matches!(
            authenticate(&fx.ctx, &challenged, &auth_frame(wrong)),
            Err(SessionError::Crypto(_))
        ));

        // signed by a key other than the registered one
        let other = PrivateKey::from_pem(OTHER_PRIVATE).unwrap();
        let forged = other.sign(b"anything");
        assert!(authenticate(&fx.ctx, &challenged, &auth_frame(forged)).is_err());
    }

    #[tokio::test]
    async fn test_version_refused_and_audited() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let err = greet(&fx.ctx, &hello("f1", 700, true, b"nonce")).unwrap_err();
        assert!(matches!(
            err,
            SessionError::VersionTooOld {
                version: 700,
                required: 715
            }
        ));
        let log = std::fs::read_to_string(fx.frontend("f1").dir().join("log")).unwrap();
        assert!(log.contains("version 700"));
    }

    #[tokio::test]
    async fn test_bad_openings() {
        let fx = Fixture::new(&[("f1", "dm")]);

        let mut packet = hello("f1", 715, false, b"nonce");
        packet[0] ^= 0xff;
        assert!(matches!(
            greet(&fx.ctx, &packet),
            Err(SessionError::BadMagic(_))
        ));

        let packet = hello("f1", 715, false, b"nonce");
        assert!(matches!(
            greet(&fx.ctx, &packet[..100]),
            Err(SessionError::BadGreeting(_))
        ));

        assert!(matches!(
            greet(&fx.ctx, &hello("nope", 715, false, b"nonce")),
            Err(SessionError::UnknownFrontend(_))
        ));
    }

    #[tokio::test]
    async fn test_undecryptable_nonce() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let mut packet = hello("f1", 715, false, b"nonce");
        let len = packet.len();
        packet[len - RSA_KEY_LENGTH..].fill(0x5a);
        assert!(matches!(
            greet(&fx.ctx, &packet),
            Err(SessionError::Crypto(_))
        ));
    }

    #[test]
    fn test_refusal_frame() {
        let frames = ServerFrame::decode_all(refusal("nope")).unwrap();
        assert_eq!(
            frames,
            vec![ServerFrame::Error {
                severity: 500,
                message: "nope".into()
            }]
        );
    }
}
