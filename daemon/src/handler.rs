//! Frontend connection handler
//!
//! Runs the handshake on a freshly accepted socket, then the session
//! loop: one socket read is one packet, decrypted as a whole and
//! dispatched frame by frame; queued output is sealed and written after
//! every packet or whenever another task wakes the session.

use std::net::SocketAddr;
use std::sync::Arc;

use q2cloud_protocol::{ClientFrame, MAX_PACKET, MessageReader, MessageWriter, ServerFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{Flow, Session, dispatch};
use crate::error::SessionError;
use crate::frontend::SessionHandle;
use crate::metrics::METRICS;
use crate::registry::write_settings;
use crate::{Context, auth, unix_now};

/// Serve one frontend connection until it closes or `cancel` fires
pub async fn handle_connection(
    ctx: Arc<Context>,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay on {} failed: {}", peer, e);
    }

    let session = match handshake(&ctx, &mut stream, peer, cancel).await {
        Ok(session) => session,
        Err(SessionError::BadMagic(magic)) => {
            debug!("Connection from {} sent bad magic {:#010x}", peer, magic);
            return;
        }
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let frontend = session.frontend.clone();
    info!("Frontend {} trusted from {}", frontend.name(), peer);

    let reason = match run_session(&session, &mut stream).await {
        Ok(()) => "closed".to_string(),
        Err(e) => {
            debug!("Session {} for {} ended: {}", session.handle.id, frontend.name(), e);
            e.to_string()
        }
    };

    let now = unix_now();
    if frontend.state().end(session.handle.id, now) {
        frontend.update_settings(|s| s.last_seen = now);
        if let Err(e) = write_settings(frontend.dir(), &frontend.settings()) {
            warn!("Failed to persist {}: {}", frontend.name(), e);
        }
        frontend.audit().write(format!("session ended: {}", reason));
    }
    session.handle.cancel.cancel();
    METRICS.refresh(&ctx.registry);
    info!("Frontend {} disconnected ({})", frontend.name(), reason);
}

/// Greeting, challenge and proof; on success the session is installed on
/// its frontend and any previous session there is cancelled
async fn handshake(
    ctx: &Arc<Context>,
    stream: &mut TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<Session, SessionError> {
    let mut buf = vec![0u8; MAX_PACKET];

    let n = read_packet(stream, &mut buf).await?;
    let (challenged, ack) = match auth::greet(ctx, &buf[..n]) {
        Ok(greeted) => greeted,
        Err(e) => {
            METRICS.auth_failures.inc();
            if matches!(e, SessionError::Crypto(_) | SessionError::VersionTooOld { .. }) {
                stream.write_all(&auth::refusal(&e.to_string())).await?;
            }
            return Err(e);
        }
    };
    stream.write_all(&ack).await?;

    let n = read_packet(stream, &mut buf).await?;
    if let Err(e) = auth::authenticate(ctx, &challenged, &buf[..n]) {
        METRICS.auth_failures.inc();
        challenged
            .frontend
            .audit()
            .write(format!("refused: authentication from {} failed", peer));
        stream
            .write_all(&auth::refusal("authentication failed"))
            .await?;
        return Err(e);
    }

    let mut w = MessageWriter::new();
    ServerFrame::Trusted.encode(&mut w);
    stream.write_all(&w.take()).await?;

    let frontend = challenged.frontend.clone();
    let handle = SessionHandle {
        id: ctx.next_session_id(),
        cancel,
        peer,
    };
    let previous = {
        let mut state = frontend.state();
        let previous = state.session.take();
        state.begin(
            handle.clone(),
            &challenged.greeting,
            challenged.session_key.as_ref(),
            unix_now(),
        );
        state.queue(&ServerFrame::GetPlayers);
        previous
    };
    if let Some(previous) = previous {
        info!("{} reconnected, dropping session {}", frontend.name(), previous.id);
        previous.cancel.cancel();
    }

    METRICS.auth_successes.inc();
    METRICS.refresh(&ctx.registry);
    frontend.audit().write(format!(
        "session started from {} (version {}, encrypted {})",
        peer, challenged.greeting.version, challenged.greeting.encrypted
    ));

    Ok(Session {
        ctx: ctx.clone(),
        frontend,
        handle,
    })
}

async fn read_packet(stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, SessionError> {
    match stream.read(buf).await? {
        0 => Err(SessionError::Closed),
        n => Ok(n),
    }
}

async fn run_session(session: &Session, stream: &mut TcpStream) -> Result<(), SessionError> {
    let frontend = &session.frontend;
    let mut buf = vec![0u8; MAX_PACKET];

    loop {
        flush(session, stream).await?;

        tokio::select! {
            _ = session.handle.cancel.cancelled() => return Ok(()),
            _ = frontend.notified() => {}
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let packet = session.state()?.open(&buf[..n])?;
                if handle_packet(session, packet)? == Flow::Close {
                    flush(session, stream).await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Dispatch every frame in one decrypted packet
fn handle_packet(session: &Session, packet: bytes::Bytes) -> Result<Flow, SessionError> {
    let mut r = MessageReader::new(packet);
    while !r.is_empty() {
        let frame = ClientFrame::decode(&mut r)?;
        METRICS.frames_received.inc();

        match dispatch(session, frame, unix_now()) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => return Ok(Flow::Close),
            Err(e) if e.is_recoverable() => {
                debug!("{}: {}", session.frontend.name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Flow::Continue)
}

async fn flush(session: &Session, stream: &mut TcpStream) -> Result<(), SessionError> {
    let pending = session.state()?.drain();
    if let Some(bytes) = pending {
        stream.write_all(&bytes).await?;
    }
    Ok(())
}
