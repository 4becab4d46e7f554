//! q2cloud Protocol - Frame definitions and serialization
//!
//! This crate defines the wire format spoken between a Quake 2 frontend
//! (the in-process admin library) and the q2cloud backend:
//! - `MessageReader`/`MessageWriter`: little-endian primitive codec
//! - `ClientFrame`/`ServerFrame`: every opcode in both directions
//! - `Greeting`: the handshake opening frame
//! - `PlayerRecord` and userinfo parsing
//!
//! Nothing in here performs I/O; callers own the sockets.

mod auth;
mod frame;
mod player;

pub use auth::*;
pub use frame::*;
pub use player::*;
