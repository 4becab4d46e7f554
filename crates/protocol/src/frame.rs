//! Frame codec and opcodes
//!
//! Every value on the wire is little-endian. Strings are NUL terminated and
//! variable payloads carry their own length prefix where one exists.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::auth::Greeting;
use crate::player::PlayerRecord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Short read: wanted {wanted} bytes, {remaining} remaining")]
    ShortRead { wanted: usize, remaining: usize },

    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("Unterminated string")]
    UnterminatedString,
}

/// Read side of a frame: an owned buffer with a cursor that only moves forward.
#[derive(Debug, Clone, Default)]
pub struct MessageReader {
    buf: Bytes,
}

impl MessageReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { buf: data.into() }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, wanted: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < wanted {
            return Err(ProtocolError::ShortRead {
                wanted,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_short(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_long(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Read up to and including the next NUL. Quake strings are not always
    /// valid UTF-8, so invalid sequences are replaced rather than rejected.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString)?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn read_data(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }
}

/// Write side of a frame. Appends never fail; the buffer grows as needed.
#[derive(Debug, Clone, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_byte(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_short(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_long(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_string(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn write_data(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Put `data` in front of everything already buffered
    pub fn prepend(&mut self, data: &[u8]) {
        let mut joined = BytesMut::with_capacity(data.len() + self.buf.len());
        joined.put_slice(data);
        joined.put_slice(&self.buf);
        self.buf = joined;
    }

    /// Hand out the buffered bytes and reset for the next flush
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Opcodes sent by a frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    Hello = 0,
    Quit = 1,
    Connect = 2,
    Disconnect = 3,
    PlayerList = 4,
    PlayerUpdate = 5,
    Print = 6,
    Command = 7,
    Frag = 8,
    Map = 9,
    Ping = 10,
    Auth = 11,
}

impl TryFrom<u8> for ClientOp {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Hello,
            1 => Self::Quit,
            2 => Self::Connect,
            3 => Self::Disconnect,
            4 => Self::PlayerList,
            5 => Self::PlayerUpdate,
            6 => Self::Print,
            7 => Self::Command,
            8 => Self::Frag,
            9 => Self::Map,
            10 => Self::Ping,
            11 => Self::Auth,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Opcodes sent by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    HelloAck = 0,
    Error = 1,
    Pong = 2,
    Command = 3,
    SayClient = 4,
    SayAll = 5,
    Trusted = 6,
    Key = 7,
    GetPlayers = 8,
}

impl TryFrom<u8> for ServerOp {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => ServerOp::HelloAck,
            1 => ServerOp::Error,
            2 => ServerOp::Pong,
            3 => ServerOp::Command,
            4 => ServerOp::SayClient,
            5 => ServerOp::SayAll,
            6 => ServerOp::Trusted,
            7 => ServerOp::Key,
            8 => ServerOp::GetPlayers,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Sub-opcodes carried by `ClientOp::Command`
pub const SUBCMD_TELEPORT: u8 = 0;
pub const SUBCMD_INVITE: u8 = 1;

/// Quake 2 print levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrintLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Chat = 3,
}

impl PrintLevel {
    /// Unknown levels are treated as low priority noise
    pub fn from_byte(v: u8) -> Self {
        match v {
            1 => Self::Medium,
            2 => Self::High,
            3 => Self::Chat,
            _ => Self::Low,
        }
    }
}

/// Player-invoked command carried by `ClientOp::Command`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    Teleport { client_id: u8, target: String },
    Invite { client_id: u8, text: String },
    Unknown(u8),
}

/// A fully parsed inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Hello(Greeting),
    Quit,
    Connect(PlayerRecord),
    Disconnect { client_id: u8 },
    PlayerList(Vec<PlayerRecord>),
    PlayerUpdate { client_id: u8, userinfo: String },
    Print { level: PrintLevel, text: String },
    Command(PlayerCommand),
    Frag { victim: u8, attacker: u8 },
    Map { name: String },
    Ping,
    Auth { payload: Bytes },
}

impl ClientFrame {
    /// Decode one frame from the front of `r`
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let op = ClientOp::try_from(r.read_byte()?)?;
        Ok(match op {
            ClientOp::Hello => Self::Hello(Greeting::decode(r)?),
            ClientOp::Quit => Self::Quit,
            ClientOp::Connect => Self::Connect(PlayerRecord::decode(r)?),
            ClientOp::Disconnect => Self::Disconnect {
                client_id: r.read_byte()?,
            },
            ClientOp::PlayerList => {
                let count = r.read_byte()?;
                let mut players = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    players.push(PlayerRecord::decode(r)?);
                }
                Self::PlayerList(players)
            }
            ClientOp::PlayerUpdate => Self::PlayerUpdate {
                client_id: r.read_byte()?,
                userinfo: r.read_string()?,
            },
            ClientOp::Print => Self::Print {
                level: PrintLevel::from_byte(r.read_byte()?),
                text: r.read_string()?,
            },
            ClientOp::Command => {
                let sub = r.read_byte()?;
                Self::Command(match sub {
                    SUBCMD_TELEPORT => PlayerCommand::Teleport {
                        client_id: r.read_byte()?,
                        target: r.read_string()?,
                    },
                    SUBCMD_INVITE => PlayerCommand::Invite {
                        client_id: r.read_byte()?,
                        text: r.read_string()?,
                    },
                    other => PlayerCommand::Unknown(other),
                })
            }
            ClientOp::Frag => Self::Frag {
                victim: r.read_byte()?,
                attacker: r.read_byte()?,
            },
            ClientOp::Map => Self::Map {
                name: r.read_string()?,
            },
            ClientOp::Ping => Self::Ping,
            ClientOp::Auth => {
                let len = r.read_short()? as usize;
                Self::Auth {
                    payload: r.read_data(len)?,
                }
            }
        })
    }

    /// Decode every frame in one inbound packet
    pub fn decode_all(data: impl Into<Bytes>) -> Result<Vec<Self>, ProtocolError> {
        let mut r = MessageReader::new(data);
        let mut frames = Vec::new();
        while !r.is_empty() {
            frames.push(Self::decode(&mut r)?);
        }
        Ok(frames)
    }

    /// Encode this frame the way a frontend would send it
    pub fn encode(&self, w: &mut MessageWriter) {
        match self {
            Self::Hello(greeting) => {
                w.write_byte(ClientOp::Hello as u8);
                greeting.encode(w);
            }
            Self::Quit => w.write_byte(ClientOp::Quit as u8),
            Self::Connect(player) => {
                w.write_byte(ClientOp::Connect as u8);
                player.encode(w);
            }
            Self::Disconnect { client_id } => {
                w.write_byte(ClientOp::Disconnect as u8);
                w.write_byte(*client_id);
            }
            Self::PlayerList(players) => {
                w.write_byte(ClientOp::PlayerList as u8);
                w.write_byte(players.len() as u8);
                for p in players {
                    p.encode(w);
                }
            }
            Self::PlayerUpdate {
                client_id,
                userinfo,
            } => {
                w.write_byte(ClientOp::PlayerUpdate as u8);
                w.write_byte(*client_id);
                w.write_string(userinfo);
            }
            Self::Print { level, text } => {
                w.write_byte(ClientOp::Print as u8);
                w.write_byte(*level as u8);
                w.write_string(text);
            }
            Self::Command(cmd) => {
                w.write_byte(ClientOp::Command as u8);
                match cmd {
                    PlayerCommand::Teleport { client_id, target } => {
                        w.write_byte(SUBCMD_TELEPORT);
                        w.write_byte(*client_id);
                        w.write_string(target);
                    }
                    PlayerCommand::Invite { client_id, text } => {
                        w.write_byte(SUBCMD_INVITE);
                        w.write_byte(*client_id);
                        w.write_string(text);
                    }
                    PlayerCommand::Unknown(sub) => w.write_byte(*sub),
                }
            }
            Self::Frag { victim, attacker } => {
                w.write_byte(ClientOp::Frag as u8);
                w.write_byte(*victim);
                w.write_byte(*attacker);
            }
            Self::Map { name } => {
                w.write_byte(ClientOp::Map as u8);
                w.write_string(name);
            }
            Self::Ping => w.write_byte(ClientOp::Ping as u8),
            Self::Auth { payload } => {
                w.write_byte(ClientOp::Auth as u8);
                w.write_short(payload.len() as u16);
                w.write_data(payload);
            }
        }
    }
}

/// A fully parsed outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    HelloAck { blob: Bytes },
    Error { severity: u32, message: String },
    Pong,
    /// Console command executed by the game server
    Command { command: String },
    SayClient { client_id: u8, level: PrintLevel, text: String },
    SayAll { level: PrintLevel, text: String },
    Trusted,
    /// New session key followed by the new IV
    Key { key: [u8; 16], iv: [u8; 16] },
    GetPlayers,
}

impl ServerFrame {
    pub fn encode(&self, w: &mut MessageWriter) {
        match self {
            Self::HelloAck { blob } => {
                w.write_byte(ServerOp::HelloAck as u8);
                w.write_short(blob.len() as u16);
                w.write_data(blob);
            }
            Self::Error { severity, message } => {
                w.write_byte(ServerOp::Error as u8);
                w.write_long(*severity);
                w.write_string(message);
            }
            Self::Pong => w.write_byte(ServerOp::Pong as u8),
            Self::Command { command } => {
                w.write_byte(ServerOp::Command as u8);
                w.write_string(command);
            }
            Self::SayClient {
                client_id,
                level,
                text,
            } => {
                w.write_byte(ServerOp::SayClient as u8);
                w.write_byte(*client_id);
                w.write_byte(*level as u8);
                w.write_string(text);
            }
            Self::SayAll { level, text } => {
                w.write_byte(ServerOp::SayAll as u8);
                w.write_byte(*level as u8);
                w.write_string(text);
            }
            Self::Trusted => w.write_byte(ServerOp::Trusted as u8),
            Self::Key { key, iv } => {
                w.write_byte(ServerOp::Key as u8);
                w.write_data(key);
                w.write_data(iv);
            }
            Self::GetPlayers => w.write_byte(ServerOp::GetPlayers as u8),
        }
    }

    /// Decode one frame, as a frontend would on its side of the socket
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let op = ServerOp::try_from(r.read_byte()?)?;
        Ok(match op {
            ServerOp::HelloAck => {
                let len = r.read_short()? as usize;
                Self::HelloAck {
                    blob: r.read_data(len)?,
                }
            }
            ServerOp::Error => Self::Error {
                severity: r.read_long()?,
                message: r.read_string()?,
            },
            ServerOp::Pong => Self::Pong,
            ServerOp::Command => Self::Command {
                command: r.read_string()?,
            },
            ServerOp::SayClient => Self::SayClient {
                client_id: r.read_byte()?,
                level: PrintLevel::from_byte(r.read_byte()?),
                text: r.read_string()?,
            },
            ServerOp::SayAll => Self::SayAll {
                level: PrintLevel::from_byte(r.read_byte()?),
                text: r.read_string()?,
            },
            ServerOp::Trusted => Self::Trusted,
            ServerOp::Key => {
                let mut key = [0u8; 16];
                let mut iv = [0u8; 16];
                key.copy_from_slice(&r.read_data(16)?);
                iv.copy_from_slice(&r.read_data(16)?);
                Self::Key { key, iv }
            }
            ServerOp::GetPlayers => Self::GetPlayers,
        })
    }

    /// Decode every frame in `data`
    pub fn decode_all(data: impl Into<Bytes>) -> Result<Vec<Self>, ProtocolError> {
        let mut r = MessageReader::new(data);
        let mut frames = Vec::new();
        while !r.is_empty() {
            frames.push(Self::decode(&mut r)?);
        }
        Ok(frames)
    }
}
