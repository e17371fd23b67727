//! Command envelope carried inside frame payloads
//!
//! ```text
//! | content length u32 LE | command code u16 LE | body |
//! ```
//!
//! `content length` counts the code plus the body.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const LENGTH_LEN: usize = 4;
const CODE_LEN: usize = 2;

/// Smallest valid envelope: length plus code with an empty body
pub const MIN_COMMAND_LEN: usize = LENGTH_LEN + CODE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    /// Join a named downstream group
    SetGroup = 0,
    Auth = 1,
    Error = 2,
    /// Heartbeat
    Tick = 3,
    /// Row change event
    Event = 4,
    /// Agent handshake from a follower
    Agent = 5,
    Stop = 6,
    Reload = 7,
    ShowMembers = 8,
    /// Stream position checkpoint
    Pos = 9,
}

impl CommandCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for CommandCode {
    type Error = CommandError;

    fn try_from(value: u16) -> Result<Self, CommandError> {
        Ok(match value {
            0 => CommandCode::SetGroup,
            1 => CommandCode::Auth,
            2 => CommandCode::Error,
            3 => CommandCode::Tick,
            4 => CommandCode::Event,
            5 => CommandCode::Agent,
            6 => CommandCode::Stop,
            7 => CommandCode::Reload,
            8 => CommandCode::ShowMembers,
            9 => CommandCode::Pos,
            other => return Err(CommandError::UnknownCode(other)),
        })
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SetGroup => "set-group",
            Self::Auth => "auth",
            Self::Error => "error",
            Self::Tick => "tick",
            Self::Event => "event",
            Self::Agent => "agent",
            Self::Stop => "stop",
            Self::Reload => "reload",
            Self::ShowMembers => "show-members",
            Self::Pos => "pos",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Command length {0} is shorter than the command code")]
    InvalidLength(usize),

    #[error("Unknown command code: {0}")]
    UnknownCode(u16),
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// A decoded command envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub code: CommandCode,
    pub body: Bytes,
}

impl Command {
    pub fn new(code: CommandCode, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    pub fn empty(code: CommandCode) -> Self {
        Self::new(code, Bytes::new())
    }

    pub fn encode(&self) -> Bytes {
        pack(self.code, &self.body)
    }

    /// Decode one envelope occupying the start of `buf`
    pub fn decode(buf: &[u8]) -> CommandResult<Self> {
        if buf.len() < MIN_COMMAND_LEN {
            return Err(CommandError::Truncated {
                needed: MIN_COMMAND_LEN,
                available: buf.len(),
            });
        }

        let content_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if content_len < CODE_LEN {
            return Err(CommandError::InvalidLength(content_len));
        }
        let total = LENGTH_LEN + content_len;
        if buf.len() < total {
            return Err(CommandError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let code = CommandCode::try_from(u16::from_le_bytes([buf[4], buf[5]]))?;
        Ok(Self {
            code,
            body: Bytes::copy_from_slice(&buf[MIN_COMMAND_LEN..total]),
        })
    }

    /// Body as UTF-8, replacing invalid sequences
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Encode a command envelope
pub fn pack(code: CommandCode, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_COMMAND_LEN + body.len());
    buf.put_u32_le((CODE_LEN + body.len()) as u32);
    buf.put_u16_le(code.as_u16());
    buf.put_slice(body);
    buf.freeze()
}
