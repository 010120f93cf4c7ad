//! Frame header encoding/decoding.
//!
//! ```text
//! +--------+--------+----------------+--------------------------------+
//! |  Ver   |  Cmd   |  Length (2 LE) |         Stream ID (4 LE)       |
//! +--------+--------+----------------+--------------------------------+
//! |                     Payload (PSH only)                            |
//! +-------------------------------------------------------------------+
//! ```

use super::MuxError;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Open a stream.
    Syn = 0,
    /// Close a stream.
    Fin = 1,
    /// Stream payload.
    Psh = 2,
    /// No-op.
    Nop = 3,
}

impl TryFrom<u8> for Cmd {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            other => Err(MuxError::BadCmd(other)),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: Cmd,
    pub len: u16,
    pub sid: u32,
}

impl FrameHeader {
    pub fn new(cmd: Cmd, sid: u32, len: u16) -> Self {
        Self { cmd, len, sid }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.cmd as u8;
        buf[2..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, MuxError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(MuxError::BadVersion(buf[0]));
        }
        let cmd = Cmd::try_from(buf[1])?;
        let len = u16::from_le_bytes([buf[2], buf[3]]);
        let sid = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self { cmd, len, sid })
    }
}
