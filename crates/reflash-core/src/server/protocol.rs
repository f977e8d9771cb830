//! Wire protocol shared with instrumented client processes.
//!
//! Framing is deliberately primitive so the in-process client stays tiny:
//! little-endian `i32` tags and lengths, strings and blobs length-prefixed.
//! Tag values are fixed by deployed clients and must not be renumbered.

use std::io::{Read, Write};
use thiserror::Error;

/// Version a connecting client must present.
pub const INJECTION_VERSION: i32 = 4001;

/// Version token the interception shim must present.
pub const INTERCEPT_VERSION: &str = "5001";

/// Default port clients connect to.
pub const INJECTION_PORT: u16 = 8887;

/// Default port the interception shim relays invocations to.
pub const COMMANDS_PORT: u16 = 8896;

/// Terminator of the shim's relayed argument stream.
pub const ARGUMENTS_END: &str = "__END__";

/// Upper bound on any length prefix; larger values mean a desynchronized or
/// hostile peer.
const MAX_FRAME: i32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame length on wire: {0}")]
    InvalidLength(i32),

    #[error("Wire string was not UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Unknown command tag: {0}")]
    UnknownCommand(i32),

    #[error("Unknown response tag: {0}")]
    UnknownResponse(i32),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Commands the daemon sends to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    /// Log line to surface in the client's console.
    Log = 0,
    /// Load a dynamic module from a path on a shared filesystem.
    Load = 1,
    /// Load a dynamic module delivered as bytes (name + data follow).
    Inject = 2,
    /// Developer-tools path for the client to resolve its toolchain against.
    XcodePath = 3,
    /// Write a delivered file to the client's filesystem.
    SendFile = 4,
    /// Injection timing report, JSON payload.
    Metrics = 5,
    /// Handshake rejected.
    Invalid = 1000,
    Eof = -1,
}

impl Command {
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        Ok(match tag {
            0 => Self::Log,
            1 => Self::Load,
            2 => Self::Inject,
            3 => Self::XcodePath,
            4 => Self::SendFile,
            5 => Self::Metrics,
            1000 => Self::Invalid,
            -1 => Self::Eof,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Responses clients send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Response {
    /// Platform and architecture strings follow.
    Platform = 0,
    /// Last delivered module loaded successfully.
    Injected = 1,
    /// Last delivered module failed to load.
    Failed = 2,
    /// The client's temporary directory (its sandbox) follows.
    TmpPath = 3,
    /// Ask the daemon to re-run the symbol unhider.
    Unhide = 4,
    /// The client's project root follows.
    ProjectRoot = 5,
    Exit = -1,
}

impl Response {
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        Ok(match tag {
            0 => Self::Platform,
            1 => Self::Injected,
            2 => Self::Failed,
            3 => Self::TmpPath,
            4 => Self::Unhide,
            5 => Self::ProjectRoot,
            -1 => Self::Exit,
            other => return Err(ProtocolError::UnknownResponse(other)),
        })
    }
}

pub fn write_i32<W: Write>(writer: &mut W, value: i32) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_i32<R: Read>(reader: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_bytes<W: Write>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    write_i32(writer, data.len() as i32)?;
    writer.write_all(data)
}

pub fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_i32(reader)?;
    if !(0..=MAX_FRAME).contains(&len) {
        return Err(ProtocolError::InvalidLength(len));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

pub fn write_string<W: Write>(writer: &mut W, value: &str) -> std::io::Result<()> {
    write_bytes(writer, value.as_bytes())
}

pub fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    Ok(String::from_utf8(read_bytes(reader)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_i32_round_trip_is_little_endian() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 4001).unwrap();
        assert_eq!(buf, vec![0xa1, 0x0f, 0x00, 0x00]);
        assert_eq!(read_i32(&mut Cursor::new(buf)).unwrap(), 4001);
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "eval_injection_Foo_1.dylib").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_string(&mut cursor).unwrap(), "eval_injection_Foo_1.dylib");
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -7).unwrap();
        match read_string(&mut Cursor::new(buf)) {
            Err(ProtocolError::InvalidLength(-7)) => {}
            other => panic!("expected InvalidLength, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = Vec::new();
        write_i32(&mut buf, i32::MAX).unwrap();
        assert!(matches!(
            read_bytes(&mut Cursor::new(buf)),
            Err(ProtocolError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_command_tags_are_stable() {
        assert_eq!(Command::Log.tag(), 0);
        assert_eq!(Command::Load.tag(), 1);
        assert_eq!(Command::Inject.tag(), 2);
        assert_eq!(Command::XcodePath.tag(), 3);
        assert_eq!(Command::SendFile.tag(), 4);
        assert_eq!(Command::Metrics.tag(), 5);
        assert_eq!(Command::Invalid.tag(), 1000);
        assert_eq!(Command::Eof.tag(), -1);
        assert_eq!(Command::from_tag(2).unwrap(), Command::Inject);
        assert!(Command::from_tag(99).is_err());
    }

    #[test]
    fn test_response_tags_are_stable() {
        assert_eq!(Response::Platform.tag(), 0);
        assert_eq!(Response::Injected.tag(), 1);
        assert_eq!(Response::Failed.tag(), 2);
        assert_eq!(Response::TmpPath.tag(), 3);
        assert_eq!(Response::Unhide.tag(), 4);
        assert_eq!(Response::ProjectRoot.tag(), 5);
        assert_eq!(Response::Exit.tag(), -1);
        assert_eq!(Response::from_tag(4).unwrap(), Response::Unhide);
        assert!(Response::from_tag(42).is_err());
    }
}
