//! Encapsulation header codec.
//!
//! Every EtherNet/IP command travels inside a fixed 24-byte header followed by
//! `length` bytes of command data. All integers are little-endian:
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 2    | command        |
//! | 2      | 2    | length         |
//! | 4      | 4    | session handle |
//! | 8      | 4    | status         |
//! | 12     | 8    | sender context |
//! | 20     | 4    | options        |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, Result, ENCAPSULATION_HEADER_SIZE};

/// Encapsulation command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Nop = 0x00,
    ListServices = 0x04,
    ListIdentity = 0x63,
    ListInterfaces = 0x64,
    /// Begin session
    RegisterSession = 0x65,
    /// Close session
    UnregisterSession = 0x66,
    /// Unconnected (UCMM) data
    SendRRData = 0x6F,
    /// Connected data
    SendUnitData = 0x70,
    IndicateStatus = 0x72,
    Cancel = 0x73,
}

impl Command {
    /// Wire value of the command
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self> {
        match code {
            0x00 => Ok(Command::Nop),
            0x04 => Ok(Command::ListServices),
            0x63 => Ok(Command::ListIdentity),
            0x64 => Ok(Command::ListInterfaces),
            0x65 => Ok(Command::RegisterSession),
            0x66 => Ok(Command::UnregisterSession),
            0x6F => Ok(Command::SendRRData),
            0x70 => Ok(Command::SendUnitData),
            0x72 => Ok(Command::IndicateStatus),
            0x73 => Ok(Command::Cancel),
            other => Err(Error::InvalidCommand(other)),
        }
    }
}

/// Encapsulation status codes
pub mod status {
    pub const SUCCESS: u32 = 0x00;
    pub const INVALID_COMMAND: u32 = 0x01;
    pub const INSUFFICIENT_MEMORY: u32 = 0x02;
    pub const MALFORMED_PACKET: u32 = 0x03;
    pub const INVALID_SESSION_HANDLE: u32 = 0x64;
    pub const INVALID_LENGTH: u32 = 0x65;
    pub const UNSUPPORTED_PROTOCOL_REVISION: u32 = 0x69;
}

/// Translates an encapsulation status code into a readable message
pub fn status_message(code: u32) -> String {
    let msg = match code {
        status::SUCCESS => "SUCCESS",
        status::INVALID_COMMAND => "FAIL: Sender issued an invalid encapsulation command.",
        status::INSUFFICIENT_MEMORY => "FAIL: Insufficient memory resources to handle command.",
        status::MALFORMED_PACKET => "FAIL: Poorly formed or incorrect data in encapsulation packet.",
        status::INVALID_SESSION_HANDLE => "FAIL: Originator used an invalid session handle.",
        status::INVALID_LENGTH => "FAIL: Target received a message of invalid length.",
        status::UNSUPPORTED_PROTOCOL_REVISION => "FAIL: Unsupported encapsulation protocol revision.",
        other => return format!("FAIL: General failure <{}> occurred.", other),
    };
    msg.to_string()
}

/// A parsed (or to-be-built) encapsulation packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulationHeader {
    /// Raw command code, not validated on parse
    pub command: u16,
    /// Byte length of `data`
    pub length: u16,
    /// Zero until a session is registered
    pub session_handle: u32,
    /// Zero on success
    pub status: u32,
    /// Opaque, echoed by the target
    pub sender_context: [u8; 8],
    /// Always zero
    pub options: u32,
    /// Command-specific data
    pub data: Bytes,
}

impl EncapsulationHeader {
    /// Creates a header for a known command with a zero status and context
    pub fn new(command: Command, session_handle: u32, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let length = u16::try_from(data.len())
            .map_err(|_| Error::protocol(format!("payload of {} bytes exceeds 65535", data.len())))?;
        Ok(EncapsulationHeader {
            command: command.code(),
            length,
            session_handle,
            status: status::SUCCESS,
            sender_context: [0u8; 8],
            options: 0,
            data,
        })
    }

    /// The command, if it is one of the known codes
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    /// Readable form of the status code
    pub fn status_message(&self) -> String {
        status_message(self.status)
    }

    /// Serializes the header followed by its data
    pub fn to_bytes(&self) -> Result<Bytes> {
        Command::try_from(self.command)?;
        if usize::from(self.length) != self.data.len() {
            return Err(Error::protocol(format!(
                "length field {} does not match {} payload bytes",
                self.length,
                self.data.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(ENCAPSULATION_HEADER_SIZE + self.data.len());
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.session_handle);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.sender_context);
        buf.put_u32_le(self.options);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }
}

/// Builds an encapsulation packet for `command`
///
/// Fails with [`Error::InvalidCommand`] for codes outside the command table.
pub fn build(command: u16, session_handle: u32, payload: &[u8]) -> Result<Bytes> {
    let command = Command::try_from(command)?;
    EncapsulationHeader::new(command, session_handle, Bytes::copy_from_slice(payload))?.to_bytes()
}

/// Parses one encapsulation packet
///
/// The buffer must hold the 24-byte header and at least `length` payload bytes;
/// bytes past the payload are ignored.
pub fn parse(buf: &[u8]) -> Result<EncapsulationHeader> {
    if buf.len() < ENCAPSULATION_HEADER_SIZE {
        return Err(Error::MalformedHeader(buf.len()));
    }

    let mut cursor = &buf[..ENCAPSULATION_HEADER_SIZE];
    let command = cursor.get_u16_le();
    let length = cursor.get_u16_le();
    let session_handle = cursor.get_u32_le();
    let status = cursor.get_u32_le();
    let mut sender_context = [0u8; 8];
    cursor.copy_to_slice(&mut sender_context);
    let options = cursor.get_u32_le();

    let available = buf.len() - ENCAPSULATION_HEADER_SIZE;
    let expected = usize::from(length);
    if available < expected {
        return Err(Error::TruncatedPayload { expected, actual: available });
    }

    let start = ENCAPSULATION_HEADER_SIZE;
    Ok(EncapsulationHeader {
        command,
        length,
        session_handle,
        status,
        sender_context,
        options,
        data: Bytes::copy_from_slice(&buf[start..start + expected]),
    })
}
