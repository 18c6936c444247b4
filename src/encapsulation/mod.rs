//! Encapsulation layer
//! 
//! The 24-byte header, the Common Packet Format, and builders for the session
//! and data commands used in explicit messaging.

pub mod cpf;
pub mod header;

pub use self::cpf::{CpfItem, ItemType};
pub use self::header::{status_message, Command, EncapsulationHeader};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, Result, PROTOCOL_VERSION};

/// Interface handle (u32) plus timeout (u16) preceding the CPF in data commands
pub const COMMAND_DATA_PREFIX: usize = 6;

/// RegisterSession request data: protocol version and option flags
pub fn register_session_data(version: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(version);
    buf.put_u16_le(0);
    buf.freeze()
}

/// Reads the protocol version out of RegisterSession data
pub fn parse_register_session_data(data: &[u8]) -> Result<u16> {
    if data.len() < 4 {
        return Err(Error::protocol(format!(
            "RegisterSession data is {} bytes, expected 4",
            data.len()
        )));
    }
    Ok((&data[..2]).get_u16_le())
}

/// RegisterSession request
pub fn register_session(session_handle: u32) -> Result<Bytes> {
    EncapsulationHeader::new(
        Command::RegisterSession,
        session_handle,
        register_session_data(PROTOCOL_VERSION),
    )?
    .to_bytes()
}

/// UnregisterSession request
pub fn unregister_session(session_handle: u32) -> Result<Bytes> {
    EncapsulationHeader::new(Command::UnregisterSession, session_handle, Bytes::new())?.to_bytes()
}

/// Wraps a CIP message as an unconnected SendRRData packet
pub fn send_rr_data(session_handle: u32, data: &[u8], timeout_secs: u16) -> Result<Bytes> {
    let items = [
        CpfItem::null(),
        CpfItem::new(ItemType::Ucmm, Bytes::copy_from_slice(data)),
    ];
    command_packet(Command::SendRRData, session_handle, timeout_secs, &items)
}

/// Wraps a CIP message as a connected (class 3) SendUnitData packet
pub fn send_unit_data(
    session_handle: u32,
    data: &[u8],
    connection_id: u32,
    sequence: u16,
) -> Result<Bytes> {
    let mut transport = BytesMut::with_capacity(2 + data.len());
    transport.put_u16_le(sequence);
    transport.put_slice(data);

    let items = [
        CpfItem::new(ItemType::ConnectionBased, Bytes::copy_from_slice(&connection_id.to_le_bytes())),
        CpfItem::new(ItemType::ConnectedTransportPacket, transport.freeze()),
    ];
    // timeout shall be 0 for connected data
    command_packet(Command::SendUnitData, session_handle, 0, &items)
}

fn command_packet(
    command: Command,
    session_handle: u32,
    timeout_secs: u16,
    items: &[CpfItem],
) -> Result<Bytes> {
    let cpf = cpf::build(items)?;
    let mut buf = BytesMut::with_capacity(COMMAND_DATA_PREFIX + cpf.len());
    buf.put_u32_le(0); // interface handle, 0 for CIP
    buf.put_u16_le(timeout_secs);
    buf.put_slice(&cpf);
    EncapsulationHeader::new(command, session_handle, buf.freeze())?.to_bytes()
}

/// Strips the interface handle and timeout from SendRRData/SendUnitData data
/// and parses the CPF items that follow
pub fn parse_command_data(data: &[u8]) -> Result<Vec<CpfItem>> {
    if data.len() < COMMAND_DATA_PREFIX {
        return Err(Error::malformed_cpf(format!(
            "command data is {} bytes, shorter than the {}-byte prefix",
            data.len(),
            COMMAND_DATA_PREFIX
        )));
    }
    cpf::parse(&data[COMMAND_DATA_PREFIX..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_session_packet() {
        let packet = register_session(0).unwrap();
        let header = header::parse(&packet).unwrap();
        assert_eq!(header.command(), Some(Command::RegisterSession));
        assert_eq!(parse_register_session_data(&header.data).unwrap(), 1);
    }

    #[test]
    fn test_unregister_session_packet() {
        let header = header::parse(&unregister_session(0x42).unwrap()).unwrap();
        assert_eq!(header.command(), Some(Command::UnregisterSession));
        assert_eq!(header.session_handle, 0x42);
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_send_rr_data_packet() {
        let cip = [0x0E, 0x03, 0x20, 0x04, 0x24, 0x96, 0x30, 0x03];
        let header = header::parse(&send_rr_data(9, &cip, 10).unwrap()).unwrap();
        assert_eq!(header.command(), Some(Command::SendRRData));
        assert_eq!(&header.data[..6], &[0, 0, 0, 0, 10, 0]);

        let items = parse_command_data(&header.data).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_type(), Some(ItemType::Null));
        assert_eq!(items[1].item_type(), Some(ItemType::Ucmm));
        assert_eq!(&items[1].data[..], &cip);
    }

    #[test]
    fn test_send_unit_data_packet() {
        let header = header::parse(&send_unit_data(9, &[0x4C], 0xAABBCCDD, 0x0102).unwrap()).unwrap();
        assert_eq!(header.command(), Some(Command::SendUnitData));

        let items = parse_command_data(&header.data).unwrap();
        assert_eq!(items[0].item_type(), Some(ItemType::ConnectionBased));
        assert_eq!(&items[0].data[..], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(items[1].item_type(), Some(ItemType::ConnectedTransportPacket));
        assert_eq!(&items[1].data[..], &[0x02, 0x01, 0x4C]);
    }

    #[test]
    fn test_command_data_too_short() {
        assert!(parse_command_data(&[0, 0, 0]).is_err());
    }
}
