//! Common Packet Format codec.
//!
//! A CPF buffer is an item count followed by that many self-delimiting
//! `(type id, length, data)` items. Item order is significant: an address item
//! always precedes its data item.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, Result};

/// CPF item type ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ItemType {
    Null = 0x00,
    ListIdentity = 0x0C,
    /// Connected address item, carries the connection id
    ConnectionBased = 0xA1,
    /// Connected data item, carries the sequence count and CIP message
    ConnectedTransportPacket = 0xB1,
    /// Unconnected data item
    Ucmm = 0xB2,
    ListServices = 0x100,
    SockaddrO2T = 0x8000,
    SockaddrT2O = 0x8001,
    SequencedAddrItem = 0x8002,
}

impl ItemType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ItemType {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self> {
        match code {
            0x00 => Ok(ItemType::Null),
            0x0C => Ok(ItemType::ListIdentity),
            0xA1 => Ok(ItemType::ConnectionBased),
            0xB1 => Ok(ItemType::ConnectedTransportPacket),
            0xB2 => Ok(ItemType::Ucmm),
            0x100 => Ok(ItemType::ListServices),
            0x8000 => Ok(ItemType::SockaddrO2T),
            0x8001 => Ok(ItemType::SockaddrT2O),
            0x8002 => Ok(ItemType::SequencedAddrItem),
            other => Err(Error::UnknownItemType(other)),
        }
    }
}

/// One CPF data item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    /// Raw type id, only validated when building
    pub type_id: u16,
    /// Data byte length as read from the wire
    pub length: u16,
    pub data: Bytes,
}

impl CpfItem {
    /// Creates an item; the length is taken from `data`
    pub fn new(item_type: ItemType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        CpfItem {
            type_id: item_type.code(),
            length: data.len() as u16,
            data,
        }
    }

    /// A zero-length Null address item
    pub fn null() -> Self {
        CpfItem::new(ItemType::Null, Bytes::new())
    }

    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::try_from(self.type_id).ok()
    }
}

/// Serializes items into a CPF buffer
///
/// Fails with [`Error::UnknownItemType`] if any item carries a type id outside
/// the item table. The length field is always written from the data itself.
pub fn build(items: &[CpfItem]) -> Result<Bytes> {
    let count = u16::try_from(items.len())
        .map_err(|_| Error::malformed_cpf(format!("{} items exceed the item count field", items.len())))?;

    let mut buf = BytesMut::with_capacity(2 + items.iter().map(|i| 4 + i.data.len()).sum::<usize>());
    buf.put_u16_le(count);

    for item in items {
        ItemType::try_from(item.type_id)?;
        let length = u16::try_from(item.data.len())
            .map_err(|_| Error::malformed_cpf(format!("item of {} bytes is too long", item.data.len())))?;

        buf.put_u16_le(item.type_id);
        buf.put_u16_le(length);
        if !item.data.is_empty() {
            buf.put_slice(&item.data);
        }
    }

    Ok(buf.freeze())
}

/// Parses a CPF buffer into its items, in wire order
///
/// Type ids are not checked against the item table.
pub fn parse(buf: &[u8]) -> Result<Vec<CpfItem>> {
    let mut cursor = buf;
    if cursor.remaining() < 2 {
        return Err(Error::malformed_cpf("missing item count"));
    }
    let count = cursor.get_u16_le();

    let mut items = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        if cursor.remaining() < 4 {
            return Err(Error::malformed_cpf(format!("item {} header truncated", index)));
        }
        let type_id = cursor.get_u16_le();
        let length = cursor.get_u16_le();
        if cursor.remaining() < usize::from(length) {
            return Err(Error::malformed_cpf(format!(
                "item {} declares {} bytes, {} remain",
                index,
                length,
                cursor.remaining()
            )));
        }
        let data = cursor.copy_to_bytes(usize::from(length));
        items.push(CpfItem { type_id, length, data });
    }

    Ok(items)
}
