//! EPath segment encoding.
//!
//! Logical segments address CIP objects (class, instance, attribute, ...). The
//! segment header byte is `LOGICAL_SEGMENT | type | format`, where the format
//! selects an 8, 16 or 32 bit address. In the padded form a pad byte follows the
//! header byte for 16 and 32 bit addresses so the value stays word aligned.

use bytes::{BufMut, BytesMut};

use crate::core::{Error, Result};

/// Segment type bits (upper three bits of the segment byte)
pub const PORT_SEGMENT: u8 = 0 << 5;
pub const LOGICAL_SEGMENT: u8 = 1 << 5;

/// Mask isolating the segment type bits
pub const SEGMENT_TYPE_MASK: u8 = 0b1110_0000;

/// Mask isolating the logical format bits
pub const LOGICAL_FORMAT_MASK: u8 = 0b0000_0011;

/// Logical segment types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogicalType {
    ClassId = 0 << 2,
    InstanceId = 1 << 2,
    MemberId = 2 << 2,
    ConnPoint = 3 << 2,
    AttributeId = 4 << 2,
    Special = 5 << 2,
    ServiceId = 6 << 2,
}

impl TryFrom<u8> for LogicalType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(LogicalType::ClassId),
            0x04 => Ok(LogicalType::InstanceId),
            0x08 => Ok(LogicalType::MemberId),
            0x0C => Ok(LogicalType::ConnPoint),
            0x10 => Ok(LogicalType::AttributeId),
            0x14 => Ok(LogicalType::Special),
            0x18 => Ok(LogicalType::ServiceId),
            other => Err(Error::InvalidSegmentType(other)),
        }
    }
}

/// Builds one logical segment using the narrowest address width
///
/// `address` must be non-zero. With `padded` set, 16 and 32 bit values are
/// preceded by a pad byte.
pub fn build_logical_segment(segment_type: LogicalType, address: u32, padded: bool) -> Result<Vec<u8>> {
    if address == 0 {
        return Err(Error::InvalidAddress(address));
    }

    let mut buf = BytesMut::with_capacity(6);
    let header = LOGICAL_SEGMENT | segment_type as u8;

    if address <= 0xFF {
        buf.put_u8(header);
        buf.put_u8(address as u8);
    } else if address <= 0xFFFF {
        buf.put_u8(header | 1);
        if padded {
            buf.put_u8(0);
        }
        buf.put_u16_le(address as u16);
    } else {
        buf.put_u8(header | 2);
        if padded {
            buf.put_u8(0);
        }
        buf.put_u32_le(address);
    }

    Ok(buf.to_vec())
}

/// Same as [`build_logical_segment`] for a raw type code
pub fn build_logical_segment_raw(segment_type: u8, address: u32, padded: bool) -> Result<Vec<u8>> {
    build_logical_segment(LogicalType::try_from(segment_type)?, address, padded)
}

/// Port segment routing a message out of `port` to the given link address
///
/// Only the short form is produced: port numbers up to 14 and one-byte link
/// addresses, padded to an even length.
pub fn build_port_segment(port: u8, link: &[u8]) -> Result<Vec<u8>> {
    if port == 0 || port > 14 {
        return Err(Error::malformed_request(format!("port {} needs the extended port format", port)));
    }
    if link.is_empty() {
        return Err(Error::malformed_request("port segment without a link address"));
    }

    let mut buf = Vec::with_capacity(2 + link.len() + 1);
    if link.len() == 1 {
        buf.push(PORT_SEGMENT | port);
        buf.push(link[0]);
    } else {
        let size = u8::try_from(link.len())
            .map_err(|_| Error::malformed_request("link address longer than 255 bytes"))?;
        buf.push(PORT_SEGMENT | 0x10 | port);
        buf.push(size);
        buf.extend_from_slice(link);
        if buf.len() % 2 != 0 {
            buf.push(0);
        }
    }
    Ok(buf)
}

/// Padded class/instance[/attribute] path; zero components are omitted
pub fn build_object_path(class: u32, instance: u32, attribute: u32) -> Result<Vec<u8>> {
    let mut path = build_logical_segment(LogicalType::ClassId, class, true)?;
    if instance != 0 {
        path.extend(build_logical_segment(LogicalType::InstanceId, instance, true)?);
    }
    if attribute != 0 {
        path.extend(build_logical_segment(LogicalType::AttributeId, attribute, true)?);
    }
    Ok(path)
}
