//! Message Router request/reply codec.
//!
//! Request:  `service | path size (words) | path | data`
//! Reply:    `service | 0x00 | general status | additional status size | additional status | data`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::epath::{self, LOGICAL_FORMAT_MASK, LOGICAL_SEGMENT, SEGMENT_TYPE_MASK};
use crate::core::{Error, Result};

/// High bit of the service code marks a reply
pub const REPLY_MASK: u8 = 0x80;

/// Common service codes
pub mod service {
    pub const GET_ATTRIBUTE_ALL: u8 = 0x01;
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const FORWARD_OPEN: u8 = 0x54;
}

/// General status codes
pub mod general_status {
    pub const SUCCESS: u8 = 0x00;
    pub const PATH_SEGMENT_ERROR: u8 = 0x04;
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x08;
}

/// Object address carried in a request path; absent components are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CipPath {
    pub class: u32,
    pub instance: u32,
    pub attribute: u32,
}

impl CipPath {
    pub fn new(class: u32, instance: u32, attribute: u32) -> Self {
        CipPath { class, instance, attribute }
    }

    /// Encodes the path as padded logical segments
    pub fn to_epath(&self) -> Result<Vec<u8>> {
        epath::build_object_path(self.class, self.instance, self.attribute)
    }
}

/// A parsed CIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipPacket {
    pub service: u8,
    pub path: CipPath,
    /// `None` when nothing follows the path
    pub data: Option<Bytes>,
}

impl CipPacket {
    pub fn is_reply(&self) -> bool {
        self.service & REPLY_MASK != 0
    }
}

/// Parses a CIP request
///
/// Only 8-bit logical class (0x20), instance (0x24) and attribute (0x30)
/// segments are understood. Wider logical encodings are rejected with
/// [`Error::UnsupportedSegment`]; other 8-bit logical types are skipped.
pub fn parse_request(buf: &[u8]) -> Result<CipPacket> {
    if buf.len() < 2 {
        return Err(Error::malformed_request(format!("{} bytes, need service and path size", buf.len())));
    }

    let service = buf[0];
    let path_len = usize::from(buf[1]) * 2;
    let path_end = 2 + path_len;
    if buf.len() < path_end {
        return Err(Error::malformed_request(format!(
            "path of {} bytes overruns a {}-byte request",
            path_len,
            buf.len()
        )));
    }

    let mut path = CipPath::default();
    for segment in buf[2..path_end].chunks_exact(2) {
        let (kind, value) = (segment[0], u32::from(segment[1]));
        match kind {
            0x20 => path.class = value,
            0x24 => path.instance = value,
            0x30 => path.attribute = value,
            k if k & SEGMENT_TYPE_MASK == LOGICAL_SEGMENT && k & LOGICAL_FORMAT_MASK != 0 => {
                return Err(Error::UnsupportedSegment(k));
            }
            _ => {}
        }
    }

    let data = if buf.len() > path_end {
        Some(Bytes::copy_from_slice(&buf[path_end..]))
    } else {
        None
    };

    Ok(CipPacket { service, path, data })
}

/// Serializes a CIP request from an already encoded path
pub fn build_request(service: u8, path: &[u8], data: &[u8]) -> Result<Bytes> {
    if path.len() % 2 != 0 {
        return Err(Error::malformed_request("path length must be a whole number of words"));
    }
    let words = u8::try_from(path.len() / 2)
        .map_err(|_| Error::malformed_request("path longer than 255 words"))?;

    let mut buf = BytesMut::with_capacity(2 + path.len() + data.len());
    buf.put_u8(service);
    buf.put_u8(words);
    buf.put_slice(path);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Serializes a reply without additional status
pub fn build_reply(reply_service: u8, status: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u8(reply_service);
    buf.put_u8(0);
    buf.put_u8(status);
    buf.put_u8(0);
    buf.put_slice(data);
    buf.freeze()
}

/// Reply for a request the target cannot serve: the request's service with the
/// reply bit set and an empty body
pub fn build_error_reply(request_service: u8, status: u8) -> Bytes {
    build_reply(request_service | REPLY_MASK, status, &[])
}

/// A parsed Message Router reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouterReply {
    pub service: u8,
    pub status: u8,
    pub additional_status: Vec<u16>,
    pub data: Bytes,
}

impl MessageRouterReply {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        if cursor.remaining() < 4 {
            return Err(Error::malformed_request(format!("reply of {} bytes", buf.len())));
        }
        let service = cursor.get_u8();
        if service & REPLY_MASK == 0 {
            return Err(Error::malformed_request(format!("service 0x{:02X} is not a reply", service)));
        }
        let _reserved = cursor.get_u8();
        let status = cursor.get_u8();
        let words = usize::from(cursor.get_u8());
        if cursor.remaining() < words * 2 {
            return Err(Error::malformed_request("additional status overruns reply"));
        }
        let additional_status = (0..words).map(|_| cursor.get_u16_le()).collect();
        let data = Bytes::copy_from_slice(cursor);

        Ok(MessageRouterReply { service, status, additional_status, data })
    }

    /// The data of a successful reply, or the general status as an error
    pub fn into_result(self) -> Result<Bytes> {
        if self.status == general_status::SUCCESS {
            Ok(self.data)
        } else {
            Err(Error::CipStatus { service: self.service, status: self.status })
        }
    }
}
