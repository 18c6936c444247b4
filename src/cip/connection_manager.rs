//! Connection Manager payloads for ForwardOpen and ForwardClose.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::core::{Error, Result};

/// ForwardOpen request payload length
pub const FORWARD_OPEN_LEN: usize = 35;

/// ForwardClose request payload length
pub const FORWARD_CLOSE_LEN: usize = 10;

/// Transport class 3, application object, target is a server
pub const TRANSPORT_CLASS_TRIGGER: u8 = 0xA3;

/// Minimum accepted timeout for ForwardOpen/ForwardClose, exclusive
pub const MIN_CONNECTION_TIMEOUT_MS: u64 = 900;

/// Minimum O->T requested packet interval
pub const MIN_RPI: u32 = 8000;

/// Largest connection size in the parameters word
pub const MAX_CONNECTION_SIZE: u16 = 10000;

/// Redundant owner bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Owner {
    Exclusive = 0,
    Multiple = 1,
}

/// Connection type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    Null = 0,
    Multicast = 1,
    PointToPoint = 2,
    Reserved = 3,
}

/// Priority bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    High = 1,
    Scheduled = 2,
    Urgent = 3,
}

/// Fixed or variable size bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FixedVar {
    Fixed = 0,
    Variable = 1,
}

impl TryFrom<u8> for Owner {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Owner::Exclusive),
            1 => Ok(Owner::Multiple),
            other => Err(Error::InvalidOwner(other)),
        }
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ConnectionType::Null),
            1 => Ok(ConnectionType::Multicast),
            2 => Ok(ConnectionType::PointToPoint),
            3 => Ok(ConnectionType::Reserved),
            other => Err(Error::InvalidConnectionType(other)),
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Scheduled),
            3 => Ok(Priority::Urgent),
            other => Err(Error::InvalidPriority(other)),
        }
    }
}

impl TryFrom<u8> for FixedVar {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(FixedVar::Fixed),
            1 => Ok(FixedVar::Variable),
            other => Err(Error::InvalidFixedVar(other)),
        }
    }
}

/// Packs the network connection parameters word
///
/// `owner<<15 | type<<13 | priority<<10 | fixed_var<<9 | size`, with
/// `1 < size <= 10000`.
pub fn build_connection_parameters(
    owner: Owner,
    connection_type: ConnectionType,
    priority: Priority,
    fixed_var: FixedVar,
    size: u16,
) -> Result<u16> {
    if size <= 1 || size > MAX_CONNECTION_SIZE {
        return Err(Error::InvalidSize(size));
    }
    Ok((owner as u16) << 15
        | (connection_type as u16) << 13
        | (priority as u16) << 10
        | (fixed_var as u16) << 9
        | size)
}

/// [`build_connection_parameters`] from raw field values
pub fn build_connection_parameters_raw(
    owner: u8,
    connection_type: u8,
    priority: u8,
    fixed_var: u8,
    size: u16,
) -> Result<u16> {
    build_connection_parameters(
        Owner::try_from(owner)?,
        ConnectionType::try_from(connection_type)?,
        Priority::try_from(priority)?,
        FixedVar::try_from(fixed_var)?,
        size,
    )
}

/// Timeout expressed as `ticks * 2^time_tick` milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedTimeout {
    pub time_tick: u8,
    pub ticks: u8,
}

impl EncodedTimeout {
    /// The timeout this encoding stands for
    pub fn millis(&self) -> u64 {
        u64::from(self.ticks) << self.time_tick
    }
}

/// Finds the (time_tick, ticks) pair closest to `requested_ms`
///
/// Every pair is scanned, time_tick ascending then ticks ascending, and on
/// equal distance the later pair wins. Peers depend on this exact choice.
pub fn encode_timeout(requested_ms: u64) -> Result<EncodedTimeout> {
    if requested_ms == 0 {
        return Err(Error::InvalidTimeout("timeout must be positive".to_string()));
    }

    let mut best = EncodedTimeout { time_tick: 0, ticks: 0 };
    let mut best_diff = u64::MAX;
    for time_tick in 0u8..16 {
        for ticks in 1u8..=255 {
            let diff = requested_ms.abs_diff(u64::from(ticks) << time_tick);
            if diff <= best_diff {
                best_diff = diff;
                best = EncodedTimeout { time_tick, ticks };
            }
        }
    }
    Ok(best)
}

/// Encoding of the connection timeout multiplier
pub fn timeout_multiplier_code(multiplier: u32) -> Result<u8> {
    match multiplier {
        4 => Ok(0),
        8 => Ok(1),
        16 => Ok(2),
        32 => Ok(3),
        64 => Ok(4),
        128 => Ok(5),
        256 => Ok(6),
        512 => Ok(7),
        other => Err(Error::InvalidTimeoutMultiplier(other)),
    }
}

fn connection_timeout(timeout_ms: u64) -> Result<EncodedTimeout> {
    if timeout_ms <= MIN_CONNECTION_TIMEOUT_MS {
        return Err(Error::InvalidTimeout(format!(
            "{} ms, must exceed {} ms",
            timeout_ms, MIN_CONNECTION_TIMEOUT_MS
        )));
    }
    encode_timeout(timeout_ms)
}

/// Inputs of a ForwardOpen request
#[derive(Debug, Clone)]
pub struct ForwardOpenParams {
    /// Requested packet interval, used for both directions
    pub ot_rpi: u32,
    /// Connection parameters word, used for both directions
    pub net_conn_params: u16,
    pub timeout_ms: u64,
    pub timeout_multiplier: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
}

impl Default for ForwardOpenParams {
    fn default() -> Self {
        ForwardOpenParams {
            ot_rpi: MIN_RPI,
            net_conn_params: 0x43F4,
            timeout_ms: 1000,
            timeout_multiplier: 32,
            connection_serial: 0x4242,
            vendor_id: crate::core::DEFAULT_VENDOR_ID,
            originator_serial: crate::core::DEFAULT_ORIGINATOR_SERIAL,
        }
    }
}

/// Builds the ForwardOpen payload with the default originator identity
pub fn build_forward_open(
    ot_rpi: u32,
    net_conn_params: u16,
    timeout_ms: u64,
    timeout_multiplier: u32,
    connection_serial: u16,
) -> Result<Bytes> {
    build_forward_open_with(&ForwardOpenParams {
        ot_rpi,
        net_conn_params,
        timeout_ms,
        timeout_multiplier,
        connection_serial,
        ..Default::default()
    })
}

/// Builds the 35-byte ForwardOpen payload
///
/// The T->O connection id is chosen at random; the O->T id is left zero for
/// the target to assign.
pub fn build_forward_open_with(params: &ForwardOpenParams) -> Result<Bytes> {
    let timeout = connection_timeout(params.timeout_ms)?;
    let multiplier = timeout_multiplier_code(params.timeout_multiplier)?;
    if params.ot_rpi < MIN_RPI {
        return Err(Error::InvalidRpi(params.ot_rpi));
    }
    let to_connection_id: u32 = rand::thread_rng().gen_range(0..i32::MAX as u32);

    let mut buf = BytesMut::with_capacity(FORWARD_OPEN_LEN);
    buf.put_u8(timeout.time_tick);
    buf.put_u8(timeout.ticks);
    buf.put_u32_le(0); // O->T connection id
    buf.put_u32_le(to_connection_id);
    buf.put_u16_le(params.connection_serial);
    buf.put_u16_le(params.vendor_id);
    buf.put_u32_le(params.originator_serial);
    buf.put_u32_le(u32::from(multiplier));
    buf.put_u32_le(params.ot_rpi);
    buf.put_u16_le(params.net_conn_params);
    buf.put_u32_le(params.ot_rpi); // T->O RPI
    buf.put_u16_le(params.net_conn_params);
    buf.put_u8(TRANSPORT_CLASS_TRIGGER);

    debug_assert_eq!(buf.len(), FORWARD_OPEN_LEN);
    Ok(buf.freeze())
}

/// Builds the 10-byte ForwardClose payload
pub fn build_forward_close(
    timeout_ms: u64,
    vendor_id: u16,
    originator_serial: u32,
    connection_serial: u16,
) -> Result<Bytes> {
    let timeout = connection_timeout(timeout_ms)?;
    if vendor_id == 0 {
        return Err(Error::InvalidOriginator("vendor id must be positive".to_string()));
    }
    if originator_serial == 0 {
        return Err(Error::InvalidOriginator("originator serial must be positive".to_string()));
    }

    let mut buf = BytesMut::with_capacity(FORWARD_CLOSE_LEN);
    buf.put_u8(timeout.time_tick);
    buf.put_u8(timeout.ticks);
    buf.put_u16_le(connection_serial);
    buf.put_u16_le(vendor_id);
    buf.put_u32_le(originator_serial);
    Ok(buf.freeze())
}

/// Successful ForwardOpen reply data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenReply {
    pub ot_connection_id: u32,
    pub to_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub ot_api: u32,
    pub to_api: u32,
}

impl ForwardOpenReply {
    /// Parses the data of a successful ForwardOpen reply
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        if cursor.remaining() < 24 {
            return Err(Error::malformed_request(format!("ForwardOpen reply of {} bytes", buf.len())));
        }
        Ok(ForwardOpenReply {
            ot_connection_id: cursor.get_u32_le(),
            to_connection_id: cursor.get_u32_le(),
            connection_serial: cursor.get_u16_le(),
            vendor_id: cursor.get_u16_le(),
            originator_serial: cursor.get_u32_le(),
            ot_api: cursor.get_u32_le(),
            to_api: cursor.get_u32_le(),
        })
    }
}
