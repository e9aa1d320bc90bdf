//! Protocol codec for message headers
//!
//! Handles the fixed header that frames each message body. Bodies are raw
//! bytes and need no decoding here.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{is_reserved_type_id, MessageHeader};

/// Header size: type_id(4) + body_size(4) = 8 bytes
pub const HEADER_SIZE: usize = 8;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: u32, max: u32 },

    #[error("Type id {0} is reserved for system messages")]
    ReservedTypeId(u32),
}

/// Write a header into a buffer in native byte order
pub fn encode_header(header: &MessageHeader, buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE);
    buf.put_u32_ne(header.type_id);
    buf.put_u32_ne(header.body_size);
}

/// Read a header from exactly `HEADER_SIZE` bytes
pub fn decode_header(raw: &[u8; HEADER_SIZE]) -> MessageHeader {
    let mut buf = &raw[..];
    let type_id = buf.get_u32_ne();
    let body_size = buf.get_u32_ne();
    MessageHeader { type_id, body_size }
}

/// Check a header received from a peer against the local limits
pub fn validate_header(header: &MessageHeader, max_body_size: u32) -> Result<(), CodecError> {
    if is_reserved_type_id(header.type_id) {
        return Err(CodecError::ReservedTypeId(header.type_id));
    }

    if header.body_size > max_body_size {
        return Err(CodecError::BodyTooLarge {
            size: header.body_size,
            max: max_body_size,
        });
    }

    Ok(())
}
