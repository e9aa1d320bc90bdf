//! Protocol message definitions
//!
//! A message is a typed envelope around a raw byte body. Fields are pushed
//! onto the end of the body and popped back off the end, so they must be read
//! in the reverse order they were written.

use std::fmt;
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use thiserror::Error;

use super::SystemMessage;
use crate::network::Connection;

/// Message envelope errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Body underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Fixed-size message header, sent before every body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Application or system type id
    pub type_id: u32,
    /// Number of body bytes following the header
    pub body_size: u32,
}

impl MessageHeader {
    pub fn new(type_id: u32) -> Self {
        Self {
            type_id,
            body_size: 0,
        }
    }
}

/// A message exchanged between peers
#[derive(Debug, Clone, Default)]
pub struct Message {
    header: MessageHeader,
    body: Vec<u8>,
    /// Connection that produced this message (receive side only)
    owner: Option<Weak<Connection>>,
}

impl Message {
    /// Create an empty message of the given type
    pub fn new(type_id: u32) -> Self {
        Self {
            header: MessageHeader::new(type_id),
            body: Vec::new(),
            owner: None,
        }
    }

    /// Create a framework-synthesized message
    pub fn system(kind: SystemMessage) -> Self {
        Self::new(kind.type_id())
    }

    /// Rebuild a message from a received header and body
    pub(crate) fn from_parts(type_id: u32, body: Vec<u8>) -> Self {
        let mut header = MessageHeader::new(type_id);
        header.body_size = body.len() as u32;
        Self {
            header,
            body,
            owner: None,
        }
    }

    pub(crate) fn with_owner(mut self, owner: Weak<Connection>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn type_id(&self) -> u32 {
        self.header.type_id
    }

    /// The system message this is, if its type id is reserved
    pub fn system_kind(&self) -> Option<SystemMessage> {
        SystemMessage::from_type_id(self.header.type_id)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The connection this message arrived on, if it is still alive
    pub fn owner(&self) -> Option<Arc<Connection>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// Append a fixed-layout value to the end of the body
    pub fn push<T: Pod>(&mut self, value: &T) -> &mut Self {
        self.body.extend_from_slice(bytemuck::bytes_of(value));
        self.header.body_size = self.body.len() as u32;
        self
    }

    /// Remove a fixed-layout value from the end of the body.
    ///
    /// Values come back last-pushed first. On underflow the message is left
    /// untouched.
    pub fn pop<T: Pod>(&mut self) -> MessageResult<T> {
        let requested = std::mem::size_of::<T>();
        let available = self.body.len();
        if requested > available {
            return Err(MessageError::Underflow {
                requested,
                available,
            });
        }

        let start = available - requested;
        let value = bytemuck::pod_read_unaligned(&self.body[start..]);
        self.body.truncate(start);
        self.header.body_size = self.body.len() as u32;
        Ok(value)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.system_kind() {
            Some(kind) => write!(f, "{:?} (system)", kind),
            None => write!(f, "ID:{} Size:{}", self.header.type_id, self.header.body_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[test]
    fn test_reverse_order_roundtrip() {
        let mut msg = Message::new(7);
        msg.push(&1u32);
        msg.push(&-2.5f64);
        msg.push(&[9u8, 8, 7]);
        msg.push(&Position { x: 1.5, y: -3.0 });
        assert_eq!(msg.size(), 4 + 8 + 3 + 8);
        assert_eq!(msg.header().body_size as usize, msg.size());

        assert_eq!(msg.pop::<Position>().unwrap(), Position { x: 1.5, y: -3.0 });
        assert_eq!(msg.pop::<[u8; 3]>().unwrap(), [9, 8, 7]);
        assert_eq!(msg.pop::<f64>().unwrap().to_bits(), (-2.5f64).to_bits());
        assert_eq!(msg.pop::<u32>().unwrap(), 1);

        assert!(msg.is_empty());
        assert_eq!(msg.header().body_size, 0);
    }

    #[test]
    fn test_forward_order_read_is_wrong() {
        // Stack discipline: reading in write order swaps the fields
        let mut msg = Message::new(7);
        msg.push(&1u32).push(&2u32);

        let first: u32 = msg.pop().unwrap();
        let second: u32 = msg.pop().unwrap();
        assert_eq!((first, second), (2, 1));
    }

    #[test]
    fn test_underflow_leaves_message_unchanged() {
        let mut msg = Message::new(9);
        msg.push(&0xABu8).push(&0xCDu8);

        let err = msg.pop::<u32>().unwrap_err();
        assert_eq!(
            err,
            MessageError::Underflow {
                requested: 4,
                available: 2
            }
        );
        assert_eq!(msg.body(), &[0xAB, 0xCD]);
        assert_eq!(msg.header().body_size, 2);

        assert_eq!(msg.pop::<u8>().unwrap(), 0xCD);
    }

    #[test]
    fn test_pop_from_empty() {
        let mut msg = Message::new(3);
        assert!(msg.pop::<u8>().is_err());
        assert!(msg.is_empty());
    }

    #[test]
    fn test_system_message() {
        let msg = Message::system(SystemMessage::Failed);
        assert_eq!(msg.system_kind(), Some(SystemMessage::Failed));
        assert!(msg.is_empty());
        assert_eq!(msg.to_string(), "Failed (system)");
    }

    #[test]
    fn test_no_owner_by_default() {
        let msg = Message::new(5);
        assert!(msg.owner().is_none());
        assert_eq!(msg.to_string(), "ID:5 Size:0");
    }

    #[test]
    fn test_from_parts_keeps_size_in_sync() {
        let msg = Message::from_parts(12, vec![1, 2, 3, 4, 5]);
        assert_eq!(msg.type_id(), 12);
        assert_eq!(msg.header().body_size, 5);
    }
}
