//! Protocol module - Defines the wire protocol for EngineNet communication
//!
//! Every message on the wire is a fixed header followed by a raw body:
//! - 4 bytes type id (native byte order)
//! - 4 bytes body size (native byte order)
//! - `body size` bytes of payload
//!
//! No compression and no framing beyond the header. TCP ordering makes the
//! header-then-body read unambiguous.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default port for EngineNet communication
pub const DEFAULT_PORT: u16 = 60000;

/// Default ceiling for a single message body, enforced per connection
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1024;

/// First type id available to applications. Everything below is reserved
/// for messages synthesized by the framework itself.
pub const FIRST_APPLICATION_TYPE_ID: u32 = 3;

/// Messages the framework synthesizes into an inbound queue.
///
/// These never travel over the wire; applications must check for them
/// before dispatching on their own type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SystemMessage {
    /// Client connection established
    Connected = 0,
    /// Client connection lost or closed
    Disconnected = 1,
    /// Client could not resolve or connect
    Failed = 2,
}

impl SystemMessage {
    /// Get the reserved type id
    pub fn type_id(self) -> u32 {
        self as u32
    }

    /// Map a type id back to a system message, if it is reserved
    pub fn from_type_id(type_id: u32) -> Option<Self> {
        match type_id {
            0 => Some(SystemMessage::Connected),
            1 => Some(SystemMessage::Disconnected),
            2 => Some(SystemMessage::Failed),
            _ => None,
        }
    }
}

/// Check whether a type id falls in the reserved system range
pub fn is_reserved_type_id(type_id: u32) -> bool {
    type_id < FIRST_APPLICATION_TYPE_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_ids_are_reserved() {
        for kind in [
            SystemMessage::Connected,
            SystemMessage::Disconnected,
            SystemMessage::Failed,
        ] {
            assert!(is_reserved_type_id(kind.type_id()));
            assert_eq!(SystemMessage::from_type_id(kind.type_id()), Some(kind));
        }
    }

    #[test]
    fn test_application_ids_are_not_reserved() {
        assert!(!is_reserved_type_id(FIRST_APPLICATION_TYPE_ID));
        assert!(!is_reserved_type_id(7));
        assert_eq!(SystemMessage::from_type_id(7), None);
    }
}
