//! Protocol categories carried in the low nibble of the header byte.

use std::fmt;

/// Message category identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolCategory {
    /// Client announces itself under a key.
    Online = 0,
    /// Direct message to a single key.
    One = 1,
    /// Fan-out message to every member of a group.
    Group = 2,
    /// Client confirms it accepted a delivered message.
    Accept = 3,
    /// Acknowledgment of a direct message.
    OneAck = 10,
    /// Acknowledgment of a group message.
    GroupAck = 11,
    /// Join a group.
    Join = 12,
    /// Leave a group.
    Leave = 13,
    /// Keepalive ping.
    Ping = 14,
    /// Keepalive pong.
    Pong = 15,
}

impl ProtocolCategory {
    /// Numeric code of this category.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether frames of this category consist of the header byte only.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, ProtocolCategory::Ping | ProtocolCategory::Pong)
    }

    /// Whether this category confirms an earlier delivery.
    #[must_use]
    pub const fn is_acknowledgment(self) -> bool {
        matches!(
            self,
            ProtocolCategory::OneAck | ProtocolCategory::GroupAck | ProtocolCategory::Accept
        )
    }

    /// Lowercase name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProtocolCategory::Online => "online",
            ProtocolCategory::One => "one",
            ProtocolCategory::Group => "group",
            ProtocolCategory::Accept => "accept",
            ProtocolCategory::OneAck => "one_ack",
            ProtocolCategory::GroupAck => "group_ack",
            ProtocolCategory::Join => "join",
            ProtocolCategory::Leave => "leave",
            ProtocolCategory::Ping => "ping",
            ProtocolCategory::Pong => "pong",
        }
    }
}

impl From<ProtocolCategory> for u8 {
    fn from(category: ProtocolCategory) -> u8 {
        category as u8
    }
}

impl TryFrom<u8> for ProtocolCategory {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolCategory::Online),
            1 => Ok(ProtocolCategory::One),
            2 => Ok(ProtocolCategory::Group),
            3 => Ok(ProtocolCategory::Accept),
            10 => Ok(ProtocolCategory::OneAck),
            11 => Ok(ProtocolCategory::GroupAck),
            12 => Ok(ProtocolCategory::Join),
            13 => Ok(ProtocolCategory::Leave),
            14 => Ok(ProtocolCategory::Ping),
            15 => Ok(ProtocolCategory::Pong),
            other => Err(other),
        }
    }
}

impl fmt::Display for ProtocolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_codes() {
        for code in [0u8, 1, 2, 3, 10, 11, 12, 13, 14, 15] {
            let category = ProtocolCategory::try_from(code).unwrap();
            assert_eq!(category.code(), code);
        }
    }

    #[test]
    fn test_unmapped_codes_rejected() {
        for code in 4u8..=9 {
            assert_eq!(ProtocolCategory::try_from(code), Err(code));
        }
        assert!(ProtocolCategory::try_from(16).is_err());
    }

    #[test]
    fn test_control_categories() {
        assert!(ProtocolCategory::Ping.is_control());
        assert!(ProtocolCategory::Pong.is_control());
        assert!(!ProtocolCategory::One.is_control());
        assert!(ProtocolCategory::Accept.is_acknowledgment());
        assert!(!ProtocolCategory::Join.is_acknowledgment());
    }
}
