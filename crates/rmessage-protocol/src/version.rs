//! Header byte layout for rmessage frames.
//!
//! The first byte of every frame carries the protocol marker in its high
//! nibble and the [`ProtocolCategory`](crate::ProtocolCategory) code in its
//! low nibble.

/// Marker expected in the high nibble of every header byte.
///
/// Doubles as the wire version: a peer speaking a different revision of the
/// framing is rejected on its first byte.
pub const PROTOCOL_MARKER: u8 = 0x1;

/// Pack a marker and a category code into a header byte.
#[must_use]
pub const fn header_byte(marker: u8, code: u8) -> u8 {
    ((marker & 0x0F) << 4) | (code & 0x0F)
}

/// Split a header byte into `(marker, code)`.
#[must_use]
pub const fn split_header(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0F)
}
