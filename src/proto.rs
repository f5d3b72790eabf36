//! Protocol identifiers carried in the first payload byte.
//!
//! The values below partition the byte space between the packet-bearing
//! layers. Everything with the top bit set belongs to the framing family;
//! the remainder addresses a child of the dispatcher.

/// Ping, also used as NUL padding on idle links.
pub const PING: u8 = 0x00;

/// First of the fifteen private user streams (`0x01..=0x0F`).
pub const USER1: u8 = 0x01;
/// Last private user stream.
pub const USER15: u8 = 0x0F;

/// Reserved transport identifier.
pub const TRANS_LONG: u8 = 0x7D;
/// Transport envelope, 2-byte little-endian packet counter.
pub const TRANS: u8 = 0x7E;
/// Message layer envelope.
pub const MSG: u8 = 0x7F;

/// Short/compact frame family: any byte with bit 7 set.
pub const FRAME: u8 = 0x80;
pub const FRAME_MASK: u8 = 0x80;

/// Extended (long/jumbo) frame family.
pub const FRAME_XL: u8 = 0xC0;
pub const FRAME_XL_MASK: u8 = 0xC0;

/// Long frame header prefix, `0xC0..=0xDF`.
pub const FRAME_LONG: u8 = 0xC0;
pub const FRAME_LONG_MASK: u8 = 0xE0;

/// Jumbo frame header prefix, `0xE0..=0xFF`.
pub const FRAME_JUMBO: u8 = 0xE0;
pub const FRAME_JUMBO_MASK: u8 = 0xE0;
