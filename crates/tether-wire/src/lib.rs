//! Byte-order conversion and wire constants for the Tether transport.
//!
//! Network byte order is big-endian. The conversions here are pure and
//! total: round-tripping any value through a matching pair is the identity.
//! The only piece of wire format the transport defines lives here too, the
//! fixed handshake datagram a client sends after a datagram "connect" so the
//! server can learn the peer address.

/// Handshake payload sent by datagram clients: the ASCII literal
/// `identifier` followed by a NUL byte, 11 bytes total.
pub const HANDSHAKE: [u8; 11] = *b"identifier\0";

/// Check whether a received datagram is exactly the handshake payload.
///
/// Anything else, including a longer datagram that merely starts with the
/// literal, is not a handshake.
pub fn is_handshake(payload: &[u8]) -> bool {
    payload == HANDSHAKE
}

/// Convert a 16-bit value from host to network byte order.
pub fn host_to_network_u16(host_value: u16) -> u16 {
    host_value.to_be()
}

/// Convert a 32-bit value from host to network byte order.
pub fn host_to_network_u32(host_value: u32) -> u32 {
    host_value.to_be()
}

/// Convert a 64-bit value from host to network byte order.
pub fn host_to_network_u64(host_value: u64) -> u64 {
    host_value.to_be()
}

/// Convert a 16-bit value from network to host byte order.
pub fn network_to_host_u16(network_value: u16) -> u16 {
    u16::from_be(network_value)
}

/// Convert a 32-bit value from network to host byte order.
pub fn network_to_host_u32(network_value: u32) -> u32 {
    u32::from_be(network_value)
}

/// Convert a 64-bit value from network to host byte order.
pub fn network_to_host_u64(network_value: u64) -> u64 {
    u64::from_be(network_value)
}
