//! Java Debug Wire Protocol (JDWP) vocabulary for Nova's debug agent.
//!
//! This crate holds everything that is purely about the bytes on the wire:
//! packet framing, the big-endian [`JdwpReader`]/[`JdwpWriter`] codec,
//! identifier sizes, tagged values, locations, and the numeric constants of the
//! protocol (command sets, event kinds, modifiers, error codes).
//!
//! It deliberately knows nothing about threads, heaps or sessions; the agent in
//! `nova-debug-agent` builds on top of it, and integration tests use it to play
//! the debugger side of a connection.

mod codec;
pub mod io;
mod types;

pub use codec::{
    decode_packet_bytes, encode_command, encode_reply, signature_to_class_name, signature_to_tag,
    CommandPacket, JdwpReader, JdwpWriter, Packet, ReplyPacket, FLAG_REPLY, HANDSHAKE,
};
pub use types::*;

/// Size of a JDWP packet header: `u32 length`, `u32 id`, `u8 flags`, then
/// either `u8 command_set, u8 command` or `u16 error_code`.
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single packet accepted from a peer.
///
/// JDWP packets carry a `u32` length, so a hostile or confused peer could make
/// us allocate up to 4 GiB per packet without this cap.
pub const MAX_PACKET_LEN: usize = 64 * 1024 * 1024;
