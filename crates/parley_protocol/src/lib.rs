#![forbid(unsafe_code)]

pub mod framing;
pub mod wire;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	try_decode_frame_from_buffer,
};
pub use wire::{AckStatus, ClientMsg, Envelope, PROTOCOL_VERSION, ServerMsg};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
