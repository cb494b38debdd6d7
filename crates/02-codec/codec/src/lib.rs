//! Video codec service: decoder and encoder instances driven through a
//! callback protocol.
//!
//! The client side of the protocol is the contract the rest of the runtime
//! is written against:
//! * a decoder receives compressed packets via [`Decoder::send_stream`] and
//!   hands decoded pictures back through [`DecodeClient`] — the decoder asks
//!   the client for a destination surface, fills it, then delivers it with
//!   `on_frame` exactly once per picture;
//! * an encoder receives surfaces via [`Encoder::send_frame`] and delivers
//!   compressed packets through [`EncodeClient`] on its dispatcher thread;
//!   packet bytes are only valid inside the callback.
//!
//! Callbacks never run on the caller's thread: every instance owns one
//! dispatcher thread fed over a channel, so callback order equals submission
//! order. Errors are terminal for the instance that raised them.
//!
//! The backing "kernels" are a software codec over a raw-frame container
//! format (length-framed planes, parameter-set header first), which keeps
//! the full protocol — ordering, EOS-once, surface borrowing, backpressure —
//! observable without real entropy coding.

mod bitstream;
mod decode;
mod encode;
mod error;

pub use bitstream::{pack_frame, pack_parameter_set, parse_packet, FrameHeader, Packet};
pub use decode::{DecodeClient, Decoder, VdecCreateParams, VideoPacket};
pub use encode::{EncodeClient, EncodedPacket, Encoder, VencCreateParams};
pub use error::{CodecError, CodecResult};

/// Compressed stream kinds a codec instance can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    H264,
    H265,
    Jpeg,
}
