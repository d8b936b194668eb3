//! Wire protocol for relaymq.
//!
//! Every socket exchange is one frame in each direction. A frame is a fixed
//! header followed by a type-specific payload:
//!
//! ```text
//! Frame => EyeCatcher Version ClassId SubType PayloadLen Payload
//! EyeCatcher => 4 bytes, constant "RMQW"
//! Version    => u8
//! ClassId    => u8 (1 = request, 2 = reply, 3 = system)
//! SubType    => u8
//! PayloadLen => u32 (big-endian)
//! ```
//!
//! The header is verified before any payload decode is attempted: a foreign
//! or corrupted stream fails on the eye-catcher check and the bad frame is
//! discarded without touching the payload decoders. ClassId and SubType
//! together select the payload decoder from a closed registry; unknown
//! combinations, like every other protocol fault, come out of the decoder
//! as an in-band [`DecodedFrame::Invalid`] item so the connection survives
//! and the fault can be reported to the peer.

pub mod codec;
pub mod messages;

pub use codec::{
    DecodedFrame, FrameCodec, FrameCodecError, FrameHeader, EYE_CATCHER, PROTOCOL_VERSION,
};
pub use messages::*;
