//! NSB protocol core: message model, wire encoding and framing, payload keys.
//! No I/O; the client crate drives transports and stores.

pub mod key;
pub mod protocol;
pub mod wire;

pub use key::MessageKeyGenerator;
pub use protocol::{
    AddressType, ConfigParams, Intro, Manifest, Message, Metadata, Operation, Originator,
    Payload, ResultCode, SystemMode, PROTOCOL_VERSION,
};
pub use wire::{
    decode, decode_frame, encode, encode_frame, FrameDecodeError, FrameEncodeError, ProtocolError,
};
