//! Encoding: version byte, then one length-prefixed section per message part. Framing: length-prefix
//! (4 bytes LE) + encoded message.
//!
//! Section order is manifest, metadata, intro, config, payload. Each section is a 4-byte LE length
//! followed by its bincode body; length 0 means absent. Bodies are decoded with trailing bytes
//! allowed, so fields a newer peer appends to any section are ignored, and so are whole sections
//! appended after the payload.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Message, PROTOCOL_VERSION};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode a message: protocol version byte followed by its sections. Deterministic for equal messages.
pub fn encode(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = vec![PROTOCOL_VERSION];
    put_section(&mut out, Some(&msg.manifest))?;
    put_section(&mut out, msg.metadata.as_ref())?;
    put_section(&mut out, msg.intro.as_ref())?;
    put_section(&mut out, msg.config.as_ref())?;
    put_section(&mut out, msg.payload.as_ref())?;
    Ok(out)
}

fn put_section<T: Serialize>(
    out: &mut Vec<u8>,
    section: Option<&T>,
) -> Result<(), FrameEncodeError> {
    let body = match section {
        Some(s) => codec().serialize(s)?,
        None => Vec::new(),
    };
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Cursor over the sections of one encoded message.
struct Sections<'a> {
    rest: &'a [u8],
}

impl Sections<'_> {
    fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        if self.rest.len() < LEN_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let (len, rest) = self.rest.split_at(LEN_SIZE);
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(ProtocolError::Truncated);
        }
        let (body, rest) = rest.split_at(len);
        self.rest = rest;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(codec().deserialize(body)?))
    }
}

/// Decode one message. Malformed, truncated or structurally invalid input is a `ProtocolError`.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let (&version, body) = bytes.split_first().ok_or(ProtocolError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let mut sections = Sections { rest: body };
    let manifest = sections
        .next()?
        .ok_or(ProtocolError::Invalid("missing manifest"))?;
    let msg = Message {
        manifest,
        metadata: sections.next()?,
        intro: sections.next()?,
        config: sections.next()?,
        payload: sections.next()?,
    };
    msg.validate()?;
    Ok(msg)
}

/// Error decoding a message (empty or truncated input, version mismatch, bincode failure or invalid sections).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("truncated message")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

/// Wrap an encoded message into a single frame: 4 bytes LE length + body.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a message or frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Find one frame at the front of `bytes`. Returns the frame body and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..end], end))
}

/// Error decoding a frame (need more bytes or announced length over the limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
}
