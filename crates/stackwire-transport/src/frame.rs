//! Frame encoding for the broker protocol
//!
//! Every frame starts with an 8-byte header:
//!
//! ```text
//! 0..4  uid (u32, little-endian, 0 = broadcast)
//! 4     total length including header
//! 5     function id
//! 6     sequence number (high nibble) | response expected (bit 3)
//! 7     error code (bits 6-7)
//! ```
//!
//! A sequence number of 0 marks a callback; requests use 1..=15 and the
//! matching response echoes it.

use stackwire_core::{DeviceType, EnumerationEvent, EnumerationReason, Uid, Version};
use thiserror::Error;

/// Header size in bytes
pub const HEADER_LEN: usize = 8;

/// Largest frame the broker accepts
pub const MAX_FRAME_LEN: usize = 80;

/// Uid used for broadcast requests such as enumerate
pub const BROADCAST_UID: u32 = 0;

/// Size of the enumerate callback payload
pub const ENUMERATION_PAYLOAD_LEN: usize = 26;

/// Broker-level function ids
pub mod function {
    /// Keep-alive probe, never answered
    pub const DISCONNECT_PROBE: u8 = 128;
    /// Enumeration callback emitted by the broker
    pub const CALLBACK_ENUMERATE: u8 = 253;
    /// Enumerate request
    pub const ENUMERATE: u8 = 254;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid frame length field {length} for {available} bytes")]
    InvalidLength { length: u8, available: usize },
    #[error("Payload of {0} bytes does not fit into a frame")]
    PayloadTooLarge(usize),
    #[error("Payload truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("Invalid enumeration payload: {0}")]
    Enumeration(String),
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub uid: u32,
    pub length: u8,
    pub function_id: u8,
    pub sequence: u8,
    pub response_expected: bool,
    pub error_code: u8,
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        Ok(Self {
            uid: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            length: data[4],
            function_id: data[5],
            sequence: (data[6] >> 4) & 0x0F,
            response_expected: data[6] & 0x08 != 0,
            error_code: (data[7] >> 6) & 0x03,
        })
    }
}

/// One request, response or callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub uid: u32,
    pub function_id: u8,
    pub sequence: u8,
    pub response_expected: bool,
    pub error_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Request without a sequence number; the connection assigns one on send
    pub fn request(uid: u32, function_id: u8, payload: Vec<u8>) -> Self {
        Self {
            uid,
            function_id,
            sequence: 0,
            response_expected: false,
            error_code: 0,
            payload,
        }
    }

    /// Callback frame as emitted by the broker (sequence 0)
    pub fn callback(uid: u32, function_id: u8, payload: Vec<u8>) -> Self {
        Self::request(uid, function_id, payload)
    }

    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = sequence & 0x0F;
        self
    }

    pub fn with_response_expected(mut self, expected: bool) -> Self {
        self.response_expected = expected;
        self
    }

    pub fn with_error_code(mut self, code: u8) -> Self {
        self.error_code = code & 0x03;
        self
    }

    /// Callbacks carry sequence number 0
    pub fn is_callback(&self) -> bool {
        self.sequence == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let length = HEADER_LEN + self.payload.len();
        if length > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut data = Vec::with_capacity(length);
        data.extend_from_slice(&self.uid.to_le_bytes());
        data.push(length as u8);
        data.push(self.function_id);
        let mut options = (self.sequence & 0x0F) << 4;
        if self.response_expected {
            options |= 0x08;
        }
        data.push(options);
        data.push((self.error_code & 0x03) << 6);
        data.extend_from_slice(&self.payload);
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::decode(data)?;
        let length = header.length as usize;
        if length < HEADER_LEN || length > data.len() {
            return Err(FrameError::InvalidLength {
                length: header.length,
                available: data.len(),
            });
        }

        Ok(Self {
            uid: header.uid,
            function_id: header.function_id,
            sequence: header.sequence,
            response_expected: header.response_expected,
            error_code: header.error_code,
            payload: data[HEADER_LEN..length].to_vec(),
        })
    }
}

/// Cursor over a little-endian payload
pub struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], FrameError> {
        let end = self.offset + needed;
        if end > self.data.len() {
            return Err(FrameError::Truncated {
                offset: self.offset,
                needed,
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, FrameError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Fixed-size, NUL-padded string field
    pub fn read_string(&mut self, len: usize) -> Result<String, FrameError> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(raw[..end].iter().map(|&b| b as char).collect())
    }
}

/// Decode the payload of an enumerate callback
pub fn decode_enumeration(payload: &[u8]) -> Result<EnumerationEvent, FrameError> {
    if payload.len() < ENUMERATION_PAYLOAD_LEN {
        return Err(FrameError::Enumeration(format!(
            "expected {} bytes, got {}",
            ENUMERATION_PAYLOAD_LEN,
            payload.len()
        )));
    }

    let mut reader = PayloadReader::new(payload);
    let uid = reader.read_string(8)?;
    let connected_uid = reader.read_string(8)?;
    let position = reader.read_u8()? as char;
    let hardware_version = Version(reader.read_bytes::<3>()?);
    let firmware_version = Version(reader.read_bytes::<3>()?);
    let device_type = DeviceType(reader.read_u16()?);
    let raw_reason = reader.read_u8()?;

    if uid.is_empty() {
        return Err(FrameError::Enumeration("empty uid".to_string()));
    }
    let reason = EnumerationReason::from_wire(raw_reason)
        .ok_or_else(|| {
            FrameError::Enumeration(format!("unknown enumeration type {}", raw_reason))
        })?;

    let parent = Some(Uid::new(connected_uid)).filter(|p| !p.is_root_marker());

    Ok(EnumerationEvent {
        uid: Uid::new(uid),
        parent,
        position,
        hardware_version,
        firmware_version,
        device_type,
        reason,
    })
}

/// Encode an enumerate callback payload (the broker side of [`decode_enumeration`])
pub fn encode_enumeration(event: &EnumerationEvent) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ENUMERATION_PAYLOAD_LEN);
    push_string(&mut payload, event.uid.as_str(), 8);
    let parent = event.parent.as_ref().map(|p| p.as_str()).unwrap_or("0");
    push_string(&mut payload, parent, 8);
    payload.push(event.position as u8);
    payload.extend_from_slice(&event.hardware_version.0);
    payload.extend_from_slice(&event.firmware_version.0);
    payload.extend_from_slice(&event.device_type.0.to_le_bytes());
    payload.push(event.reason.to_wire());
    payload
}

/// Append a fixed-size, NUL-padded string field
pub fn push_string(buf: &mut Vec<u8>, value: &str, len: usize) {
    let mut written = 0;
    for c in value.chars().take(len) {
        let code = c as u32;
        buf.push(if code <= 0xFF { code as u8 } else { b'?' });
        written += 1;
    }
    buf.resize(buf.len() + (len - written), 0);
}
