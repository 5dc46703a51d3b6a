//! Stream multiplexing frames for TCP sessions
//!
//! One TLS connection carries many logical streams. Every frame starts with a
//! 10-byte header: stream id (u32), frame type (u8), flags (u8), payload
//! length (u32), all big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::{ProtoError, CONTROL_STREAM_ID, MAX_FRAME_SIZE};

/// Stream identifier
pub type StreamId = u32;

/// What a frame carries. Byte values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// JSON control message, always on stream 0
    Control = 0,
    /// Chunk of a request or response message
    Data = 1,
    /// Stream teardown
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        [FrameType::Control, FrameType::Data, FrameType::Close]
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or(ProtoError::InvalidFrameType(value))
    }
}

/// Flag bits of a frame header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    /// Last chunk of a message
    pub const FIN: Self = Self(0b01);
    /// Stream aborted
    pub const RST: Self = Self(0b100);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn has_rst(self) -> bool {
        self.contains(Self::RST)
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(CONTROL_STREAM_ID, FrameType::Control, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Single data frame carrying a complete message
    pub fn message(stream_id: StreamId, payload: Bytes) -> Self {
        Self::data(stream_id, payload).with_flags(FrameFlags::FIN)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::close(stream_id).with_flags(FrameFlags::RST)
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Write header and payload into `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_FRAME_SIZE as usize {
            return Err(ProtoError::FrameTooLarge(payload_len));
        }

        dst.reserve(Self::HEADER_SIZE + payload_len);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u8(self.flags.0);
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one complete frame
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtoError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags(buf.get_u8());
        let length = buf.get_u32();

        if length > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length as usize));
        }
        if buf.remaining() < length as usize {
            return Err(ProtoError::IncompleteFrame);
        }

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload: buf.split_to(length as usize),
        })
    }
}

/// Hands out stream IDs for server-initiated streams.
///
/// The server uses even IDs and never 0, which belongs to the control stream.
#[derive(Debug)]
pub struct StreamAllocator {
    inner: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next: StreamId,
    open: HashSet<StreamId>,
}

impl StreamAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocatorState {
                next: 2,
                open: HashSet::new(),
            }),
        }
    }

    /// Allocate a fresh stream ID
    pub fn allocate(&self) -> Option<StreamId> {
        let mut state = self.inner.lock().ok()?;
        let start = state.next;
        loop {
            let id = state.next;
            state.next = id.wrapping_add(2);
            if state.next == CONTROL_STREAM_ID {
                state.next = 2;
            }

            if id != CONTROL_STREAM_ID && state.open.insert(id) {
                return Some(id);
            }
            if state.next == start {
                return None;
            }
        }
    }

    /// Mark a stream finished so its ID can be reused
    pub fn release(&self, stream_id: StreamId) {
        if let Ok(mut state) = self.inner.lock() {
            state.open.remove(&stream_id);
        }
    }

    pub fn open_streams(&self) -> usize {
        self.inner.lock().map(|s| s.open.len()).unwrap_or(0)
    }
}

impl Default for StreamAllocator {
    fn default() -> Self {
        Self::new()
    }
}
