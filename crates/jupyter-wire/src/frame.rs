//! WebSocket framing for kernel messages.
//!
//! Messages without buffers travel as JSON text frames. Messages that carry
//! raw buffers use a binary multi-part frame:
//!
//! ```text
//! [u32: nbufs] [u32: offset_0] .. [u32: offset_{nbufs-1}] [json] [buf_1] .. [buf_{nbufs-1}]
//! ```
//!
//! All integers are big-endian. `nbufs` counts the JSON segment plus every
//! buffer, and `offset_0` is always `4 * (nbufs + 1)`. Segment `i` spans
//! `offset_i..offset_{i+1}`, the last one runs to the end of the frame.

use bytes::Bytes;

use crate::message::{KernelMessage, WireError};

/// A message ready to be written to, or just read from, the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    /// Encode a message, choosing binary framing only when it carries buffers.
    pub fn encode(msg: &KernelMessage) -> Result<Self, WireError> {
        if msg.buffers.is_empty() {
            Ok(WireFrame::Text(msg.to_json()?))
        } else {
            Ok(WireFrame::Binary(serialize_binary(msg)?))
        }
    }

    /// Decode either frame kind back into a message.
    pub fn decode(&self) -> Result<KernelMessage, WireError> {
        match self {
            WireFrame::Text(text) => KernelMessage::from_json(text),
            WireFrame::Binary(data) => deserialize_binary(data),
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<usize> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

fn frame_error(msg: impl Into<String>) -> WireError {
    WireError::Frame(msg.into())
}

/// Serialize a message and its buffers into a binary multi-part frame.
pub fn serialize_binary(msg: &KernelMessage) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;

    let mut segments: Vec<&[u8]> = Vec::with_capacity(1 + msg.buffers.len());
    segments.push(&json);
    segments.extend(msg.buffers.iter().map(|b| b.as_ref()));

    let nbufs = segments.len();
    let header_len = 4 * (nbufs + 1);
    let total = header_len + segments.iter().map(|s| s.len()).sum::<usize>();
    if u32::try_from(total).is_err() {
        return Err(frame_error(format!("frame too large: {} bytes", total)));
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(nbufs as u32).to_be_bytes());

    let mut offset = header_len;
    for segment in &segments {
        frame.extend_from_slice(&(offset as u32).to_be_bytes());
        offset += segment.len();
    }
    for segment in &segments {
        frame.extend_from_slice(segment);
    }

    Ok(frame)
}

/// Parse a binary multi-part frame. The first segment is the JSON message,
/// the remaining segments become its buffers.
pub fn deserialize_binary(data: &[u8]) -> Result<KernelMessage, WireError> {
    let nbufs = read_u32(data, 0).ok_or_else(|| frame_error("frame shorter than 4 bytes"))?;
    if nbufs == 0 {
        return Err(frame_error("frame declares zero segments"));
    }

    let header_len = nbufs
        .checked_add(1)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| frame_error("segment count overflows"))?;
    if header_len > data.len() {
        return Err(frame_error(format!(
            "offset table for {} segments exceeds frame of {} bytes",
            nbufs,
            data.len()
        )));
    }

    let mut offsets = Vec::with_capacity(nbufs);
    for i in 0..nbufs {
        // header_len bounds-checked above
        let offset = read_u32(data, 4 * (i + 1)).unwrap_or(usize::MAX);
        if offset < header_len || offset > data.len() {
            return Err(frame_error(format!("offset {} out of range", offset)));
        }
        if offsets.last().is_some_and(|prev| offset < *prev) {
            return Err(frame_error("offsets are not increasing"));
        }
        offsets.push(offset);
    }

    let segment = |i: usize| {
        let start = offsets[i];
        let stop = offsets.get(i + 1).copied().unwrap_or(data.len());
        &data[start..stop]
    };

    let mut msg: KernelMessage = serde_json::from_slice(segment(0))
        .map_err(|e| frame_error(format!("invalid JSON segment: {}", e)))?;
    msg.buffers = (1..nbufs)
        .map(|i| Bytes::copy_from_slice(segment(i)))
        .collect();
    Ok(msg)
}
