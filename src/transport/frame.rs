//! Channel multiplexing frames.
//!
//! Each frame has a variable header: type(1) + label_len(1) + label +
//! payload_len(2) + payload. Channels are keyed by label, so the label rides
//! every frame rather than a numeric stream id.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Maximum payload per data frame. Channel sends larger than this are
/// chunked.
pub const MAX_CHANNEL_PAYLOAD: usize = 16 * 1024;

/// Multiplexing frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// A peer requests a new labelled channel. No payload.
    ChannelOpen = 0x01,
    /// The remote side acknowledges a channel open. No payload.
    ChannelOpenAck = 0x02,
    /// Data payload for an open channel.
    ChannelData = 0x03,
    /// Graceful close of a channel.
    ChannelClose = 0x04,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::ChannelOpen),
            0x02 => Ok(Self::ChannelOpenAck),
            0x03 => Ok(Self::ChannelData),
            0x04 => Ok(Self::ChannelClose),
            _ => Err(Error::malformed(format!("unknown frame type: 0x{v:02x}"))),
        }
    }
}

/// A multiplexing frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub label: String,
    pub payload: Bytes,
}

impl Frame {
    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let label = self.label.as_bytes();
        let len = self.payload.len() as u16;
        let mut buf = Vec::with_capacity(4 + label.len() + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.push(label.len() as u8);
        buf.extend_from_slice(label);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::malformed(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let frame_type = FrameType::from_u8(data[0])?;
        let label_len = data[1] as usize;
        if data.len() < 2 + label_len + 2 {
            return Err(Error::malformed("frame label truncated"));
        }
        let label = std::str::from_utf8(&data[2..2 + label_len])
            .map_err(|_| Error::malformed("frame label is not valid UTF-8"))?
            .to_string();

        let len_offset = 2 + label_len;
        let payload_len =
            u16::from_be_bytes([data[len_offset], data[len_offset + 1]]) as usize;
        let payload_offset = len_offset + 2;
        if data.len() < payload_offset + payload_len {
            return Err(Error::malformed(format!(
                "frame truncated: header says {} payload bytes, got {}",
                payload_len,
                data.len() - payload_offset
            )));
        }

        Ok(Self {
            frame_type,
            label,
            payload: Bytes::copy_from_slice(&data[payload_offset..payload_offset + payload_len]),
        })
    }

    /// Create a ChannelOpen frame.
    pub fn open(label: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::ChannelOpen,
            label: label.into(),
            payload: Bytes::new(),
        }
    }

    /// Create a ChannelOpenAck frame.
    pub fn open_ack(label: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::ChannelOpenAck,
            label: label.into(),
            payload: Bytes::new(),
        }
    }

    /// Create a ChannelData frame.
    pub fn data(label: impl Into<String>, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::ChannelData,
            label: label.into(),
            payload,
        }
    }

    /// Create a ChannelClose frame.
    pub fn close(label: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::ChannelClose,
            label: label.into(),
            payload: Bytes::new(),
        }
    }
}
