//! Link engine frames and their wire encoding
//!
//! Frames are serialized with bincode and carried behind a 4-byte big-endian
//! length prefix. Each frame travels on the sender's local channel and refers
//! to links by the sender's local handle.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::{DeliveryTag, Outcome, Role, Terminus};
use crate::Result;

/// Size of the length prefix in front of every encoded frame
pub const FRAME_HEADER_SIZE: usize = 4;

// ----------------------------------------------------------------------------
// Frame Types
// ----------------------------------------------------------------------------

/// One unit of link engine traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Sender's local session channel (ignored for connection performatives)
    pub channel: u16,
    pub body: Performative,
}

/// Protocol operation carried by a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Performative {
    Open {
        container_id: String,
        hostname: Option<String>,
    },
    Begin {
        /// Channel of the session being answered, when responding
        remote_channel: Option<u16>,
    },
    Attach {
        name: String,
        handle: u32,
        role: Role,
        source: Terminus,
        target: Terminus,
    },
    Flow {
        handle: u32,
        delivery_count: u32,
        link_credit: u32,
        drain: bool,
    },
    Transfer {
        handle: u32,
        delivery_number: u32,
        tag: DeliveryTag,
        settled: bool,
        more: bool,
        payload: Vec<u8>,
    },
    Disposition {
        handle: u32,
        delivery_number: u32,
        settled: bool,
        outcome: Option<Outcome>,
    },
    Detach {
        handle: u32,
    },
    End,
    Close,
}

impl Frame {
    /// Frame addressed to the connection itself
    pub fn connection(body: Performative) -> Self {
        Self { channel: 0, body }
    }

    /// Frame addressed to a session
    pub fn session(channel: u16, body: Performative) -> Self {
        Self { channel, body }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self.body {
            Performative::Open { .. } => "open",
            Performative::Begin { .. } => "begin",
            Performative::Attach { .. } => "attach",
            Performative::Flow { .. } => "flow",
            Performative::Transfer { .. } => "transfer",
            Performative::Disposition { .. } => "disposition",
            Performative::Detach { .. } => "detach",
            Performative::End => "end",
            Performative::Close => "close",
        }
    }

    // ------------------------------------------------------------------------
    // Wire Encoding
    // ------------------------------------------------------------------------

    /// Encode the frame with its length prefix
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let size = u32::try_from(body.len()).map_err(|_| EngineError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        bytes.extend_from_slice(&size.to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a frame body (the bytes after the length prefix)
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(body)?)
    }

    /// Read the body length from a length prefix, enforcing the size limit
    pub fn body_len(header: [u8; FRAME_HEADER_SIZE], max_frame_size: usize) -> Result<usize> {
        let size = u32::from_be_bytes(header) as usize;
        if size > max_frame_size {
            return Err(EngineError::FrameTooLarge {
                size,
                max: max_frame_size,
            }
            .into());
        }
        Ok(size)
    }

    /// Decode one complete frame from the front of `buffer`, if present
    ///
    /// Consumed bytes are removed from the buffer; an incomplete frame leaves
    /// the buffer untouched.
    pub fn decode(buffer: &mut Vec<u8>, max_frame_size: usize) -> Result<Option<Self>> {
        if buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buffer[..FRAME_HEADER_SIZE]);
        let size = Self::body_len(header, max_frame_size)?;

        if buffer.len() < FRAME_HEADER_SIZE + size {
            return Ok(None);
        }
        let frame = Self::decode_body(&buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + size])?;
        buffer.drain(..FRAME_HEADER_SIZE + size);
        Ok(Some(frame))
    }
}
