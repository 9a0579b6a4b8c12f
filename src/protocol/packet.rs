//! Request / response packets exchanged with the transport
//!
//! One request names exactly one segment. A response is either positive
//! (payload = concatenated ADTS frames, optionally with a final-block marker)
//! or an application-level NACK whose payload is the final segment number as
//! an 8-byte big-endian integer.

use std::time::Duration;

use bytes::{Buf, Bytes};

use crate::error::{CodecError, NameError};
use crate::protocol::name::{Component, Name};

/// Request for a single segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub name: Name,
    /// Time to live before the request is presumed lost
    pub lifetime: Duration,
}

impl SegmentRequest {
    pub fn new(name: Name, lifetime: Duration) -> Self {
        Self { name, lifetime }
    }

    pub fn segment(&self) -> Result<u64, NameError> {
        self.name.segment()
    }
}

/// Content type carried in response metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Blob,
    /// Application-level negative acknowledgement
    Nack,
}

/// Response metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetaInfo {
    pub content_type: ContentType,
    pub final_block_id: Option<Component>,
}

/// Response for a single segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentResponse {
    pub name: Name,
    pub meta: MetaInfo,
    pub content: Bytes,
}

impl SegmentResponse {
    /// Positive response carrying encoded frames
    pub fn data(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            meta: MetaInfo::default(),
            content: content.into(),
        }
    }

    /// Application NACK: the producer stopped before this segment existed
    pub fn nack(name: Name, final_segment: u64) -> Self {
        Self {
            name,
            meta: MetaInfo {
                content_type: ContentType::Nack,
                final_block_id: None,
            },
            content: encode_nack(final_segment),
        }
    }

    /// Mark this response with the stream's final segment number
    pub fn with_final_block_id(mut self, final_segment: u64) -> Self {
        self.meta.final_block_id = Some(Component::from_segment(final_segment));
        self
    }

    pub fn is_nack(&self) -> bool {
        self.meta.content_type == ContentType::Nack
    }

    pub fn segment(&self) -> Result<u64, NameError> {
        self.name.segment()
    }
}

/// Encode a final segment number as a NACK payload
pub fn encode_nack(final_segment: u64) -> Bytes {
    Bytes::copy_from_slice(&final_segment.to_be_bytes())
}

/// Decode a NACK payload into the final segment number
pub fn decode_nack(payload: &[u8]) -> Result<u64, CodecError> {
    if payload.len() != 8 {
        return Err(CodecError::InvalidNack(payload.len()));
    }
    let mut buf = payload;
    Ok(buf.get_u64())
}
