//! Naming and packet formats shared with the producer

pub mod name;
pub mod packet;

pub use name::{Component, Name};
pub use packet::{decode_nack, encode_nack, ContentType, MetaInfo, SegmentRequest, SegmentResponse};

/// Announcement of a stream available for consumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// `applicationPrefix / sequenceNumber`
    pub name: Name,
    /// ADTS frames per segment
    pub frames_per_segment: u64,
    /// Producer sampling rate in samples per second
    pub producer_sampling_rate: u32,
}

impl StreamInfo {
    pub fn new(name: Name, frames_per_segment: u64, producer_sampling_rate: u32) -> Self {
        Self {
            name,
            frames_per_segment,
            producer_sampling_rate,
        }
    }

    /// Name of one segment of this stream
    pub fn segment_name(&self, segment: u64) -> Name {
        self.name.clone().append_segment(segment)
    }
}
