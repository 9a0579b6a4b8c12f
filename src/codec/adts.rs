//! ADTS frame splitting
//!
//! Each ADTS frame is self-delimiting: the 13-bit `frame_length` field
//! (header included) is packed across header bytes 3..=5:
//!
//! ```text
//! byte 3: ......LL   (bits 12-11)
//! byte 4: LLLLLLLL   (bits 10-3)
//! byte 5: LLL.....   (bits 2-0)
//! ```

use bytes::Bytes;

use crate::error::CodecError;

/// Fixed ADTS header length (no CRC)
pub const ADTS_HEADER_LEN: usize = 7;

/// Samples per channel carried by one AAC frame
pub const SAMPLES_PER_FRAME: u64 = 1024;

/// Header of the silent AAC frame; its length field encodes 91 bytes
const SILENT_HEADER: [u8; ADTS_HEADER_LEN] = [0xff, 0xf1, 0x6c, 0x40, 0x0b, 0x7f, 0xfc];

const SILENT_FRAME_LEN: usize = 91;

/// Read the frame length field of the frame starting at `offset`
pub fn frame_length(buf: &[u8], offset: usize) -> Result<usize, CodecError> {
    let header = buf
        .get(offset..offset + ADTS_HEADER_LEN)
        .ok_or(CodecError::TruncatedHeader(offset))?;
    Ok(((header[3] & 0x03) as usize) << 11
        | (header[4] as usize) << 3
        | (header[5] as usize) >> 5)
}

/// Split a segment payload into its ADTS frames
///
/// The returned frames share the payload's allocation.
pub fn split_frames(payload: &Bytes) -> Result<Vec<Bytes>, CodecError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let length = frame_length(payload, offset)?;
        if length < ADTS_HEADER_LEN {
            return Err(CodecError::LengthTooShort { offset, length });
        }
        if offset + length > payload.len() {
            return Err(CodecError::Overrun {
                offset,
                length,
                available: payload.len(),
            });
        }
        frames.push(payload.slice(offset..offset + length));
        offset += length;
    }
    Ok(frames)
}

/// A silent frame in the same format as the stream
pub fn silent_frame() -> Bytes {
    let mut frame = vec![0u8; SILENT_FRAME_LEN];
    frame[..ADTS_HEADER_LEN].copy_from_slice(&SILENT_HEADER);
    Bytes::from(frame)
}

#[cfg(test)]
pub(crate) fn test_frame(fill: u8, length: usize) -> Vec<u8> {
    let mut frame = vec![fill; length];
    frame[..ADTS_HEADER_LEN].copy_from_slice(&SILENT_HEADER);
    frame[3] = (frame[3] & !0x03) | ((length >> 11) & 0x03) as u8;
    frame[4] = ((length >> 3) & 0xff) as u8;
    frame[5] = (frame[5] & 0x1f) | (((length & 0x07) as u8) << 5);
    frame
}
