//! Hierarchical content names
//!
//! A [`Name`] is an ordered list of opaque binary [`Component`]s, printed as a
//! URI (`/ndnptt/alice/%FE%03/%00%07`). Numbers are carried in components using
//! the marker convention: one marker byte followed by a minimal big-endian
//! integer of 1, 2, 4 or 8 bytes.
//!
//! - segment numbers use marker `0x00`
//! - stream sequence numbers use marker `0xFE`

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::NameError;

/// A single name component
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component(Bytes);

impl Component {
    /// Marker byte for segment-number components
    pub const SEGMENT_MARKER: u8 = 0x00;

    /// Marker byte for sequence-number components
    pub const SEQUENCE_NUMBER_MARKER: u8 = 0xFE;

    pub fn new(value: impl Into<Bytes>) -> Self {
        Self(value.into())
    }

    pub fn from_segment(segment: u64) -> Self {
        Self::from_marked_number(Self::SEGMENT_MARKER, segment)
    }

    pub fn from_sequence_number(sequence: u64) -> Self {
        Self::from_marked_number(Self::SEQUENCE_NUMBER_MARKER, sequence)
    }

    pub fn to_segment(&self) -> Result<u64, NameError> {
        self.to_marked_number(Self::SEGMENT_MARKER)
    }

    pub fn to_sequence_number(&self) -> Result<u64, NameError> {
        self.to_marked_number(Self::SEQUENCE_NUMBER_MARKER)
    }

    /// Raw component bytes
    pub fn value(&self) -> &[u8] {
        &self.0
    }

    fn from_marked_number(marker: u8, number: u64) -> Self {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(marker);
        if number <= u8::MAX as u64 {
            buf.put_u8(number as u8);
        } else if number <= u16::MAX as u64 {
            buf.put_u16(number as u16);
        } else if number <= u32::MAX as u64 {
            buf.put_u32(number as u32);
        } else {
            buf.put_u64(number);
        }
        Self(buf.freeze())
    }

    fn to_marked_number(&self, expected: u8) -> Result<u64, NameError> {
        let (&marker, digits) = self
            .0
            .split_first()
            .ok_or(NameError::InvalidWidth(0))?;
        if marker != expected {
            return Err(NameError::UnexpectedMarker {
                expected,
                found: marker,
            });
        }
        match digits.len() {
            1 | 2 | 4 | 8 => Ok(digits
                .iter()
                .fold(0u64, |acc, &byte| (acc << 8) | byte as u64)),
            width => Err(NameError::InvalidWidth(width)),
        }
    }
}

impl From<&str> for Component {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A component of only periods would be ambiguous in a URI
        if self.0.iter().all(|&b| b == b'.') {
            f.write_str("...")?;
        }
        for &byte in self.0.iter() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "%{:02X}", byte)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({})", self)
    }
}

/// Hierarchical name made of binary components
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a name from its URI form (`/a/b/%00%01`)
    pub fn from_uri(uri: &str) -> Result<Self, NameError> {
        let path = uri.strip_prefix("ndn:").unwrap_or(uri);
        let mut name = Self::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            name.push(Component::new(percent_decode(part)?));
        }
        Ok(name)
    }

    /// Append a component, builder style
    pub fn append(mut self, component: impl Into<Component>) -> Self {
        self.push(component.into());
        self
    }

    pub fn append_segment(self, segment: u64) -> Self {
        self.append(Component::from_segment(segment))
    }

    pub fn append_sequence_number(self, sequence: u64) -> Self {
        self.append(Component::from_sequence_number(sequence))
    }

    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn last(&self) -> Option<&Component> {
        self.components.last()
    }

    /// The first `len` components
    pub fn prefix(&self, len: usize) -> Name {
        Name {
            components: self.components[..len.min(self.components.len())].to_vec(),
        }
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.len() <= other.len() && self.components[..] == other.components[..self.len()]
    }

    /// Decode the last component as a segment number
    pub fn segment(&self) -> Result<u64, NameError> {
        self.last().ok_or(NameError::Empty)?.to_segment()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

fn percent_decode(part: &str) -> Result<Vec<u8>, NameError> {
    let bytes = part.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = part
                .get(i + 1..i + 3)
                .ok_or_else(|| NameError::InvalidUri(part.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| NameError::InvalidUri(part.to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    // "..." prefixes a component made only of periods
    if out.len() >= 3 && out.iter().all(|&b| b == b'.') {
        out.truncate(out.len() - 3);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_component_widths() {
        assert_eq!(Component::from_segment(7).value(), &[0x00, 0x07]);
        assert_eq!(Component::from_segment(256).value(), &[0x00, 0x01, 0x00]);
        assert_eq!(
            Component::from_segment(70_000).value(),
            &[0x00, 0x00, 0x01, 0x11, 0x70]
        );
        assert_eq!(Component::from_segment(1 << 40).value().len(), 9);
        assert_eq!(Component::from_segment(1 << 40).to_segment(), Ok(1 << 40));
    }

    #[test]
    fn test_wrong_marker_rejected() {
        let component = Component::from_sequence_number(3);
        assert_eq!(
            component.to_segment(),
            Err(NameError::UnexpectedMarker {
                expected: 0x00,
                found: 0xFE
            })
        );
        assert_eq!(component.to_sequence_number(), Ok(3));
    }

    #[test]
    fn test_invalid_width_rejected() {
        let component = Component::new(vec![0x00, 0x01, 0x02, 0x03]);
        assert_eq!(component.to_segment(), Err(NameError::InvalidWidth(3)));
        assert_eq!(Component::new(Vec::new()).to_segment(), Err(NameError::InvalidWidth(0)));
    }

    #[test]
    fn test_uri_display_and_parse() {
        let name = Name::from_uri("/ndnptt/alice")
            .unwrap()
            .append_sequence_number(3)
            .append_segment(7);
        assert_eq!(name.to_string(), "/ndnptt/alice/%FE%03/%00%07");

        let parsed = Name::from_uri(&name.to_string()).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.segment(), Ok(7));
    }

    #[test]
    fn test_bad_percent_escape() {
        assert!(matches!(Name::from_uri("/a/%G1"), Err(NameError::InvalidUri(_))));
        assert!(matches!(Name::from_uri("/a/%0"), Err(NameError::InvalidUri(_))));
    }

    #[test]
    fn test_prefix_relationship() {
        let stream = Name::from_uri("/ndnptt/bob").unwrap().append_sequence_number(1);
        let segment = stream.clone().append_segment(0);
        assert!(stream.is_prefix_of(&segment));
        assert!(!segment.is_prefix_of(&stream));
        assert_eq!(segment.prefix(stream.len()), stream);
        assert_eq!(Name::new().segment(), Err(NameError::Empty));
    }
}
