//! Open-chapter save header for the dedup index (boundary format only).
//!
//! The index itself is an external collaborator; the engine only agrees on
//! the framing of a saved open chapter: magic `"ALBOC"`, version `"02.00"`,
//! then a little-endian record count.

use dvol_error::{DvolError, Result};
use dvol_types::{ParseError, read_le_u32, write_le_u32};

const OPEN_CHAPTER_MAGIC: &[u8; 5] = b"ALBOC";
const OPEN_CHAPTER_VERSION: &[u8; 5] = b"02.00";

/// Encoded size of the header.
pub const OPEN_CHAPTER_HEADER_SIZE: usize = 14;

/// Open-chapter save framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenChapterHeader {
    pub record_count: u32,
}

impl OpenChapterHeader {
    /// Encode the fixed-size header.
    #[must_use]
    pub fn encode(self) -> [u8; OPEN_CHAPTER_HEADER_SIZE] {
        let mut bytes = [0_u8; OPEN_CHAPTER_HEADER_SIZE];
        bytes[0..5].copy_from_slice(OPEN_CHAPTER_MAGIC);
        bytes[5..10].copy_from_slice(OPEN_CHAPTER_VERSION);
        write_le_u32(&mut bytes, 10, self.record_count);
        bytes
    }

    /// Decode and validate magic and version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |source| DvolError::corrupt("open chapter", source);
        if bytes.len() < OPEN_CHAPTER_HEADER_SIZE {
            return Err(corrupt(ParseError::InsufficientData {
                needed: OPEN_CHAPTER_HEADER_SIZE,
                offset: 0,
                actual: bytes.len(),
            }));
        }
        if &bytes[0..5] != OPEN_CHAPTER_MAGIC {
            return Err(corrupt(ParseError::InvalidField {
                field: "magic",
                reason: "not an open chapter save",
            }));
        }
        if &bytes[5..10] != OPEN_CHAPTER_VERSION {
            return Err(corrupt(ParseError::InvalidField {
                field: "version",
                reason: "unsupported open chapter version",
            }));
        }
        Ok(Self {
            record_count: read_le_u32(bytes, 10).map_err(corrupt)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = OpenChapterHeader { record_count: 999 };
        let bytes = header.encode();
        assert_eq!(&bytes[0..5], b"ALBOC");
        assert_eq!(&bytes[5..10], b"02.00");
        assert_eq!(OpenChapterHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut bytes = OpenChapterHeader { record_count: 1 }.encode();
        bytes[0] = b'X';
        assert!(OpenChapterHeader::decode(&bytes).is_err());

        let mut bytes = OpenChapterHeader { record_count: 1 }.encode();
        bytes[6] = b'9';
        assert!(OpenChapterHeader::decode(&bytes).is_err());

        assert!(OpenChapterHeader::decode(&[0; 4]).is_err());
    }
}
