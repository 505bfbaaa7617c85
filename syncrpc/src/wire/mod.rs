//! Framing for node connections.
//!
//! Each frame carries one encoded [`crate::SyncMessage`]:
//!
//! ```text
//! +----------------+----------------+-------------------+
//! | payload length | CRC32C         | payload           |
//! | u32 big-endian | u32 big-endian | `length` bytes    |
//! +----------------+----------------+-------------------+
//! ```
//!
//! A frame that fails its checksum or announces more than
//! [`MAX_PAYLOAD_SIZE`] bytes poisons the stream; the connection carrying
//! it is dropped.

/// Bytes in a frame header.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a frame may carry (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// A frame could not be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The payload is larger than [`MAX_PAYLOAD_SIZE`].
    #[error("frame payload of {size} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    FrameTooLarge {
        /// Payload size announced or requested.
        size: usize,
    },

    /// The payload does not hash to the header's checksum.
    #[error("corrupt frame: header checksum {expected:08x}, payload hashes to {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried by the header.
        expected: u32,
        /// Checksum of the received payload.
        actual: u32,
    },
}

/// The fixed-size prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes, header excluded.
    pub length: u32,
    /// CRC32C of the payload.
    pub checksum: u32,
}

impl FrameHeader {
    /// Header describing `payload`.
    pub fn for_payload(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge {
                size: payload.len(),
            });
        }
        Ok(Self {
            length: payload.len() as u32,
            checksum: crc32c::crc32c(payload),
        })
    }

    /// Big-endian encoding of the header.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    /// Read a header from the front of `buf`, or `None` if it is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let word = |at: usize| {
            buf.get(at..at + 4)
                .and_then(|bytes| bytes.try_into().ok())
                .map(u32::from_be_bytes)
        };
        Some(Self {
            length: word(0)?,
            checksum: word(4)?,
        })
    }

    fn verify(&self, payload: &[u8]) -> Result<(), WireError> {
        let actual = crc32c::crc32c(payload);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(WireError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            })
        }
    }
}

/// Wrap a payload in a frame.
///
/// # Errors
///
/// [`WireError::FrameTooLarge`] if the payload exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```
/// use syncrpc::wire::{serialize_frame, try_deserialize_frame, HEADER_SIZE};
///
/// let frame = serialize_frame(b"hello").expect("serialize");
/// assert_eq!(frame.len(), HEADER_SIZE + 5);
///
/// let (payload, consumed) = try_deserialize_frame(&frame)
///     .expect("valid")
///     .expect("complete");
/// assert_eq!(payload, b"hello");
/// assert_eq!(consumed, frame.len());
/// ```
pub fn serialize_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = FrameHeader::for_payload(payload)?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse the first frame of `buf`.
///
/// Returns the payload and the number of bytes the frame occupied, or
/// `None` while the frame is still incomplete. An oversized length is
/// rejected as soon as the header is readable, before the payload is
/// buffered.
pub fn try_deserialize_frame(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, WireError> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };

    let size = header.length as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size });
    }

    let end = HEADER_SIZE + size;
    let Some(payload) = buf.get(HEADER_SIZE..end) else {
        return Ok(None);
    };
    header.verify(payload)?;
    Ok(Some((payload.to_vec(), end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian_payload_length() {
        let frame = serialize_frame(&[7u8; 300]).expect("serialize");
        assert_eq!(&frame[..4], &[0, 0, 1, 44]);
        assert_eq!(
            FrameHeader::parse(&frame).map(|h| h.length),
            Some(300)
        );
    }

    #[test]
    fn test_incomplete_frames_need_more_data() {
        let frame = serialize_frame(b"partial frame").expect("serialize");
        for cut in [0, 3, HEADER_SIZE, frame.len() - 1] {
            assert_eq!(try_deserialize_frame(&frame[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn test_flipped_payload_bit_is_detected() {
        let mut frame = serialize_frame(b"integrity").expect("serialize");
        frame[HEADER_SIZE + 2] ^= 0x01;
        assert!(matches!(
            try_deserialize_frame(&frame),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_consecutive_frames_parse_one_at_a_time() {
        let mut buf = serialize_frame(b"one").expect("serialize");
        buf.extend(serialize_frame(b"two").expect("serialize"));
        buf.extend(serialize_frame(b"").expect("serialize"));

        let mut payloads = Vec::new();
        let mut offset = 0;
        while let Some((payload, consumed)) =
            try_deserialize_frame(&buf[offset..]).expect("valid")
        {
            payloads.push(payload);
            offset += consumed;
        }
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_payload_limit_applies_both_ways() {
        assert!(serialize_frame(&vec![0u8; MAX_PAYLOAD_SIZE]).is_ok());
        assert_eq!(
            serialize_frame(&vec![0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(WireError::FrameTooLarge {
                size: MAX_PAYLOAD_SIZE + 1
            })
        );

        let announced = FrameHeader {
            length: u32::MAX,
            checksum: 0,
        };
        assert_eq!(
            try_deserialize_frame(&announced.to_bytes()),
            Err(WireError::FrameTooLarge {
                size: u32::MAX as usize
            })
        );
    }
}
