// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Wire codec for the radio telemetry link
//!
//! One batch per UDP datagram, network byte order, fixed width, no padding:
//!
//! ```text
//! +--------------+-----------+----------------------+
//! | sequence (8) | count (2) | count x frame record |
//! +--------------+-----------+----------------------+
//!
//! frame record:
//! +---------------+------------+----------+
//! | timestamp (8) | can_id (4) | data (8) |
//! +---------------+------------+----------+
//! ```
//!
//! Datagram length is therefore `10 + 20 * count`. Decoding rejects anything
//! that violates that equation; it performs no semantic CAN-id validation.

/// Length of the batch header (sequence + count).
pub const BATCH_HEADER_LEN: usize = 10;

/// Length of one encoded frame record.
pub const FRAME_WIRE_LEN: usize = 20;

/// CAN payload width; shorter payloads are right-padded with zeros.
pub const CAN_DATA_LEN: usize = 8;

/// One observation on the vehicle bus.
///
/// `timestamp` is the source clock in seconds (IEEE-754 double on the wire),
/// `can_id` a 29-bit extended identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanFrame {
    pub timestamp: f64,
    pub can_id: u32,
    pub data: [u8; CAN_DATA_LEN],
}

impl CanFrame {
    /// Build a frame from a payload of up to 8 bytes (right-padded).
    pub fn new(timestamp: f64, can_id: u32, payload: &[u8]) -> Self {
        let mut data = [0u8; CAN_DATA_LEN];
        let len = payload.len().min(CAN_DATA_LEN);
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            timestamp,
            can_id,
            data,
        }
    }

    /// Append the 20-byte wire form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.can_id.to_be_bytes());
        buf.extend_from_slice(&self.data);
    }

    /// Decode one frame record from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_WIRE_LEN {
            return None;
        }

        let timestamp = f64::from_be_bytes(buf[0..8].try_into().ok()?);
        let can_id = u32::from_be_bytes(buf[8..12].try_into().ok()?);
        let mut data = [0u8; CAN_DATA_LEN];
        data.copy_from_slice(&buf[12..20]);

        Some(Self {
            timestamp,
            can_id,
            data,
        })
    }
}

/// A contiguous group of frames transmitted under one sequence number.
///
/// Sequences are assigned by the sender, start at 1, and are never reused
/// within a session. Batch counts stay within `u16` range (the sender caps
/// them at `batch_max`, far below that).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub sequence: u64,
    pub frames: Vec<CanFrame>,
}

impl Batch {
    /// Encoded datagram length for a given frame count.
    pub fn wire_len(count: usize) -> usize {
        BATCH_HEADER_LEN + FRAME_WIRE_LEN * count
    }

    /// Encode header + frames into a fresh datagram buffer.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.frames.len() <= usize::from(u16::MAX));
        let mut buf = Vec::with_capacity(Self::wire_len(self.frames.len()));
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(self.frames.len() as u16).to_be_bytes());
        for frame in &self.frames {
            frame.encode_into(&mut buf);
        }
        buf
    }

    /// Decode a datagram.
    ///
    /// Rejects short buffers and any buffer whose length disagrees with the
    /// count field. Any well-formed buffer decodes; empty batches (count 0)
    /// decode to an empty frame list.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < BATCH_HEADER_LEN {
            return Err(CodecError::Truncated { len: buf.len() });
        }

        let sequence = u64::from_be_bytes(
            buf[0..8]
                .try_into()
                .map_err(|_| CodecError::Truncated { len: buf.len() })?,
        );
        let count = u16::from_be_bytes(
            buf[8..10]
                .try_into()
                .map_err(|_| CodecError::Truncated { len: buf.len() })?,
        ) as usize;

        let expected = Self::wire_len(count);
        if buf.len() != expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        let mut frames = Vec::with_capacity(count);
        let mut offset = BATCH_HEADER_LEN;
        for _ in 0..count {
            let frame = CanFrame::decode(&buf[offset..]).ok_or(CodecError::Truncated {
                len: buf.len(),
            })?;
            frames.push(frame);
            offset += FRAME_WIRE_LEN;
        }

        Ok(Self { sequence, frames })
    }
}

/// Datagram decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the batch header.
    Truncated { len: usize },
    /// Header count disagrees with the buffer length.
    LengthMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "datagram truncated ({} bytes)", len),
            Self::LengthMismatch { expected, actual } => {
                write!(
                    f,
                    "datagram length mismatch (expected {}, got {})",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = CanFrame::new(1234.5, 0x1FF, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = Vec::new();
        frame.encode_into(&mut buf);

        assert_eq!(buf.len(), FRAME_WIRE_LEN);
        assert_eq!(CanFrame::decode(&buf), Some(frame));
    }

    #[test]
    fn test_frame_pads_short_payload() {
        let frame = CanFrame::new(0.0, 42, &[0xAA, 0xBB]);
        assert_eq!(frame.data, [0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_decode_short_buffer() {
        assert_eq!(CanFrame::decode(&[0u8; 19]), None);
    }

    #[test]
    fn test_single_frame_datagram_is_30_bytes() {
        let batch = Batch {
            sequence: 1,
            frames: vec![CanFrame::new(1.0, 0x123, &[1, 2, 3, 4, 5, 6, 7, 8])],
        };
        let wire = batch.encode();

        assert_eq!(wire.len(), 30);
        assert_eq!(&wire[0..8], &1u64.to_be_bytes());
        assert_eq!(&wire[8..10], &1u16.to_be_bytes());

        let decoded = Batch::decode(&wire).expect("well-formed datagram decodes");
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_batch_round_trip_multi_frame() {
        let frames: Vec<CanFrame> = (0..5)
            .map(|i| CanFrame::new(f64::from(i), 0x100 + i as u32, &[i as u8; 8]))
            .collect();
        let batch = Batch {
            sequence: 7,
            frames,
        };

        let wire = batch.encode();
        assert_eq!(wire.len(), Batch::wire_len(5));

        let decoded = Batch::decode(&wire).expect("well-formed datagram decodes");
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.frames, batch.frames);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = Batch::decode(&[0u8; 9]).expect_err("short header must be rejected");
        assert_eq!(err, CodecError::Truncated { len: 9 });
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let batch = Batch {
            sequence: 3,
            frames: vec![CanFrame::new(1.0, 1, &[0; 8])],
        };
        let mut wire = batch.encode();
        wire.push(0); // trailing garbage

        let err = Batch::decode(&wire).expect_err("length mismatch must be rejected");
        assert_eq!(
            err,
            CodecError::LengthMismatch {
                expected: 30,
                actual: 31
            }
        );
    }

    #[test]
    fn test_decode_rejects_undercounted_body() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&9u64.to_be_bytes());
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(&[0u8; FRAME_WIRE_LEN]); // only one frame present

        assert!(matches!(
            Batch::decode(&wire),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_empty_batch_is_total() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u64.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());

        let decoded = Batch::decode(&wire).expect("count 0 is well-formed");
        assert_eq!(decoded.sequence, 5);
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn test_timestamp_survives_as_double() {
        let frame = CanFrame::new(1_757_372_833.125, 0x7FF, &[0; 8]);
        let mut buf = Vec::new();
        frame.encode_into(&mut buf);

        let decoded = CanFrame::decode(&buf).expect("frame decodes");
        assert_eq!(decoded.timestamp, 1_757_372_833.125);
    }
}
