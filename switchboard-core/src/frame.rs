//! Timestamped media frames moved through patches

use bytes::Bytes;

/// One unit of media: an RTP-like header plus an opaque payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFrame {
    /// RTP payload type of the payload
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Media timestamp in clock-rate ticks
    pub timestamp: u32,
    /// Marker bit (end of video frame, start of talk spurt)
    pub marker: bool,
    /// Encoded or raw payload
    pub payload: Bytes,
}

impl MediaFrame {
    /// Create a frame carrying `payload`
    pub fn new(payload_type: u8, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            payload_type,
            sequence: 0,
            timestamp,
            marker: false,
            payload: payload.into(),
        }
    }

    /// Builder-style sequence number
    #[must_use]
    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    /// Builder-style marker bit
    #[must_use]
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// True when the frame carries no payload
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Clear header and payload so the frame can be reused for the next read
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_everything() {
        let mut frame = MediaFrame::new(0, 160, vec![1u8, 2, 3])
            .with_sequence(7)
            .with_marker(true);
        assert_eq!(frame.payload_len(), 3);
        frame.reset();
        assert_eq!(frame, MediaFrame::default());
        assert!(frame.is_empty());
    }
}
