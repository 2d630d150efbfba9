//! Encoded video frame

use bytes::Bytes;
use std::time::Duration;

/// One encoded video frame ready to be packetized
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Encoded frame data
    data: Bytes,
    /// Presentation duration of this frame
    pub duration: Duration,
    /// Frame sequence number
    pub sequence: u64,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(data: Bytes, duration: Duration, sequence: u64) -> Self {
        Self {
            data,
            duration,
            sequence,
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(data: Vec<u8>, duration: Duration, sequence: u64) -> Self {
        Self::new(Bytes::from(data), duration, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = VideoFrame::from_vec(vec![1, 2, 3], Duration::from_millis(33), 4);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
        assert_eq!(frame.sequence, 4);
        assert_eq!(frame.data_bytes(), Bytes::from_static(&[1, 2, 3]));
    }
}
