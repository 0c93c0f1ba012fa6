//! Captured frames.
//!
//! A `Frame` is one image grabbed from the exit-lane camera. It is owned
//! exclusively by the cycle that captured it and dropped as soon as
//! recognition has run; nothing in this crate persists frame bytes.

use std::time::SystemTime;

/// One captured image, encoded as the camera delivered it (JPEG for the
/// spool backend, synthetic grayscale for `stub://` sources).
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
}

impl Frame {
    pub(crate) fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
        }
    }

    /// Encoded image bytes, handed to the recognizer and nowhere else.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_exposes_dimensions_and_bytes() {
        let frame = Frame::new(vec![1, 2, 3], 640, 480);
        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 480);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.byte_len(), 3);
    }
}
