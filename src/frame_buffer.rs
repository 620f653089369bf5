// src/frame_buffer.rs
//
// Bounded ring of the most recent frames. Every incoming frame is pushed
// unconditionally (even frames the tracker never sees), so a materialized
// clip keeps near-full temporal resolution. Read only when a clip fires.

use crate::types::Frame;
use std::collections::VecDeque;

pub struct FrameRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Clone the current contents oldest-first. The live buffer keeps
    /// rolling; the snapshot is what gets written to disk.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: f64) -> Frame {
        Frame {
            data: vec![0u8; 12],
            width: 2,
            height: 2,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut buf = FrameRingBuffer::new(3);
        for i in 0..10 {
            buf.push(frame(i as f64));
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_oldest_frames_are_dropped_first() {
        let mut buf = FrameRingBuffer::new(3);
        for i in 0..5 {
            buf.push(frame(i as f64));
        }
        let snap = buf.snapshot();
        let stamps: Vec<f64> = snap.iter().map(|f| f.timestamp_ms).collect();
        assert_eq!(stamps, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_snapshot_leaves_buffer_intact() {
        let mut buf = FrameRingBuffer::new(4);
        buf.push(frame(1.0));
        buf.push(frame(2.0));
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(buf.len(), 2);
    }
}
