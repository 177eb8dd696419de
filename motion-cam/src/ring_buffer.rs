use std::collections::VecDeque;

use frame_source::Frame;

struct RingBufferEntry {
    /// Insertion order, unique over the life of the buffer.
    order: u64,
    frame: Frame,
}

/// The most recent frames, oldest first, kept for pre-roll.
pub struct RingBuffer {
    capacity: usize,
    next_order: u64,
    inner: VecDeque<RingBufferEntry>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_order: 0,
            inner: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn trim(&mut self) {
        while self.inner.len() > self.capacity {
            self.inner.pop_front();
        }
    }

    /// Append a frame, evicting the oldest when full.
    ///
    /// A frame older than the newest buffered frame is dropped.
    pub fn push(&mut self, frame: &Frame) {
        if self.capacity == 0 {
            return;
        }
        if let Some(newest) = self.inner.back() {
            if frame.timestamp < newest.frame.timestamp {
                tracing::debug!(
                    "dropping frame {} from pre-roll: timestamp before frame {}",
                    frame.fno,
                    newest.frame.fno
                );
                return;
            }
        }
        self.inner.push_back(RingBufferEntry {
            order: self.next_order,
            frame: frame.clone(),
        });
        self.next_order += 1;
        self.trim();
    }

    /// Remove and return all buffered frames, oldest first.
    pub fn drain(&mut self) -> Vec<Frame> {
        let entries = std::mem::take(&mut self.inner);
        debug_assert!(entries.iter().zip(entries.iter().skip(1)).all(|(a, b)| a.order < b.order));
        entries.into_iter().map(|e| e.frame).collect()
    }
}
