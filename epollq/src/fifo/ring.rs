//! Fixed-size ring buffer.

use super::RawFifo;

/// Ring buffer over a boxed slot array.
///
/// Slots are allocated once at construction. `head` indexes the oldest
/// element; the tail is derived from `head + len`.
#[derive(Debug)]
pub struct RingFifo<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> RingFifo<T> {
    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }
}

impl<T> RawFifo for RingFifo<T> {
    type Item = T;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            head: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let tail = self.slot(self.len);
        self.slots[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = self.slot(1);
        self.len -= 1;
        item
    }

    fn front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}
