//! Linked-list backing store with an explicit bound.

use std::collections::LinkedList;

use super::RawFifo;

/// Unbounded-by-structure list capped at a fixed capacity.
#[derive(Debug)]
pub struct ListFifo<T> {
    items: LinkedList<T>,
    capacity: usize,
}

impl<T> RawFifo for ListFifo<T> {
    type Item = T;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: LinkedList::new(),
            capacity,
        }
    }

    fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn front(&self) -> Option<&T> {
        self.items.front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
