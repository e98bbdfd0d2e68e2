//! Bounded FIFO of tasks awaiting a connection.

use std::collections::VecDeque;

use memdb_core::{ClientError, ClientResult};

pub(crate) struct TaskQueue<T> {
    items: VecDeque<T>,
    limit: usize,
}

impl<T> TaskQueue<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
        }
    }

    /// Append at the tail, or reject if the queue is already at its limit.
    /// A rejected item is dropped and the queue is left unchanged.
    pub(crate) fn push(&mut self, item: T) -> ClientResult<()> {
        if self.items.len() >= self.limit {
            return Err(ClientError::AdmissionRejected {
                pending: self.items.len(),
                limit: self.limit,
            });
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Pop the head.
    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
