//! Bounded drop-oldest frame queue
//!
//! The capture thread pushes into a `FrameQueue` and never waits; when the
//! queue is full the oldest undelivered frame is discarded and counted. The
//! decode thread blocks in [`FrameQueue::pop`] until a frame arrives or the
//! queue is closed and drained.

use crate::types::RawFrame;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default queue depth
pub const DEFAULT_DEPTH: usize = 256;

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<RawFrame>,
    closed: bool,
    dropped: u64,
    pushed: u64,
}

/// Result of a timed pop
#[derive(Debug, PartialEq)]
pub enum Pop {
    Frame(RawFrame),
    /// Nothing arrived before the timeout
    Empty,
    /// Closed and drained
    Closed,
}

#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEPTH)
    }
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
                pushed: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest one when full.
    ///
    /// Returns the evicted frame, if any. Frames pushed after `close()` are
    /// discarded and returned as well.
    pub fn push(&self, frame: RawFrame) -> Option<RawFrame> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Some(frame);
        }

        let evicted = if inner.items.len() >= self.capacity {
            inner.dropped += 1;
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(frame);
        inner.pushed += 1;
        drop(inner);

        self.ready.notify_one();
        evicted
    }

    /// Block until a frame is available. `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<RawFrame> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.items.pop_front() {
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Like [`FrameQueue::pop`] but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.items.pop_front() {
                return Pop::Frame(frame);
            }
            if inner.closed {
                return Pop::Closed;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return match inner.items.pop_front() {
                    Some(frame) => Pop::Frame(frame),
                    None => Pop::Empty,
                };
            }
        }
    }

    /// Stop accepting frames and wake every waiter. Queued frames stay poppable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    /// Discard everything still queued
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        n
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by overflow so far
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Frames accepted so far
    pub fn pushed(&self) -> u64 {
        self.inner.lock().pushed
    }
}
