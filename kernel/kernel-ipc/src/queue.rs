//! # Bounded Message Queues

use crate::message::{NIL, header_mut};
use kernel_addr::FrameNumber;
use kernel_sched::TaskId;
use kernel_vmem::PhysAccess;

/// A bounded FIFO of message frames, linked through the frames themselves.
///
/// Invariant: `count` equals the number of linked messages and never
/// exceeds `capacity`.
#[derive(Debug)]
pub struct MessageQueue {
    head: u64,
    tail: u64,
    count: usize,
    capacity: usize,
    /// Receiver parked on the empty queue, woken by the next enqueue.
    pub(crate) waiting_receiver: Option<TaskId>,
    /// Sender parked on the full queue, woken by the next dequeue.
    pub(crate) waiting_sender: Option<TaskId>,
}

impl MessageQueue {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            head: NIL,
            tail: NIL,
            count: 0,
            capacity,
            waiting_receiver: None,
            waiting_sender: None,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Link a message frame at the tail. Returns `false` when full.
    pub(crate) fn enqueue<M: PhysAccess>(&mut self, m: &M, frame: FrameNumber) -> bool {
        if self.is_full() {
            return false;
        }
        unsafe { header_mut(m, frame) }.next = NIL;
        if self.tail == NIL {
            self.head = frame.as_u64();
        } else {
            unsafe { header_mut(m, FrameNumber::new(self.tail)) }.next = frame.as_u64();
        }
        self.tail = frame.as_u64();
        self.count += 1;
        true
    }

    /// The head message, left in place.
    pub(crate) fn peek(&self) -> Option<FrameNumber> {
        (self.head != NIL).then(|| FrameNumber::new(self.head))
    }

    /// Unlink and return the head message.
    pub(crate) fn dequeue<M: PhysAccess>(&mut self, m: &M) -> Option<FrameNumber> {
        let head = self.peek()?;
        self.head = unsafe { header_mut(m, head) }.next;
        if self.head == NIL {
            self.tail = NIL;
        }
        self.count -= 1;
        Some(head)
    }

    /// Drain every message into `free`, for queue teardown.
    pub(crate) fn drain<M: PhysAccess>(&mut self, m: &M, mut free: impl FnMut(FrameNumber)) {
        while let Some(frame) = self.dequeue(m) {
            free(frame);
        }
    }

    /// Walk the links and count them (test/debug aid for the
    /// count-matches-links invariant).
    #[must_use]
    pub fn linked_len<M: PhysAccess>(&self, m: &M) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while cursor != NIL {
            n += 1;
            cursor = unsafe { header_mut(m, FrameNumber::new(cursor)) }.next;
        }
        n
    }
}
