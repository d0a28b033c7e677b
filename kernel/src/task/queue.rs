//! Ready and wait queues
//!
//! Both queues are threaded through the task arena by slot index. The ready
//! queue is doubly linked with head and tail; the wait queue is singly
//! linked and pushed at the head. A task sits on the ready queue for its
//! whole life, so the wait link is a separate field and parking a task
//! never disturbs the ready ring.

use super::{Pid, TaskTable};

impl TaskTable {
    /// Append a slot at the ready tail.
    pub(crate) fn ready_push_back(&mut self, slot: usize) {
        let old_tail = self.ready_tail;
        if let Some(task) = self.slot_mut(slot) {
            task.set_prev(old_tail);
            task.set_next(None);
        }
        match old_tail {
            Some(tail) => {
                if let Some(task) = self.slot_mut(tail) {
                    task.set_next(Some(slot));
                }
            }
            None => self.ready_head = Some(slot),
        }
        self.ready_tail = Some(slot);
    }

    /// Unlink a slot from the ready queue, fixing head and tail.
    pub(crate) fn ready_unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slot(slot) {
            Some(task) => (task.prev(), task.next()),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(task) = self.slot_mut(p) {
                    task.set_next(next);
                }
            }
            None => self.ready_head = next,
        }
        match next {
            Some(n) => {
                if let Some(task) = self.slot_mut(n) {
                    task.set_prev(prev);
                }
            }
            None => self.ready_tail = prev,
        }

        if let Some(task) = self.slot_mut(slot) {
            task.set_prev(None);
            task.set_next(None);
        }
    }

    /// Ready-queue length, by walking the links.
    pub fn ready_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.ready_head;
        while let Some(slot) = cursor {
            len += 1;
            if len > super::MAX_TASKS {
                break;
            }
            cursor = self.slot(slot).and_then(|t| t.next());
        }
        len
    }

    /// Structural integrity of the ready queue: every link agrees with its
    /// neighbor, the walk is cycle-free, and head/tail are consistent.
    pub fn validate_ready_queue(&self) -> bool {
        let mut visited = 0usize;
        let mut cursor = self.ready_head;
        let mut prev: Option<usize> = None;

        while let Some(slot) = cursor {
            if visited > super::MAX_TASKS {
                return false; // cycle
            }
            let Some(task) = self.slot(slot) else {
                return false; // dangling index
            };
            if task.prev() != prev {
                return false;
            }
            prev = cursor;
            cursor = task.next();
            visited += 1;
        }

        self.ready_tail == prev && (self.ready_head.is_some() || self.ready_tail.is_none())
    }

    /// Push a slot at the wait-queue head.
    pub(crate) fn wait_push_front(&mut self, slot: usize) {
        if self.wait_contains(slot) {
            return;
        }
        let old_head = self.wait_head;
        if let Some(task) = self.slot_mut(slot) {
            task.set_wait_next(old_head);
        }
        self.wait_head = Some(slot);
    }

    /// Remove a slot from the wait queue if present.
    pub(crate) fn wait_unlink(&mut self, slot: usize) {
        let next_of_slot = match self.slot(slot) {
            Some(task) => task.wait_next(),
            None => None,
        };

        if self.wait_head == Some(slot) {
            self.wait_head = next_of_slot;
        } else {
            let mut cursor = self.wait_head;
            while let Some(i) = cursor {
                let next = self.slot(i).and_then(|t| t.wait_next());
                if next == Some(slot) {
                    if let Some(task) = self.slot_mut(i) {
                        task.set_wait_next(next_of_slot);
                    }
                    break;
                }
                cursor = next;
            }
        }

        if let Some(task) = self.slot_mut(slot) {
            task.set_wait_next(None);
        }
    }

    fn wait_contains(&self, slot: usize) -> bool {
        let mut cursor = self.wait_head;
        let mut steps = 0;
        while let Some(i) = cursor {
            if i == slot {
                return true;
            }
            steps += 1;
            if steps > super::MAX_TASKS {
                return false;
            }
            cursor = self.slot(i).and_then(|t| t.wait_next());
        }
        false
    }

    /// Pid at the wait-queue head.
    pub fn wait_head_pid(&self) -> Option<Pid> {
        self.wait_head
            .and_then(|slot| self.slot(slot))
            .map(|task| task.pid)
    }
}
