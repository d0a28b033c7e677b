//! Task management
//!
//! Tasks live in a fixed arena of slots and reference each other by slot
//! index, never by pointer: the ready queue, the wait queue and the
//! parent/child relation are all cyclic, and indices keep the cycles out
//! of the ownership graph. Pid 1 is the kernel task and is never killable.

pub mod lifecycle;
pub mod queue;
pub mod signal;

use core::fmt;

use spin::Mutex;

use crate::{
    error::TaskError,
    mm::{directory::DirectoryRef, VirtualAddress},
    sched,
};
use self::signal::SignalQueue;

/// Task-table capacity.
pub const MAX_TASKS: usize = 64;

/// Kernel stack handed to every task (8 KiB).
pub const KERNEL_STACK_SIZE: usize = 8 * 1024;

/// Task identifier; monotonic from 1, never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Being built, not yet dispatchable
    Initing,
    /// Eligible but not running
    Ready,
    /// Currently dispatched
    Running,
    /// Parked on the wait queue
    Waiting,
    /// Exited, awaiting reaping
    Zombie,
}

/// Ownership identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// Dispatch-time accounting, in timer ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuLoad {
    /// First dispatch
    pub start_time: u64,
    /// Most recent dispatch
    pub last_start_time: u64,
    /// Accumulated running time
    pub load_time: u64,
}

/// One task record.
pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    pub state: TaskState,
    pub esp: usize,
    pub ebp: usize,
    pub eip: usize,
    pub directory: Option<DirectoryRef>,
    pub kernel_stack: VirtualAddress,
    pub exit_code: i32,
    pub owner: u32,
    pub ids: Credentials,
    pub cpu_load: CpuLoad,
    pub signals: SignalQueue,
    /// Ready-queue links (slot indices)
    prev: Option<usize>,
    next: Option<usize>,
    /// Wait-queue link (slot index)
    wait_next: Option<usize>,
}

impl Task {
    fn new(pid: Pid, ppid: Pid, directory: Option<DirectoryRef>, kernel_stack: VirtualAddress) -> Self {
        Self {
            pid,
            ppid,
            state: TaskState::Initing,
            esp: 0,
            ebp: 0,
            eip: 0,
            directory,
            kernel_stack,
            exit_code: 0,
            owner: 0,
            ids: Credentials::default(),
            cpu_load: CpuLoad::default(),
            signals: SignalQueue::new(),
            prev: None,
            next: None,
            wait_next: None,
        }
    }

    pub fn cpu_load_ratio(&self, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.cpu_load.start_time);
        if elapsed == 0 {
            return 0;
        }
        self.cpu_load.load_time * 100 / elapsed
    }
}

/// Signals drained from a task at dispatch, delivered outside the table
/// lock.
pub type PendingDelivery = [Option<signal::PendingSignal>; signal::SIGNAL_QUEUE_DEPTH];

/// Fixed-slot task arena plus the queues threaded through it.
pub struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
    ready_head: Option<usize>,
    ready_tail: Option<usize>,
    wait_head: Option<usize>,
    current: Option<usize>,
    next_pid: u32,
}

pub static TASK_TABLE: Mutex<TaskTable> = Mutex::new(TaskTable::new());

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_TASKS],
            ready_head: None,
            ready_tail: None,
            wait_head: None,
            current: None,
            next_pid: 1,
        }
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(task) if task.pid == pid))
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.slot_of(pid).and_then(|i| self.slots[i].as_ref())
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        let i = self.slot_of(pid)?;
        self.slots[i].as_mut()
    }

    pub fn current(&self) -> Option<&Task> {
        self.current.and_then(|i| self.slots[i].as_ref())
    }

    pub fn current_mut(&mut self) -> Option<&mut Task> {
        let i = self.current?;
        self.slots[i].as_mut()
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|task| task.pid)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a task in a free slot and append it to the ready queue.
    pub fn spawn(
        &mut self,
        ppid: Pid,
        directory: Option<DirectoryRef>,
        kernel_stack: VirtualAddress,
    ) -> Result<Pid, TaskError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(TaskError::TableFull)?;

        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let mut task = Task::new(pid, ppid, directory, kernel_stack);
        task.state = TaskState::Running;
        task.cpu_load.start_time = sched::ticks();
        task.cpu_load.last_start_time = task.cpu_load.start_time;
        self.slots[slot] = Some(task);
        self.ready_push_back(slot);

        if self.current.is_none() {
            self.current = Some(slot);
        }
        Ok(pid)
    }

    /// Mark the current task exited. Reaping is deferred to `kill` or a
    /// waiting parent.
    pub fn exit(&mut self, code: i32) {
        if let Some(task) = self.current_mut() {
            task.exit_code = code;
            task.state = TaskState::Zombie;
        }
    }

    /// Remove a task: free its kernel stack, zombify its children, unlink
    /// it from both queues and clear the slot. The task's page directory is
    /// knowingly leaked. Pid 0, pid 1 and the kernel task are refused.
    pub fn kill(&mut self, pid: Pid) -> Result<Pid, TaskError> {
        if pid.0 <= 1 {
            return Err(TaskError::Protected { pid: pid.0 });
        }
        let slot = self.slot_of(pid).ok_or(TaskError::NotFound { pid: pid.0 })?;
        if self.slots[slot].as_ref().map(|t| t.ppid) == Some(Pid(0)) {
            return Err(TaskError::Protected { pid: pid.0 });
        }

        let kernel_stack = self.slots[slot]
            .as_ref()
            .map(|t| t.kernel_stack)
            .unwrap_or(VirtualAddress(0));
        if !kernel_stack.is_null() {
            crate::mm::heap::kfree(kernel_stack);
        }

        for other in self.slots.iter_mut().flatten() {
            if other.ppid == pid {
                other.state = TaskState::Zombie;
            }
        }

        self.ready_unlink(slot);
        self.wait_unlink(slot);

        if self.current == Some(slot) {
            self.current = self.first_dispatchable();
            if let Some(next) = self.current {
                if let Some(task) = self.slots[next].as_mut() {
                    if task.state == TaskState::Ready {
                        task.state = TaskState::Running;
                    }
                }
            }
        }

        self.slots[slot] = None;
        Ok(pid)
    }

    /// Whether a slot may become `current`: parked and exited tasks stay on
    /// the ready ring but are never dispatched.
    fn dispatchable(&self, slot: usize) -> bool {
        matches!(
            self.slot(slot).map(|task| task.state),
            Some(TaskState::Ready | TaskState::Running)
        )
    }

    /// First dispatchable slot from the ready head.
    fn first_dispatchable(&self) -> Option<usize> {
        let mut cursor = self.ready_head;
        let mut steps = 0;
        while let Some(slot) = cursor {
            if self.dispatchable(slot) {
                return Some(slot);
            }
            steps += 1;
            if steps > MAX_TASKS {
                return None;
            }
            cursor = self.slot(slot).and_then(|t| t.next());
        }
        None
    }

    /// Next dispatchable slot after `from` in ring order, wrapping through
    /// the ready head; `from` itself is reached last.
    fn next_dispatchable_after(&self, from: usize) -> Option<usize> {
        let mut cursor = self.slot(from).and_then(|t| t.next()).or(self.ready_head);
        let mut steps = 0;
        while let Some(slot) = cursor {
            if self.dispatchable(slot) {
                return Some(slot);
            }
            steps += 1;
            if steps > MAX_TASKS {
                return None;
            }
            cursor = self.slot(slot).and_then(|t| t.next()).or(self.ready_head);
        }
        None
    }

    /// Exit code of a finished task, reaping it. Refuses a task that is
    /// still `Running`.
    pub fn reap(&mut self, pid: Pid) -> Result<i32, TaskError> {
        let task = self.task(pid).ok_or(TaskError::NotFound { pid: pid.0 })?;
        debug_assert!(task.state != TaskState::Running);
        let code = task.exit_code;
        self.kill(pid)?;
        Ok(code)
    }

    /// Park a task at the head of the wait queue.
    pub fn lock_task(&mut self, pid: Pid) -> Result<(), TaskError> {
        let slot = self.slot_of(pid).ok_or(TaskError::NotFound { pid: pid.0 })?;
        self.wait_push_front(slot);
        if let Some(task) = self.slots[slot].as_mut() {
            task.state = TaskState::Waiting;
        }
        Ok(())
    }

    /// Remove a task from the wait queue and let it run again.
    pub fn unlock_task(&mut self, pid: Pid) -> Result<(), TaskError> {
        let slot = self.slot_of(pid).ok_or(TaskError::NotFound { pid: pid.0 })?;
        self.wait_unlink(slot);
        if let Some(task) = self.slots[slot].as_mut() {
            task.state = TaskState::Running;
        }
        Ok(())
    }

    /// Dispatch decision, made on every timer tick: account the outgoing
    /// task's cpu time, advance `current` around the ready ring, and drain
    /// the incoming task's pending signals for delivery by the caller.
    pub fn rotate(&mut self, now: u64) -> PendingDelivery {
        let mut delivery: PendingDelivery = [None; signal::SIGNAL_QUEUE_DEPTH];

        let Some(current) = self.current else {
            return delivery;
        };

        if let Some(task) = self.slots[current].as_mut() {
            let ran = now.saturating_sub(task.cpu_load.last_start_time);
            task.cpu_load.load_time += ran;
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        let next = self.next_dispatchable_after(current);
        self.current = next;

        if let Some(slot) = next {
            if let Some(task) = self.slots[slot].as_mut() {
                if task.state == TaskState::Ready {
                    task.state = TaskState::Running;
                }
                task.cpu_load.last_start_time = now;
                let mut i = 0;
                while let Some(pending) = task.signals.pop() {
                    delivery[i] = Some(pending);
                    i += 1;
                }
            }
        }

        delivery
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&Task> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.slots.get_mut(index).and_then(|s| s.as_mut())
    }

    pub(crate) fn slot_index_of(&self, pid: Pid) -> Option<usize> {
        self.slot_of(pid)
    }
}

impl Task {
    pub(crate) fn next(&self) -> Option<usize> {
        self.next
    }

    pub(crate) fn prev(&self) -> Option<usize> {
        self.prev
    }

    pub(crate) fn set_next(&mut self, next: Option<usize>) {
        self.next = next;
    }

    pub(crate) fn set_prev(&mut self, prev: Option<usize>) {
        self.prev = prev;
    }

    pub(crate) fn wait_next(&self) -> Option<usize> {
        self.wait_next
    }

    pub(crate) fn set_wait_next(&mut self, next: Option<usize>) {
        self.wait_next = next;
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Pid of the running task, if tasking is up. Usable from fault paths: a
/// contended table is treated as "unknown" instead of deadlocking.
pub fn current_pid() -> Option<Pid> {
    TASK_TABLE.try_lock().and_then(|table| table.current_pid())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn spawn_n(table: &mut TaskTable, n: usize) -> std::vec::Vec<Pid> {
        (0..n)
            .map(|_| {
                table
                    .spawn(Pid(1), None, VirtualAddress(0))
                    .expect("spawn failed")
            })
            .collect()
    }

    #[test]
    fn pids_are_monotonic_and_unique() {
        let mut table = TaskTable::new();
        let pids = spawn_n(&mut table, 5);
        for (i, pid) in pids.iter().enumerate() {
            assert_eq!(pid.0, i as u32 + 1);
        }
    }

    #[test]
    fn first_spawn_becomes_current() {
        let mut table = TaskTable::new();
        let pid = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        assert_eq!(table.current_pid(), Some(pid));
        assert_eq!(table.current().unwrap().state, TaskState::Running);
    }

    #[test]
    fn table_capacity_is_enforced_without_side_effects() {
        let mut table = TaskTable::new();
        spawn_n(&mut table, MAX_TASKS);
        let before = table.ready_len();
        assert_eq!(
            table.spawn(Pid(1), None, VirtualAddress(0)),
            Err(TaskError::TableFull)
        );
        assert_eq!(table.ready_len(), before);
        assert!(table.validate_ready_queue());
    }

    #[test]
    fn kill_refuses_protected_pids() {
        let mut table = TaskTable::new();
        spawn_n(&mut table, 3);
        let ready = table.ready_len();
        assert_eq!(table.kill(Pid(0)), Err(TaskError::Protected { pid: 0 }));
        assert_eq!(table.kill(Pid(1)), Err(TaskError::Protected { pid: 1 }));
        assert_eq!(table.ready_len(), ready);
    }

    #[test]
    fn kill_refuses_children_of_the_kernel() {
        let mut table = TaskTable::new();
        // ppid 0 names the kernel task itself
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let worker = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        let orphan = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();

        assert!(table.kill(worker).is_ok());
        assert_eq!(
            table.kill(orphan),
            Err(TaskError::Protected { pid: orphan.0 })
        );
    }

    #[test]
    fn kill_unlinks_and_zombifies_children() {
        let mut table = TaskTable::new();
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let parent = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        let child_a = table.spawn(parent, None, VirtualAddress(0)).unwrap();
        let child_b = table.spawn(parent, None, VirtualAddress(0)).unwrap();

        let before = table.ready_len();
        table.kill(parent).unwrap();

        assert_eq!(table.ready_len(), before - 1);
        assert!(table.task(parent).is_none());
        assert_eq!(table.task(child_a).unwrap().state, TaskState::Zombie);
        assert_eq!(table.task(child_b).unwrap().state, TaskState::Zombie);
        assert!(table.validate_ready_queue());
    }

    #[test]
    fn kill_of_current_advances_current() {
        let mut table = TaskTable::new();
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let worker = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        // force dispatch onto the worker
        while table.current_pid() != Some(worker) {
            table.rotate(0);
        }
        table.kill(worker).unwrap();
        assert!(table.current_pid().is_some());
        assert_ne!(table.current_pid(), Some(worker));
    }

    #[test]
    fn exit_defers_reaping() {
        let mut table = TaskTable::new();
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let worker = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        while table.current_pid() != Some(worker) {
            table.rotate(0);
        }
        table.exit(42);
        assert_eq!(table.task(worker).unwrap().state, TaskState::Zombie);
        assert_eq!(table.task(worker).unwrap().exit_code, 42);

        assert_eq!(table.reap(worker), Ok(42));
        assert!(table.task(worker).is_none());
    }

    #[test]
    fn rotate_cycles_through_the_ready_ring() {
        let mut table = TaskTable::new();
        let pids = spawn_n(&mut table, 3);
        let mut seen = std::vec::Vec::new();
        for _ in 0..6 {
            table.rotate(0);
            seen.push(table.current_pid().unwrap());
        }
        for pid in pids {
            assert!(seen.contains(&pid));
        }
    }

    #[test]
    fn rotate_accounts_cpu_load() {
        let mut table = TaskTable::new();
        let pid = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        {
            let task = table.task_mut(pid).unwrap();
            task.cpu_load.start_time = 0;
            task.cpu_load.last_start_time = 0;
        }
        table.rotate(10);
        table.rotate(25);
        let task = table.task(pid).unwrap();
        assert_eq!(task.cpu_load.load_time, 25);
        assert_eq!(task.cpu_load_ratio(100), 25);
    }

    #[test]
    fn dispatch_skips_a_parked_task() {
        let mut table = TaskTable::new();
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let parked = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        let worker = table.spawn(kernel, None, VirtualAddress(0)).unwrap();

        table.lock_task(parked).unwrap();

        // rotation cycles across the parked slot without ever landing on it
        for _ in 0..8 {
            table.rotate(0);
            let current = table.current().unwrap();
            assert_ne!(current.pid, parked, "parked task was dispatched");
            assert_eq!(current.state, TaskState::Running);
        }

        // a kill that forces current back to the head must skip it too
        while table.current_pid() != Some(worker) {
            table.rotate(0);
        }
        table.kill(worker).unwrap();
        let current = table.current().unwrap();
        assert_ne!(current.pid, parked);
        assert_eq!(current.state, TaskState::Running);

        // once released, the task is dispatched again
        table.unlock_task(parked).unwrap();
        let mut seen = false;
        for _ in 0..8 {
            table.rotate(0);
            if table.current_pid() == Some(parked) {
                seen = true;
            }
        }
        assert!(seen, "released task never dispatched");
    }

    #[test]
    fn wait_queue_push_and_remove() {
        let mut table = TaskTable::new();
        let kernel = table.spawn(Pid(0), None, VirtualAddress(0)).unwrap();
        let a = table.spawn(kernel, None, VirtualAddress(0)).unwrap();
        let b = table.spawn(kernel, None, VirtualAddress(0)).unwrap();

        table.lock_task(a).unwrap();
        table.lock_task(b).unwrap();
        // head-push ordering: most recently parked first
        assert_eq!(table.wait_head_pid(), Some(b));
        assert_eq!(table.task(a).unwrap().state, TaskState::Waiting);

        table.unlock_task(b).unwrap();
        assert_eq!(table.wait_head_pid(), Some(a));
        assert_eq!(table.task(b).unwrap().state, TaskState::Running);

        table.unlock_task(a).unwrap();
        assert_eq!(table.wait_head_pid(), None);
    }
}
