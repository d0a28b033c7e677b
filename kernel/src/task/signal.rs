//! Signals
//!
//! A process-wide table maps signal numbers to handlers; each task carries
//! a small ring of pending signals that the dispatcher drains when the task
//! is next scheduled. The only handler the kernel itself installs is
//! `SIGKILL`.

use spin::Mutex;

use super::{lifecycle, Pid, TASK_TABLE};
use crate::error::{KernelResult, SignalError, TaskError};

/// Size of the handler table.
pub const SIGNALS_COUNT: usize = 32;

/// Pending signals a task can hold before further ones are refused.
pub const SIGNAL_QUEUE_DEPTH: usize = 8;

pub const SIGKILL: i32 = 9;

/// A handler runs in the context of the signalled task, at dispatch.
pub type SignalHandler = fn(i32);

/// One entry of the handler table.
#[derive(Debug, Clone, Copy)]
pub struct SignalSlot {
    pub name: &'static str,
    pub signum: i32,
    pub handler: Option<SignalHandler>,
}

impl SignalSlot {
    const fn empty() -> Self {
        Self {
            name: "",
            signum: 0,
            handler: None,
        }
    }
}

static SIGNALS: Mutex<[SignalSlot; SIGNALS_COUNT]> =
    Mutex::new([SignalSlot::empty(); SIGNALS_COUNT]);

/// A signal queued on a task, with the handler captured at send time.
#[derive(Debug, Clone, Copy)]
pub struct PendingSignal {
    pub signum: i32,
    pub handler: SignalHandler,
}

/// Fixed ring of pending signals.
pub struct SignalQueue {
    entries: [Option<PendingSignal>; SIGNAL_QUEUE_DEPTH],
    head: usize,
    len: usize,
}

impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            entries: [None; SIGNAL_QUEUE_DEPTH],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, pending: PendingSignal) -> Result<(), ()> {
        if self.len == SIGNAL_QUEUE_DEPTH {
            return Err(());
        }
        let tail = (self.head + self.len) % SIGNAL_QUEUE_DEPTH;
        self.entries[tail] = Some(pending);
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<PendingSignal> {
        if self.len == 0 {
            return None;
        }
        let pending = self.entries[self.head].take();
        self.head = (self.head + 1) % SIGNAL_QUEUE_DEPTH;
        self.len -= 1;
        pending
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn register_handler(signum: i32, handler: SignalHandler, name: &'static str) {
    log::info!("signal: [{}] {}", signum, name);
    SIGNALS.lock()[signum as usize] = SignalSlot {
        name,
        signum,
        handler: Some(handler),
    };
}

/// Reset the handler table and install the kernel's own handlers.
pub fn init_signals() {
    let mut table = SIGNALS.lock();
    *table = [SignalSlot::empty(); SIGNALS_COUNT];
    drop(table);
    register_handler(SIGKILL, kill_handler, "SIGKILL");
}

/// The `SIGKILL` disposition: exit with code 0 and remove the task.
fn kill_handler(signum: i32) {
    if signum != SIGKILL {
        return;
    }
    if let Some(task) = TASK_TABLE.lock().current_mut() {
        task.exit_code = 0;
    }
    if let Ok(pid) = lifecycle::getpid() {
        let _ = lifecycle::kill_task(pid);
    }
}

/// Queue `signum` on the target task; the registered handler runs when the
/// task is next dispatched. Pid 0 and pid 1 are protected.
pub fn signal(pid: Pid, signum: i32) -> KernelResult<()> {
    if pid.0 <= 1 {
        return Err(TaskError::Protected { pid: pid.0 }.into());
    }
    if signum < 0 || signum as usize >= SIGNALS_COUNT {
        return Err(SignalError::InvalidSignal { signum }.into());
    }

    let handler = SIGNALS.lock()[signum as usize]
        .handler
        .ok_or(SignalError::NotRegistered { signum })?;

    let mut table = TASK_TABLE.lock();
    let task = table
        .task_mut(pid)
        .ok_or(TaskError::NotFound { pid: pid.0 })?;
    task.signals
        .push(PendingSignal { signum, handler })
        .map_err(|_| SignalError::QueueFull { pid: pid.0 })?;
    Ok(())
}

/// Handler registered for `signum`, if any.
pub fn handler_for(signum: i32) -> Option<SignalHandler> {
    if signum < 0 || signum as usize >= SIGNALS_COUNT {
        return None;
    }
    SIGNALS.lock()[signum as usize].handler
}
