//! Task lifecycle
//!
//! Creation by fork (address-space clone plus a captured fork point),
//! cooperative destruction through exit/kill/wait, and the one-time boot
//! step that relocates the loader's stack and registers the kernel itself
//! as task 1. Everything that touches the shared table runs with
//! interrupts off.

use spin::Mutex;

use super::{Pid, TaskState, KERNEL_STACK_SIZE, TASK_TABLE};
use crate::{
    arch::{context, interrupts},
    error::{KernelResult, TaskError},
    mm::{
        directory::{self, DirectoryRef},
        heap,
    },
    sched,
};

/// Top of the relocated kernel stack.
#[cfg(all(target_arch = "x86", target_os = "none"))]
const NEW_STACK_TOP: usize = 0xE000_0000;

/// ESP at kernel entry, recorded before anything grows the stack.
static INITIAL_ESP: Mutex<usize> = Mutex::new(0);

/// Hook into the boot collaborator's TSS: called with the kernel stack top
/// before dropping to user mode.
static TSS_STACK_HOOK: Mutex<Option<fn(usize)>> = Mutex::new(None);

/// Record the boot stack pointer. Must run first thing at kernel entry.
pub fn record_boot_stack(esp: usize) {
    *INITIAL_ESP.lock() = esp;
}

/// Register the TSS stack-setting hook.
pub fn register_tss_hook(hook: fn(usize)) {
    *TSS_STACK_HOOK.lock() = Some(hook);
}

/// Relocate the boot stack and register the kernel as task 1.
pub fn init_tasking() -> KernelResult<Pid> {
    let _guard = interrupts::disabled();

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    move_stack(NEW_STACK_TOP, KERNEL_STACK_SIZE)?;

    let kernel_stack = heap::kmalloc_a(KERNEL_STACK_SIZE)?;
    let pid = TASK_TABLE
        .lock()
        .spawn(Pid(0), directory::current_directory(), kernel_stack)
        .map_err(crate::error::KernelError::Task)?;

    log::info!("task: kernel task {} registered", pid);
    Ok(pid)
}

/// Move the live stack to a fresh mapping at `new_top`: map pages, copy the
/// old contents, rewrite every word that pointed into the old stack, then
/// switch ESP/EBP over.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn move_stack(new_top: usize, size: usize) -> KernelResult<()> {
    let dir = directory::current_directory().ok_or(crate::error::KernelError::NotInitialized {
        subsystem: "paging",
    })?;
    // SAFETY: exclusive access during the interrupt-disabled init window.
    let dir_ref = unsafe { dir.get() };

    let mut addr = new_top - size;
    while addr <= new_top {
        let pte = dir_ref
            .create_page(crate::mm::VirtualAddress(addr), false)
            .map_err(crate::error::KernelError::Pool)?;
        crate::mm::frame::allocate_frame(
            pte,
            false,
            crate::mm::frame::PageFlags::PRESENT
                | crate::mm::frame::PageFlags::RW
                | crate::mm::frame::PageFlags::USER,
        );
        addr += crate::mm::PAGE_SIZE;
    }

    // SAFETY: the new range was just mapped; the reload flushes it in.
    unsafe {
        context::reload_address_space();
    }

    let initial_esp = *INITIAL_ESP.lock();
    let (old_esp, old_ebp) = context::stack_pointers();
    let offset = new_top - initial_esp;
    let new_esp = old_esp + offset;
    let new_ebp = old_ebp + offset;

    // SAFETY: source is the live boot stack, destination the fresh mapping.
    unsafe {
        core::ptr::copy_nonoverlapping(
            old_esp as *const u8,
            new_esp as *mut u8,
            initial_esp - old_esp,
        );
    }

    // Rewrite saved frame pointers: only words whose value lies inside the
    // old stack move with it; heap and code pointers stay untouched.
    let mut scan = new_top;
    while scan > new_top - size {
        scan -= core::mem::size_of::<usize>();
        // SAFETY: `scan` walks the freshly mapped stack copy.
        unsafe {
            let word = *(scan as *const usize);
            if old_esp < word && word < initial_esp {
                *(scan as *mut usize) = word + offset;
            }
        }
    }

    // SAFETY: the copied stack is a pointer-rewritten image of the live one.
    unsafe {
        context::switch_stack(new_esp, new_ebp);
    }
    Ok(())
}

/// Fork the current task: deep-copy its address space, give the child its
/// own kernel stack and queue slot, and capture the fork point. The parent
/// gets the child's pid; the child, once dispatched at the same point,
/// gets 0.
pub fn fork() -> KernelResult<Pid> {
    let _guard = interrupts::disabled();

    let (parent_pid, parent_dir) = {
        let table = TASK_TABLE.lock();
        let task = table.current().ok_or(TaskError::NoCurrentTask)?;
        (
            task.pid,
            task.directory.ok_or(crate::error::KernelError::NotInitialized {
                subsystem: "paging",
            })?,
        )
    };

    // SAFETY: the source directory is stable for the duration of the clone;
    // interrupts are off.
    let child_dir = directory::clone_directory(unsafe { parent_dir.get() })?;

    let kernel_stack = match heap::kmalloc_a(KERNEL_STACK_SIZE) {
        Ok(stack) => stack,
        Err(e) => {
            directory::destroy_directory(child_dir);
            return Err(e);
        }
    };
    let child_pid = match TASK_TABLE
        .lock()
        .spawn(parent_pid, Some(child_dir), kernel_stack)
    {
        Ok(pid) => pid,
        Err(e) => {
            heap::kfree(kernel_stack);
            directory::destroy_directory(child_dir);
            return Err(crate::error::KernelError::Task(e));
        }
    };

    // The child resumes here with `current` naming it.
    let eip = context::read_eip();

    if TASK_TABLE.lock().current_pid() == Some(parent_pid) {
        let (esp, ebp) = context::stack_pointers();
        let mut table = TASK_TABLE.lock();
        if let Some(child) = table.task_mut(child_pid) {
            child.esp = esp;
            child.ebp = ebp;
            child.eip = eip;
        }
        Ok(child_pid)
    } else {
        Ok(Pid(0))
    }
}

/// Fork and run `entry` in the child; the child removes its own slot when
/// `entry` returns. The parent gets the child's pid.
pub fn init_task(entry: fn()) -> KernelResult<Pid> {
    let pid = fork()?;
    if pid.0 == 0 {
        run_child(entry);
        // the slot is gone; spin until the dispatcher moves on
        loop {
            core::hint::spin_loop();
        }
    }
    Ok(pid)
}

/// Child-side body of [`init_task`]: run the payload, then tear the child's
/// own slot down. After this returns the task only exists as stack frames
/// awaiting the next dispatch.
fn run_child(entry: fn()) {
    entry();
    if let Ok(own) = getpid() {
        let _ = kill_task(own);
    }
}

/// Busy-wait until `pid` stops running, then reap it and return its exit
/// code.
pub fn task_wait(pid: Pid) -> KernelResult<i32> {
    loop {
        {
            let table = TASK_TABLE.lock();
            let task = table.task(pid).ok_or(TaskError::NotFound { pid: pid.0 })?;
            if task.state != TaskState::Running {
                break;
            }
        }
        sched::sleep_ticks(1);
    }

    let _guard = interrupts::disabled();
    TASK_TABLE
        .lock()
        .reap(pid)
        .map_err(crate::error::KernelError::Task)
}

/// Remove a task. Pid 0 and pid 1 are refused.
pub fn kill_task(pid: Pid) -> KernelResult<Pid> {
    let _guard = interrupts::disabled();
    TASK_TABLE
        .lock()
        .kill(pid)
        .map_err(crate::error::KernelError::Task)
}

/// Mark the current task exited; reaping is deferred.
pub fn task_exit(code: i32) {
    let _guard = interrupts::disabled();
    TASK_TABLE.lock().exit(code);
}

/// Park a task on the wait queue.
pub fn lock_task(pid: Pid) -> KernelResult<()> {
    let _guard = interrupts::disabled();
    TASK_TABLE
        .lock()
        .lock_task(pid)
        .map_err(crate::error::KernelError::Task)
}

/// Release a task from the wait queue.
pub fn unlock_task(pid: Pid) -> KernelResult<()> {
    let _guard = interrupts::disabled();
    TASK_TABLE
        .lock()
        .unlock_task(pid)
        .map_err(crate::error::KernelError::Task)
}

pub fn getpid() -> KernelResult<Pid> {
    TASK_TABLE
        .lock()
        .current_pid()
        .ok_or(TaskError::NoCurrentTask.into())
}

pub fn getppid() -> KernelResult<Pid> {
    TASK_TABLE
        .lock()
        .current()
        .map(|task| task.ppid)
        .ok_or(TaskError::NoCurrentTask.into())
}

pub fn getuid() -> KernelResult<u32> {
    TASK_TABLE
        .lock()
        .current()
        .map(|task| task.owner)
        .ok_or(TaskError::NoCurrentTask.into())
}

pub fn is_pid_valid(pid: Pid) -> bool {
    TASK_TABLE.lock().task(pid).is_some()
}

/// Page directory of the current task.
pub fn current_task_directory() -> Option<DirectoryRef> {
    TASK_TABLE.lock().current().and_then(|task| task.directory)
}

pub fn set_task_uid(pid: Pid, uid: u32) -> KernelResult<()> {
    with_task(pid, |task| task.ids.uid = uid)
}

pub fn set_task_gid(pid: Pid, gid: u32) -> KernelResult<()> {
    with_task(pid, |task| task.ids.gid = gid)
}

pub fn set_task_euid(pid: Pid, euid: u32) -> KernelResult<()> {
    with_task(pid, |task| task.ids.euid = euid)
}

pub fn set_task_egid(pid: Pid, egid: u32) -> KernelResult<()> {
    with_task(pid, |task| task.ids.egid = egid)
}

fn with_task(pid: Pid, f: impl FnOnce(&mut super::Task)) -> KernelResult<()> {
    let mut table = TASK_TABLE.lock();
    let task = table
        .task_mut(pid)
        .ok_or(TaskError::NotFound { pid: pid.0 })?;
    f(task);
    Ok(())
}

/// Log every live task.
pub fn log_all_tasks() {
    let table = TASK_TABLE.lock();
    let mut cursor = 0;
    while cursor < super::MAX_TASKS {
        if let Some(task) = table.slot(cursor) {
            log::debug!(
                "task: pid {} ppid {} owner {} state {:?}",
                task.pid,
                task.ppid,
                task.owner,
                task.state
            );
        }
        cursor += 1;
    }
}

/// Drop the current task to ring 3. The TSS must learn the kernel stack
/// top first so interrupts can come back up.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn switch_to_user_mode() -> KernelResult<()> {
    let stack_top = {
        let table = TASK_TABLE.lock();
        let task = table.current().ok_or(TaskError::NoCurrentTask)?;
        task.kernel_stack.0 + KERNEL_STACK_SIZE
    };

    if let Some(hook) = *TSS_STACK_HOOK.lock() {
        hook(stack_top);
    }

    // SAFETY: segments 0x1B/0x23 are the boot collaborator's user
    // descriptors; the TSS was just pointed at our kernel stack.
    unsafe {
        context::enter_user_mode();
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::directory::DirectoryRef;
    use crate::task::signal::{self, SIGKILL};
    use crate::testutil;

    /// Make sure the shared table has a kernel task with an address space,
    /// and return its pid. The global table persists across tests, so
    /// everything below asserts relative to it.
    fn ensure_tasking() -> Pid {
        testutil::init_globals();
        if directory::current_directory().is_none() {
            let dir = testutil::leak_directory();
            directory::set_current_directory(DirectoryRef::new(
                core::ptr::NonNull::new(dir as *mut _).unwrap(),
            ));
        }
        if let Some(pid) = TASK_TABLE.lock().current_pid() {
            return pid;
        }
        init_tasking().expect("tasking setup failed")
    }

    fn dispatch_onto(pid: Pid) {
        let mut table = TASK_TABLE.lock();
        let mut guard = 0;
        while table.current_pid() != Some(pid) {
            table.rotate(0);
            guard += 1;
            assert!(guard < super::super::MAX_TASKS * 2, "task never dispatched");
        }
    }

    #[test]
    fn fork_returns_child_pid_to_parent() {
        let _g = testutil::global_lock();
        let kernel = ensure_tasking();
        dispatch_onto(kernel);

        let child = fork().unwrap();
        assert_ne!(child, Pid(0));
        assert!(is_pid_valid(child));
        assert_eq!(TASK_TABLE.lock().task(child).unwrap().ppid, kernel);

        // the clone is private: same shape, different frames
        let parent_dir = current_task_directory().unwrap();
        let child_dir = TASK_TABLE.lock().task(child).unwrap().directory.unwrap();
        assert_ne!(parent_dir.as_ptr(), child_dir.as_ptr());

        kill_task(child).unwrap();
    }

    #[test]
    fn wait_reaps_an_exited_child() {
        let _g = testutil::global_lock();
        let kernel = ensure_tasking();
        dispatch_onto(kernel);

        let child = fork().unwrap();
        let ready_before = TASK_TABLE.lock().ready_len();

        dispatch_onto(child);
        task_exit(42);
        dispatch_onto(kernel);

        assert_eq!(task_wait(child).unwrap(), 42);
        assert!(!is_pid_valid(child));
        assert_eq!(TASK_TABLE.lock().ready_len(), ready_before - 1);
        assert!(TASK_TABLE.lock().validate_ready_queue());
    }

    #[test]
    fn wait_on_unknown_pid_fails() {
        let _g = testutil::global_lock();
        ensure_tasking();
        assert!(task_wait(Pid(9999)).is_err());
    }

    #[test]
    fn sigkill_removes_the_target_on_its_next_dispatch() {
        let _g = testutil::global_lock();
        let kernel = ensure_tasking();
        dispatch_onto(kernel);
        signal::init_signals();

        let child_a = fork().unwrap();
        dispatch_onto(kernel);
        let child_b = fork().unwrap();

        signal::signal(child_a, SIGKILL).unwrap();
        assert_eq!(
            TASK_TABLE.lock().task(child_a).unwrap().signals.len(),
            1
        );

        // tick until child A is dispatched and its pending SIGKILL lands
        let mut guard = 0;
        while is_pid_valid(child_a) {
            crate::sched::timer_tick();
            guard += 1;
            assert!(guard < 64, "SIGKILL never delivered");
        }

        assert!(is_pid_valid(child_b));
        assert_ne!(
            TASK_TABLE.lock().task(child_b).unwrap().state,
            TaskState::Zombie
        );

        dispatch_onto(kernel);
        kill_task(child_b).unwrap();
    }

    #[test]
    fn init_task_child_body_tears_down_its_slot() {
        use core::sync::atomic::{AtomicBool, Ordering};

        static PAYLOAD_RAN: AtomicBool = AtomicBool::new(false);
        fn payload() {
            PAYLOAD_RAN.store(true, Ordering::SeqCst);
        }

        let _g = testutil::global_lock();
        let kernel = ensure_tasking();
        dispatch_onto(kernel);

        // parent side: init_task hands back the child's pid, child queued
        let child = init_task(payload).unwrap();
        assert_ne!(child, Pid(0));
        assert!(is_pid_valid(child));

        // child side: once dispatched, the body runs the payload and then
        // removes its own slot
        dispatch_onto(child);
        PAYLOAD_RAN.store(false, Ordering::SeqCst);
        run_child(payload);

        assert!(PAYLOAD_RAN.load(Ordering::SeqCst));
        assert!(!is_pid_valid(child));
        assert!(TASK_TABLE.lock().validate_ready_queue());
        assert_ne!(TASK_TABLE.lock().current_pid(), Some(child));

        dispatch_onto(kernel);
    }

    #[test]
    fn uid_setters_update_credentials() {
        let _g = testutil::global_lock();
        let kernel = ensure_tasking();
        dispatch_onto(kernel);
        let child = fork().unwrap();

        set_task_uid(child, 1000).unwrap();
        set_task_gid(child, 100).unwrap();
        set_task_euid(child, 1001).unwrap();
        set_task_egid(child, 101).unwrap();

        let table = TASK_TABLE.lock();
        let ids = table.task(child).unwrap().ids;
        assert_eq!((ids.uid, ids.gid, ids.euid, ids.egid), (1000, 100, 1001, 101));
        drop(table);
        kill_task(child).unwrap();
    }
}
