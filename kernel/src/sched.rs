//! Tick-driven scheduler
//!
//! The PIT fires IRQ 0; each tick advances the clock and rotates the ready
//! ring by one. Context save and restore ride on the register frame the
//! IRQ stub pushes, so the scheduler itself only decides who is `current`
//! and delivers whatever signals the incoming task had pending.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::interrupts::{self, InterruptFrame, TIMER_VECTOR};
use crate::task::TASK_TABLE;

/// Legacy PIT cadence used for the coarse seconds counter.
pub const TICKS_PER_SECOND: u64 = 18;

static TICKS: AtomicU64 = AtomicU64::new(0);
static SECONDS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Whole seconds since boot.
pub fn uptime_seconds() -> u64 {
    SECONDS.load(Ordering::Relaxed)
}

/// One timer tick: advance the clock, rotate the ready ring, deliver the
/// incoming task's pending signals. Handlers run outside the table lock.
pub fn timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if now % TICKS_PER_SECOND == 0 {
        SECONDS.fetch_add(1, Ordering::Relaxed);
    }

    let pending = TASK_TABLE.lock().rotate(now);
    for slot in pending.into_iter().flatten() {
        (slot.handler)(slot.signum);
    }
}

fn timer_handler(_frame: &mut InterruptFrame) {
    timer_tick();
}

/// Hook the scheduler onto IRQ 0.
pub fn init() {
    interrupts::register_interrupt_handler(TIMER_VECTOR, timer_handler);
    log::info!("sched: timer tick installed on vector {}", TIMER_VECTOR);
}

/// Busy-wait for `n` ticks. On hosted builds there is no timer interrupt,
/// so the wait drives the clock itself.
pub fn sleep_ticks(n: u64) {
    let deadline = ticks() + n;
    while ticks() < deadline {
        #[cfg(not(target_os = "none"))]
        TICKS.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

/// Busy-wait for `seconds` whole seconds.
pub fn ksleep(seconds: u64) {
    let deadline = uptime_seconds() + seconds;
    while uptime_seconds() < deadline {
        #[cfg(not(target_os = "none"))]
        SECONDS.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn sleep_advances_the_clock() {
        let before = ticks();
        sleep_ticks(5);
        assert!(ticks() >= before + 5);
    }

    #[test]
    fn ksleep_advances_seconds() {
        let before = uptime_seconds();
        ksleep(2);
        assert!(uptime_seconds() >= before + 2);
    }
}
