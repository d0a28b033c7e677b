//! 16550 serial driver (COM1)
//!
//! Boot-time and panic output, and the `print!`/`println!` macros that feed
//! it. The port is polled; there is no interrupt plumbing here. Hosted
//! builds keep the macros (arguments stay type-checked) but the bytes go
//! nowhere.

/// Formatted write to the serial console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Serial write with a trailing newline. The format string must be a
/// literal so the newline can be glued on at compile time.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($fmt:expr) => ($crate::print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print!(concat!($fmt, "\n"), $($arg)*));
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod uart {
    use core::fmt;

    use spin::Mutex;

    use crate::arch::port::{inb, outb};

    const COM1: u16 = 0x3F8;

    pub struct SerialPort {
        base: u16,
        initialized: bool,
    }

    impl SerialPort {
        pub const fn new(base: u16) -> Self {
            Self {
                base,
                initialized: false,
            }
        }

        fn init(&mut self) {
            // SAFETY: standard 16550 setup sequence on the COM1 block.
            unsafe {
                outb(self.base + 1, 0x00); // disable interrupts
                outb(self.base + 3, 0x80); // enable DLAB
                outb(self.base, 0x03); // divisor 3 -> 38400 baud
                outb(self.base + 1, 0x00);
                outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
                outb(self.base + 2, 0xC7); // FIFO, cleared, 14-byte threshold
                outb(self.base + 4, 0x0B); // IRQs enabled, RTS/DSR set
            }
            self.initialized = true;
        }

        fn send(&mut self, byte: u8) {
            if !self.initialized {
                self.init();
            }
            // SAFETY: LSR poll then THR write, per the 16550 protocol.
            unsafe {
                while inb(self.base + 5) & 0x20 == 0 {}
                outb(self.base, byte);
            }
        }
    }

    impl fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.send(b'\r');
                }
                self.send(byte);
            }
            Ok(())
        }
    }

    static COM1_PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

    pub fn with_port<R>(f: impl FnOnce(&mut SerialPort) -> R) -> R {
        f(&mut COM1_PORT.lock())
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    uart::with_port(|port| {
        let _ = port.write_fmt(args);
    });
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[doc(hidden)]
pub fn _print(_args: core::fmt::Arguments) {}
