//! 16550 serial console.
//!
//! The first COM port doubles as the kernel log sink; the framebuffer text
//! subsystem is an external collaborator and only mirrors what goes through
//! here.

use core::fmt;

use spin::Mutex;

/// Standard COM1 I/O port base.
#[cfg(target_os = "none")]
const COM1_BASE: u16 = 0x3F8;

/// Serial console wrapper. Present so host-side builds (which have no port
/// I/O) can still link the print macros.
pub struct SerialConsole {
    #[cfg(target_os = "none")]
    inner: Option<uart_16550::SerialPort>,
}

impl SerialConsole {
    const fn new() -> Self {
        Self {
            #[cfg(target_os = "none")]
            inner: None,
        }
    }

    /// Initialize the UART. Called once during early boot, before any
    /// logging happens.
    #[cfg(target_os = "none")]
    fn init(&mut self) {
        // SAFETY: COM1_BASE is the architectural first-UART port block; no
        // other code in the kernel touches these ports.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1_BASE) };
        port.init();
        self.inner = Some(port);
    }
}

impl fmt::Write for SerialConsole {
    #[cfg(target_os = "none")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(ref mut port) = self.inner {
            port.write_str(s)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "none"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Host builds route through std's stderr so test failures show up.
        std::eprint!("{}", s);
        Ok(())
    }
}

/// Global serial console.
static CONSOLE: Mutex<SerialConsole> = Mutex::new(SerialConsole::new());

/// Bring up the UART.
pub fn init() {
    #[cfg(target_os = "none")]
    CONSOLE.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}
