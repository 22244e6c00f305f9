//! Console output for the VM subsystem
//!
//! Provides basic text output for kernel diagnostics: statistics reports,
//! coremap/swap dumps and the fatal-error banner.
//! On hardware the sink would be the serial line; hosted builds print to
//! stderr, and unit tests capture output in a fixed-size buffer.

use core::fmt::{self, Write};
use spin::{Mutex, Once};

/// Where finished console text goes
pub type ConsoleSink = fn(&str);

static SINK: Once<ConsoleSink> = Once::new();

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        #[cfg(test)]
        {
            // Keep the most recent output when the buffer fills up
            if self.buffer.push_str(s).is_err() {
                self.buffer.clear();
                let _ = self.buffer.push_str(s);
            }
        }

        #[cfg(not(test))]
        {
            (sink())(s);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Install the output sink; only the first call takes effect
pub fn set_sink(sink: ConsoleSink) {
    SINK.call_once(|| sink);
}

fn sink() -> ConsoleSink {
    *SINK.call_once(|| default_sink as ConsoleSink)
}

#[cfg(feature = "std")]
fn default_sink(s: &str) {
    use std::io::Write as _;
    let _ = std::io::stderr().write_all(s.as_bytes());
}

#[cfg(not(feature = "std"))]
fn default_sink(_s: &str) {}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console writes cannot fail; a formatting error only truncates output
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Per-fault debug trace, compiled in with the `vm-trace` feature
#[macro_export]
macro_rules! vm_trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "vm-trace") {
            $crate::kprintln!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_write() {
        let mut console = Console::new();
        console.write_str("vm: fault at 0x400000");
        assert!(console.buffer.contains("fault at 0x400000"));
    }

    #[test]
    fn test_console_formatting() {
        let mut console = Console::new();
        write!(&mut console, "frames {}", 42).unwrap();
        assert!(console.buffer.contains("frames 42"));
    }

    #[test]
    fn test_console_overflow_keeps_latest() {
        let mut console = Console::new();
        for _ in 0..200 {
            console.write_str("0123456789");
        }
        console.write_str("tail");
        assert!(console.buffer.ends_with("tail"));
    }
}
