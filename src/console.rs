//! Kernel console: formatted output to the serial port or the hosted transcript
use core::fmt::{self, Write};

struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::console_write(s);
        Ok(())
    }
}

pub fn print(args: fmt::Arguments) {
    // the console never reports an error
    let _ = Stdout.write_fmt(args);
}

/// Prints to the kernel console.
///
/// Equivalent to the [`println!`] macro except that a newline is not printed at
/// the end of the message.
///
/// [`println!`]: crate::println
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    };
}

/// Prints to the kernel console, with a newline.
///
/// # Examples
///
/// ```ignore
/// println!("hello there!");
/// println!("format {} arguments", "some");
/// ```
#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
