// kernel/src/serial.rs
//
// Diagnostic console for the memory core.
//
//   1. `Serial`: behind a Mutex, used by serial_print!/serial_println!.
//      Whole lines from different CPUs never interleave.
//
//   2. `RawSerialWriter`: NO lock, NO allocation.  Used by
//      serial_print_raw!/serial_println_raw! from paths that may already
//      hold a frame-pool lock.
//
// Where the bytes go depends on the build:
//   - bare metal (x86_64, target_os = "none"): COM1 at 0x3F8
//   - hosted unit-test builds: stderr (visible with `--nocapture`)
//   - any other hosted build: dropped

use core::fmt;
use spin::Mutex;

/// I/O port of the first serial controller.
#[cfg_attr(not(all(target_arch = "x86_64", target_os = "none")), allow(dead_code))]
const COM1: u16 = 0x3F8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn emit(s: &str) {
    use x86_64::instructions::port::Port;

    let mut port = Port::<u8>::new(COM1);
    for byte in s.bytes() {
        unsafe {
            port.write(byte);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
fn emit(s: &str) {
    std::eprint!("{}", s);
}

#[cfg(not(any(
    all(target_arch = "x86_64", target_os = "none"),
    all(test, not(target_os = "none"))
)))]
fn emit(_s: &str) {}

// ============================================================================
// Locked writer (general use)
// ============================================================================

static SERIAL: Mutex<Serial> = Mutex::new(Serial);

struct Serial;

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        emit(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// ============================================================================
// Lock-free writer
// ============================================================================

/// Lock-free, allocation-free serial writer.
///
/// `format_args!` builds its state on the stack, so this is safe to use
/// while a frame-pool or address-space lock is held.  Output may
/// interleave with other CPUs at the byte level.
pub struct RawSerialWriter;

impl fmt::Write for RawSerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        emit(s);
        Ok(())
    }
}

/// Lock-free print with full formatting support.
#[macro_export]
macro_rules! serial_print_raw {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::serial::RawSerialWriter, $($arg)*);
    }};
}

/// Lock-free println with full formatting support.
#[macro_export]
macro_rules! serial_println_raw {
    () => ($crate::serial_print_raw!("\n"));
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::serial::RawSerialWriter, $($arg)*);
    }};
}
