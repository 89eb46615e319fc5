//! Public native API, C ABI.
//!
//! `asprof_init` must be called once before anything else (preloaded builds
//! do it from a library constructor, which also applies `ASPROF_COMMAND`).
//! `asprof_execute` runs one textual command, forwarding profiler output to
//! the caller's writer callback. Errors are returned as NUL-terminated
//! strings whose storage lives for the process lifetime.

use std::ffi::{c_char, CString};
use std::io::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::error;
use parking_lot::Mutex;

use crate::profiler::Profiler;

/// NULL means success; otherwise an error message pointer.
pub type AsprofError = *const c_char;

pub type AsprofWriter = Option<unsafe extern "C" fn(buf: *const c_char, size: libc::size_t)>;

/// Layout-stable view of the per-thread data exposed to observers. The
/// counter increments (not necessarily by 1) on every sampling signal.
#[repr(C)]
pub struct AsprofThreadLocalData {
    pub sample_counter: u64,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
// Error strings handed across the ABI must stay valid forever.
static ERROR_STRINGS: Mutex<Vec<CString>> = Mutex::new(Vec::new());

fn intern_error(message: String) -> AsprofError {
    let cstring = CString::new(message).unwrap_or_else(|_| CString::new("invalid error").unwrap());
    let mut strings = ERROR_STRINGS.lock();
    if let Some(existing) = strings.iter().find(|s| **s == cstring) {
        return existing.as_ptr();
    }
    strings.push(cstring);
    strings.last().unwrap().as_ptr()
}

struct CallbackWriter {
    callback: AsprofWriter,
}

impl Write for CallbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(callback) = self.callback {
            unsafe { callback(buf.as_ptr() as *const c_char, buf.len()) };
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Initializes the profiler library. Safe to call more than once.
#[no_mangle]
pub extern "C" fn asprof_init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    let profiler = Profiler::instance();
    profiler.init();
    profiler.thread_start();
}

/// Executes one profiler command; returns NULL on success or an error
/// message.
///
/// # Safety
/// `command` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn asprof_execute(
    command: *const c_char,
    output_callback: AsprofWriter,
) -> AsprofError {
    if !INITIALIZED.load(Ordering::Acquire) {
        return intern_error("asprof_init has not been called".to_owned());
    }
    if command.is_null() {
        return intern_error("command is null".to_owned());
    }
    let command = match std::ffi::CStr::from_ptr(command).to_str() {
        Ok(command) => command,
        Err(_) => return intern_error("command is not valid UTF-8".to_owned()),
    };

    let mut writer = CallbackWriter { callback: output_callback };
    match Profiler::instance().execute(command, &mut writer) {
        Ok(()) => ptr::null(),
        Err(err) => intern_error(err.to_string()),
    }
}

/// Returns the message for an error produced by [`asprof_execute`], or NULL.
#[no_mangle]
pub extern "C" fn asprof_error_str(err: AsprofError) -> *const c_char {
    err
}

/// Returns this thread's profiler-local data, lazily initializing it.
/// NULL on allocation failure. Not async-signal-safe.
#[no_mangle]
pub extern "C" fn asprof_unstable_get_thread_local_data() -> *mut AsprofThreadLocalData {
    let record = crate::thread::init_current_thread();
    if record.is_null() {
        return ptr::null_mut();
    }
    // sample_counter is the first field of the repr(C) thread record; the
    // public struct is a prefix view of it.
    record as *mut AsprofThreadLocalData
}

/// Applied when the library is preloaded: `ASPROF_COMMAND` holds a start
/// command to run as soon as the library is mapped.
fn apply_preload_command() {
    let Ok(command) = std::env::var("ASPROF_COMMAND") else {
        return;
    };
    asprof_init();
    let result = unsafe {
        let command = match CString::new(command) {
            Ok(command) => command,
            Err(_) => return,
        };
        asprof_execute(command.as_ptr(), None)
    };
    if !result.is_null() {
        let message = unsafe { std::ffi::CStr::from_ptr(result) }.to_string_lossy();
        error!("ASPROF_COMMAND failed: {message}");
    }
}

extern "C" fn preload_constructor() {
    apply_preload_command();
}

#[used]
#[link_section = ".init_array"]
static PRELOAD_CONSTRUCTOR: extern "C" fn() = preload_constructor;

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn execute_before_init_reports_error() {
        if !INITIALIZED.load(Ordering::Acquire) {
            let command = CString::new("status").unwrap();
            let err = unsafe { asprof_execute(command.as_ptr(), None) };
            assert!(!err.is_null());
        }
        asprof_init();
    }

    #[test]
    fn status_command_reaches_callback() {
        asprof_init();
        static RECEIVED: AtomicBool = AtomicBool::new(false);
        unsafe extern "C" fn capture(_buf: *const c_char, size: libc::size_t) {
            if size > 0 {
                RECEIVED.store(true, Ordering::Relaxed);
            }
        }
        let command = CString::new("status").unwrap();
        let err = unsafe { asprof_execute(command.as_ptr(), Some(capture)) };
        assert!(err.is_null(), "{:?}", unsafe {
            err.as_ref().map(|e| CStr::from_ptr(e))
        });
        assert!(RECEIVED.load(Ordering::Relaxed));
    }

    #[test]
    fn error_str_returns_message() {
        let err = intern_error("boom".to_owned());
        let text = unsafe { CStr::from_ptr(asprof_error_str(err)) };
        assert_eq!(text.to_str().unwrap(), "boom");
    }

    #[test]
    fn thread_local_data_is_stable() {
        asprof_init();
        let a = asprof_unstable_get_thread_local_data();
        let b = asprof_unstable_get_thread_local_data();
        assert!(!a.is_null());
        assert_eq!(a, b);
        let before = unsafe { (*a).sample_counter };
        let _ = before;
    }
}
