//! Frame streamer: a writer plug-in that forwards aggregated stacks to an
//! out-of-process collector over a named FIFO.
//!
//! Wire format: a 4-byte little-endian length header, then the `;`-joined
//! frame list, newline-terminated. The FIFO is opened non-blocking on both
//! ends so a dead collector never wedges the profiler; short writes are
//! retried a bounded number of times and then dropped.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use parking_lot::Mutex;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::profiler::Profiler;

const WRITE_TRIES: usize = 3;
const HEADER_SIZE: usize = 4;

struct Streamer {
    fifo: std::fs::File,
    // Opened for reading only so a collector that exits does not turn our
    // writes into SIGPIPE storms.
    _read_end: std::fs::File,
    buffer: Vec<u8>,
}

static STREAMER: Mutex<Option<Streamer>> = Mutex::new(None);

/// Attaches the streamer to `fifo_path`. The FIFO must already exist and
/// have a reader.
pub fn attach(fifo_path: &str, max_stack_depth: usize) -> Result<()> {
    let fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo_path)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ENXIO) {
                ProfilerError::failed("fifo is not ready for reading")
            } else {
                ProfilerError::failed(format!("failed to open fifo for writing: {e}"))
            }
        })?;
    let read_end = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo_path)
        .map_err(|e| ProfilerError::failed(format!("failed to open fifo for reading: {e}")))?;

    // Grow the pipe so one message never needs a partial write.
    let estimated = (max_stack_depth * 100).next_multiple_of(65536);
    unsafe {
        libc::fcntl(fifo.as_raw_fd(), libc::F_SETPIPE_SZ, estimated as libc::c_int);
    }

    *STREAMER.lock() = Some(Streamer {
        fifo,
        _read_end: read_end,
        buffer: Vec::with_capacity(estimated),
    });
    Ok(())
}

pub fn detach() {
    *STREAMER.lock() = None;
}

pub fn attached() -> bool {
    STREAMER.lock().is_some()
}

fn stream_one(streamer: &mut Streamer, names: &[String]) -> bool {
    streamer.buffer.clear();
    streamer.buffer.extend_from_slice(&[0; HEADER_SIZE]);
    let mut first = true;
    for name in names {
        if !first {
            streamer.buffer.push(b';');
        }
        streamer.buffer.extend_from_slice(name.as_bytes());
        first = false;
    }
    streamer.buffer.push(b'\n');

    let body_size = streamer.buffer.len() - HEADER_SIZE;
    LittleEndian::write_u32(&mut streamer.buffer[..HEADER_SIZE], body_size as u32);

    for _ in 0..WRITE_TRIES {
        match streamer.fifo.write(&streamer.buffer) {
            Ok(written) if written == streamer.buffer.len() => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return false,
        }
    }
    false
}

/// Streams every aggregated stack once. Called from the dump path; a
/// detached streamer makes this a no-op.
pub fn flush(profiler: &Profiler, _args: &Arguments) {
    let mut guard = STREAMER.lock();
    let Some(streamer) = guard.as_mut() else {
        return;
    };
    let mut dropped = 0usize;
    profiler.storage().collect_traces(|_trace_id, frames| {
        let names: Vec<String> = frames.iter().rev().map(|f| profiler.render_frame(f)).collect();
        if !stream_one(streamer, &names) {
            dropped += 1;
        }
    });
    if dropped > 0 {
        warn!("frame streamer dropped {dropped} stacks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Read;

    fn make_fifo(path: &std::path::Path) {
        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) }, 0);
    }

    #[test]
    fn framed_messages_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.fifo");
        make_fifo(&path);

        // A reader must exist before the writer can open the FIFO.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();

        attach(path.to_str().unwrap(), 128).unwrap();
        {
            let mut guard = STREAMER.lock();
            let streamer = guard.as_mut().unwrap();
            assert!(stream_one(
                streamer,
                &["main".to_owned(), "run".to_owned(), "work".to_owned()],
            ));
        }
        detach();

        let len = reader.read_u32::<LittleEndian>().unwrap() as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
        assert_eq!(body, b"main;run;work\n");
    }

    #[test]
    fn attach_fails_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lonely.fifo");
        make_fifo(&path);
        assert!(attach(path.to_str().unwrap(), 128).is_err());
    }
}
