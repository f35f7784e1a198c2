//! Log sink setup.
//!
//! All workers log through the `log` facade; the records are formatted by
//! `env_logger` into an in-process channel whose consumer thread tees every
//! record to stderr and, when a run directory is known, to the per-run
//! `<prefix>.log` file. Workers therefore never block on log file I/O: the
//! only cost on the hot path is a channel send.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use crate::error::AppResult;

/// `io::Write` adapter that forwards formatted records to the sink thread.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // If the sink thread is gone the record is dropped, not an error.
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn spawn_sink(rx: mpsc::Receiver<Vec<u8>>, mut file: Option<File>) -> io::Result<()> {
    thread::Builder::new().name("log-sink".into()).spawn(move || {
        for record in rx {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(&record);
            if let Some(f) = file.as_mut() {
                let _ = f.write_all(&record);
                let _ = f.flush();
            }
        }
    })?;
    Ok(())
}

/// Install the global logger.
///
/// `log_file` is the merged per-run log (`<prefix>.log`); `None` logs to
/// stderr only. The filter is taken from `RUST_LOG`, defaulting to `info`.
/// Calling this twice is harmless (the second install is ignored), which
/// keeps tests that share a process from panicking.
pub fn init(log_file: Option<&Path>) -> AppResult<()> {
    let file = match log_file {
        Some(path) => Some(File::create(path)?),
        None => None,
    };
    let (tx, rx) = mpsc::channel();
    spawn_sink(rx, file)?;

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(ChannelWriter { tx })))
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_writer_forwards_bytes() {
        let (tx, rx) = mpsc::channel();
        let mut writer = ChannelWriter { tx };
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(rx.recv().unwrap(), b"hello\n");
    }

    #[test]
    fn test_channel_writer_survives_closed_sink() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut writer = ChannelWriter { tx };
        // A dead sink must not error out the logging macros.
        assert!(writer.write_all(b"dropped").is_ok());
    }
}
