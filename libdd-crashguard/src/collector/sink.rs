// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The append-only text stream reports are written to.
//!
//! On Unix every write is a raw `write(2)` on a file descriptor: no buffering, no locks, so a
//! report can be written from a signal handler or while the std stderr lock is held.

use crate::shared::configuration::SinkConfig;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};

#[derive(Debug)]
pub enum DiagnosticSink {
    Stderr,
    Stdout,
    File(File),
}

impl DiagnosticSink {
    pub fn open(config: &SinkConfig) -> anyhow::Result<Self> {
        Ok(match config {
            SinkConfig::Stderr => Self::Stderr,
            SinkConfig::Stdout => Self::Stdout,
            SinkConfig::File { path } => Self::File(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Unable to open report sink {path}"))?,
            ),
        })
    }

    pub fn writer(&self) -> SinkWriter<'_> {
        SinkWriter { sink: self }
    }

    /// One unchecked write of `bytes`. Used for the fallback line when a report fails.
    pub fn write_raw(&self, bytes: &[u8]) {
        let _ = self.writer().write_all(bytes);
    }
}

pub struct SinkWriter<'a> {
    sink: &'a DiagnosticSink,
}

#[cfg(unix)]
impl SinkWriter<'_> {
    fn fd(&self) -> libc::c_int {
        use std::os::fd::AsRawFd;
        match self.sink {
            DiagnosticSink::Stderr => libc::STDERR_FILENO,
            DiagnosticSink::Stdout => libc::STDOUT_FILENO,
            DiagnosticSink::File(file) => file.as_raw_fd(),
        }
    }
}

#[cfg(unix)]
impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes; write is async-signal-safe.
            let rval = unsafe { libc::write(self.fd(), buf.as_ptr().cast(), buf.len()) };
            if rval >= 0 {
                return Ok(rval as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(unix))]
impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink {
            DiagnosticSink::Stderr => io::stderr().write(buf),
            DiagnosticSink::Stdout => io::stdout().write(buf),
            DiagnosticSink::File(file) => {
                let mut file = file;
                file.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink {
            DiagnosticSink::Stderr => io::stderr().flush(),
            DiagnosticSink::Stdout => io::stdout().flush(),
            DiagnosticSink::File(file) => {
                let mut file = file;
                file.flush()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.log");
        std::fs::write(&path, "existing\n")?;

        let sink = DiagnosticSink::open(&SinkConfig::File {
            path: path.display().to_string(),
        })?;
        writeln!(sink.writer(), "first line")?;
        sink.write_raw(b"second line\n");

        assert_eq!(
            std::fs::read_to_string(&path)?,
            "existing\nfirst line\nsecond line\n"
        );
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let result = DiagnosticSink::open(&SinkConfig::File {
            path: "/nonexistent-crashguard-dir/report.log".to_string(),
        });
        assert!(result.is_err());
    }
}
