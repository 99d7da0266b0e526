//! Comma-separated trace of every benchmarked configuration.

use anyhow::Result;
use std::io::Write;

/// One row per benchmark: the time in seconds, then the parameter columns.
pub struct TraceLog<W: Write> {
    writer: W,
    header_written: bool,
}

impl<W: Write> TraceLog<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    /// Writes `time,<columns>` unless a header was already written.
    pub fn header(&mut self, columns: &str) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        writeln!(self.writer, "time,{columns}")?;
        self.writer.flush()?;
        self.header_written = true;
        Ok(())
    }

    pub fn record(&mut self, time: f64, row: &str) -> Result<()> {
        writeln!(self.writer, "{time:.3e},{row}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
