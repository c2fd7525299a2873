//! Sequential reader for log frames.

use super::frame::FrameHeader;
use crate::config::{LOG_FRAME_HEADER_SIZE, MAX_ENTRY_SIZE};
use crate::mvcc::LogRecord;
use eyre::{bail, ensure, Result, WrapErr};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Reads frames back in write order, validating each checksum.
///
/// A clean end of input ends iteration. A frame cut short or failing its
/// checksum is an error: the reader does not skip past it.
pub struct LogReader<R> {
    inner: R,
    offset: u64,
    payload: Vec<u8>,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("failed to open log file at {:?}", path))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            payload: Vec::new(),
        }
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Payload of the next frame, or `None` at end of input.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>> {
        let mut header_bytes = [0u8; LOG_FRAME_HEADER_SIZE];
        if !self.read_header(&mut header_bytes)? {
            return Ok(None);
        }
        let header = FrameHeader::from_bytes(&header_bytes)?;
        let len = header.len() as usize;
        ensure!(
            len <= MAX_ENTRY_SIZE,
            "log frame at offset {} claims {} bytes",
            self.offset,
            len
        );

        self.payload.resize(len, 0);
        self.inner
            .read_exact(&mut self.payload)
            .wrap_err_with(|| format!("log frame at offset {} is truncated", self.offset))?;
        if !header.validate(&self.payload) {
            bail!("log frame at offset {} failed checksum validation", self.offset);
        }

        self.offset += (LOG_FRAME_HEADER_SIZE + len) as u64;
        Ok(Some(&self.payload))
    }

    /// Next decoded record, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<LogRecord<'_>>> {
        let offset = self.offset;
        match self.next_frame()? {
            Some(payload) => LogRecord::decode(payload)
                .wrap_err_with(|| format!("undecodable log record at offset {}", offset))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Feed every remaining record to `f`. Returns how many were read.
    pub fn for_each_record<F>(&mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(LogRecord<'_>) -> Result<()>,
    {
        let mut count = 0;
        while let Some(record) = self.next_record()? {
            f(record)?;
            count += 1;
        }
        Ok(count)
    }

    fn read_header(&mut self, buf: &mut [u8; LOG_FRAME_HEADER_SIZE]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => bail!(
                    "log frame header at offset {} is truncated ({} of {} bytes)",
                    self.offset,
                    filled,
                    LOG_FRAME_HEADER_SIZE
                ),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e).wrap_err("failed to read log frame header"),
            }
        }
        Ok(true)
    }
}
