//! Log manager: consumer of closed redo segments.

use super::frame::encode_frame;
use crate::memory::{Segment, SegmentSink};
use crate::mvcc::LogRecord;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Queues redo segments handed off by transactions until they are flushed.
///
/// Segments are processed in hand-off order. Records of one transaction
/// keep their staging order; records of different transactions interleave
/// and are told apart by their `txn_begin`.
#[derive(Default)]
pub struct LogManager {
    queue: Mutex<VecDeque<Segment>>,
    flush_lock: Mutex<()>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_segments(&self) -> usize {
        self.queue.lock().len()
    }

    /// Hand every queued record to `f`, releasing each segment once all its
    /// records were accepted. Returns the number of records processed.
    ///
    /// On error the failing segment stays queued; records of it that `f`
    /// already accepted are offered again on the next call.
    pub fn process<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(LogRecord<'_>) -> Result<()>,
    {
        self.drain(|segment| {
            let mut count = 0;
            for entry in segment.entries() {
                f(LogRecord::decode(entry.bytes())?)?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Serialize every queued record as a frame into `out` and release the
    /// segments. Returns the number of frames written.
    pub fn flush_to<W: Write>(&self, out: &mut W) -> Result<usize> {
        let mut buf = Vec::new();
        self.drain(|segment| {
            buf.clear();
            let mut count = 0;
            for entry in segment.entries() {
                encode_frame(entry.bytes(), &mut buf)?;
                count += 1;
            }
            out.write_all(&buf).wrap_err("failed to write log frames")?;
            Ok(count)
        })
    }

    fn drain<F>(&self, mut per_segment: F) -> Result<usize>
    where
        F: FnMut(&Segment) -> Result<usize>,
    {
        let _flushing = self.flush_lock.lock();
        let mut total = 0;
        let mut segments = 0;
        loop {
            let Some(segment) = self.queue.lock().pop_front() else {
                break;
            };
            match per_segment(&segment) {
                Ok(count) => {
                    total += count;
                    segments += 1;
                }
                Err(err) => {
                    self.queue.lock().push_front(segment);
                    return Err(err);
                }
            }
        }
        if segments > 0 {
            debug!(segments, records = total, "log segments flushed");
        }
        Ok(total)
    }
}

impl SegmentSink for LogManager {
    fn segment_closed(&self, segment: Segment) {
        trace!(
            index = segment.index(),
            entries = segment.entry_count(),
            "log segment queued"
        );
        self.queue.lock().push_back(segment);
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("pending_segments", &self.pending_segments())
            .finish()
    }
}

/// Append-only log file.
pub struct LogFile {
    path: PathBuf,
    file: File,
    offset: u64,
}

impl LogFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create log file at {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset: 0,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open log file at {:?}", path))?;
        let offset = file
            .metadata()
            .wrap_err("failed to read log file metadata")?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Flush `manager`'s queued records and sync them to disk.
    ///
    /// The offset covers every byte that reached the file, including those
    /// of a flush that failed partway.
    pub fn append_from(&mut self, manager: &LogManager) -> Result<usize> {
        let frames = append_counted(&mut self.file, &mut self.offset, manager)?;
        self.file
            .sync_all()
            .wrap_err("failed to sync log file to disk")?;
        Ok(frames)
    }
}

fn append_counted<W: Write>(out: &mut W, offset: &mut u64, manager: &LogManager) -> Result<usize> {
    let mut writer = CountingWriter {
        inner: out,
        written: 0,
    };
    let result = manager.flush_to(&mut writer);
    *offset += writer.written;
    result
}

struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
