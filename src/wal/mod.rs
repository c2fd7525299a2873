//! # Transaction Log
//!
//! Consumer side of the redo buffers. Transactions hand their closed redo
//! segments to a [`LogManager`]; the manager serializes every record into a
//! checksummed frame and returns the segments to the pool.
//!
//! ## Flow
//!
//! ```text
//! RedoBuffer ──segment_closed──> LogManager queue
//!                                     │
//!                                     ▼
//!                       flush_to(writer) / process(f)
//!                                     │
//!                          frames ────┴──── segments back to the pool
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! +------------+----------------+----------------------+
//! | len: u32   | checksum: u64  | record bytes         |
//! +------------+----------------+----------------------+
//! ```
//!
//! `checksum` is CRC-64/ECMA-182 over `len` and the record bytes. The record
//! bytes are the redo buffer entry verbatim, so [`LogRecord::decode`] reads
//! them back without a separate serialization step.
//!
//! ## Read Protocol
//!
//! [`LogReader`] reads frames in order and validates each checksum. A clean
//! end of input stops the reader; a truncated or corrupted frame is an error.
//!
//! [`LogRecord::decode`]: crate::mvcc::LogRecord::decode

mod frame;
mod manager;
mod reader;

pub use frame::{compute_checksum, encode_frame, FrameHeader};
pub use manager::{LogFile, LogManager};
pub use reader::LogReader;
