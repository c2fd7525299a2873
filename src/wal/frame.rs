//! Log frame codec.
//!
//! ```text
//! +-------------------+------------------+------------------------+
//! | len: u32 (LE)     | checksum: u64    | record bytes (len)     |
//! +-------------------+------------------+------------------------+
//! ```
//!
//! The checksum is CRC-64/ECMA-182 over the little-endian length followed
//! by the record bytes.

use crate::config::{LOG_FRAME_HEADER_SIZE, MAX_ENTRY_SIZE};
use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use std::mem::size_of;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameHeader {
    len: U32,
    checksum: U64,
}

const _: () = assert!(size_of::<FrameHeader>() == LOG_FRAME_HEADER_SIZE);

impl FrameHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        let len = payload.len() as u32;
        Self {
            len: U32::new(len),
            checksum: U64::new(compute_checksum(len, payload)),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("invalid log frame header: {:?}", e))
    }

    zerocopy_getters! {
        len: u32,
        checksum: u64,
    }

    pub fn validate(&self, payload: &[u8]) -> bool {
        payload.len() == self.len() as usize
            && compute_checksum(self.len(), payload) == self.checksum()
    }
}

pub fn compute_checksum(len: u32, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&len.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// Append one frame holding `payload` to `out`.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    ensure!(
        payload.len() <= MAX_ENTRY_SIZE,
        "log record of {} bytes exceeds the frame limit of {}",
        payload.len(),
        MAX_ENTRY_SIZE
    );
    out.extend_from_slice(FrameHeader::for_payload(payload).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}
