//! Error types returned by the index.
//!
//! Misses are never errors: lookups return `None`. The only failures a caller
//! has to handle on the hot paths are allocation failures while registering.

use thiserror::Error;

/// An allocation performed on behalf of the writer failed.
///
/// Callers registering code should treat this as "introspection unavailable
/// for this region" and carry on compiling.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("out of memory: failed to allocate {bytes} bytes for the address index")]
pub struct OutOfMemory {
    bytes: usize,
}

impl OutOfMemory {
    /// Creates a new error for a failed allocation of `bytes` bytes.
    pub fn new(bytes: usize) -> Self {
        OutOfMemory { bytes }
    }

    /// Returns the size of the allocation that failed.
    pub fn requested_bytes(&self) -> usize {
        self.bytes
    }
}

impl From<std::collections::TryReserveError> for OutOfMemory {
    fn from(_: std::collections::TryReserveError) -> Self {
        // The standard library does not expose the layout that failed.
        OutOfMemory::new(0)
    }
}

/// A frame chain that does not follow the 4-word record layout.
///
/// Only produced by [`FrameChain::check`](crate::FrameChain::check); the
/// lookup paths never validate chains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedChain {
    /// The chain length is not a multiple of the record width.
    #[error("chain length {len} is not a multiple of 4")]
    Length {
        /// Number of words in the chain.
        len: usize,
    },

    /// A record's interval is inverted or leaves the region.
    #[error("record at {index} covers [{start}, {stop}) outside of a region of size {region_size}")]
    Interval {
        /// Word index of the offending record.
        index: usize,
        /// The record's start offset.
        start: u32,
        /// The record's stop offset.
        stop: u32,
        /// Size of the region the chain describes.
        region_size: u32,
    },

    /// A record's skip pointer goes backwards or past the end of the chain.
    #[error("record at {index} skips to {next}, expected a record boundary in ({index}, {len}]")]
    Skip {
        /// Word index of the offending record.
        index: usize,
        /// The record's `next_index`.
        next: u32,
        /// Number of words in the chain.
        len: usize,
    },

    /// Records are not sorted by start offset.
    #[error("record at {index} starts at {start}, before the previous record's start {previous}")]
    Order {
        /// Word index of the offending record.
        index: usize,
        /// The record's start offset.
        start: u32,
        /// The previous record's start offset.
        previous: u32,
    },
}

/// The process-wide registry was already set up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the global code registry has already been initialized")]
pub struct AlreadyInitialized;
