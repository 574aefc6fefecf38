//! Frame chains: which logical frames are active at each offset of a region.
//!
//! A chain is a flat `[u32]` of 4-word records
//!
//! ```text
//! (frame_id, start_offset, stop_offset, next_index)
//! ```
//!
//! Offsets are relative to the region start and `[start, stop)` is the range
//! of machine code during which `frame_id` is active. Records are sorted by
//! start offset, and a record for a frame is directly followed by the records
//! of frames inlined into it. `next_index` is the word index just past all of
//! those nested records, or the chain length, so a walk can skip a whole
//! subtree in one step once it knows the target offset is outside the
//! enclosing record.
//!
//! [`ChainBuilder`] produces chains in this layout as code is emitted, and
//! [`next_frame`] is the decoder the profiler drives.

use crate::error::{MalformedChain, OutOfMemory};

/// Number of words per record.
pub const RECORD_WORDS: usize = 4;

/// An encoded frame chain owned by a code region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameChain {
    words: Box<[u32]>,
}

impl FrameChain {
    /// Copies `words` into a new chain.
    ///
    /// The layout is not checked; see [`FrameChain::check`].
    pub fn try_from_slice(words: &[u32]) -> Result<FrameChain, OutOfMemory> {
        let mut v = Vec::new();
        v.try_reserve_exact(words.len())?;
        v.extend_from_slice(words);
        Ok(FrameChain {
            words: v.into_boxed_slice(),
        })
    }

    /// The encoded words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Number of encoded words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the chain has no records.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub(crate) fn into_boxed_slice(self) -> Box<[u32]> {
        self.words
    }

    /// Checks the chain against the record layout for a region of
    /// `region_size` bytes.
    ///
    /// Lookups never call this; it is meant for chains coming from untrusted
    /// input.
    pub fn check(&self, region_size: u32) -> Result<(), MalformedChain> {
        let len = self.words.len();
        if len % RECORD_WORDS != 0 {
            return Err(MalformedChain::Length { len });
        }
        let mut previous = 0;
        for (i, record) in self.words.chunks_exact(RECORD_WORDS).enumerate() {
            let index = i * RECORD_WORDS;
            let (start, stop, next) = (record[1], record[2], record[3]);
            if start > stop || stop > region_size {
                return Err(MalformedChain::Interval {
                    index,
                    start,
                    stop,
                    region_size,
                });
            }
            let next_usize = next as usize;
            if next_usize < index + RECORD_WORDS || next_usize > len || next_usize % RECORD_WORDS != 0
            {
                return Err(MalformedChain::Skip { index, next, len });
            }
            if start < previous {
                return Err(MalformedChain::Order {
                    index,
                    start,
                    previous,
                });
            }
            previous = start;
        }
        Ok(())
    }
}

impl From<Box<[u32]>> for FrameChain {
    fn from(words: Box<[u32]>) -> FrameChain {
        FrameChain { words }
    }
}

/// Returns the next frame active at `rel` in `chain`, starting at `cursor`.
///
/// On a hit the returned cursor points just past the matching record, so
/// calling again with it yields the next frame inlined at `rel`. Frames come
/// out enclosing-first. On a miss the cursor is returned unchanged.
///
/// `chain` must be well formed (every `next_index` moves forward to a record
/// boundary or the end); that is what bounds the walk. This runs inside
/// profiling signal handlers: no allocation, no panics on well-formed input.
pub fn next_frame(chain: &[u32], rel: usize, cursor: usize) -> (Option<u32>, usize) {
    let mut pos = cursor;
    loop {
        let Some(record) = pos
            .checked_add(RECORD_WORDS)
            .and_then(|end| chain.get(pos..end))
        else {
            return (None, cursor);
        };
        if record[1] as usize > rel {
            // Records are sorted by start, nothing later can contain `rel`.
            return (None, cursor);
        }
        if record[2] as usize > rel {
            return (Some(record[0]), pos + RECORD_WORDS);
        }
        debug_assert!(record[3] as usize >= pos + RECORD_WORDS);
        pos = record[3] as usize;
    }
}

/// Iterator over the frames active at one offset of a chain.
///
/// Created by [`RegionHandle::frames`](crate::RegionHandle::frames).
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    chain: &'a [u32],
    rel: usize,
    cursor: usize,
}

impl<'a> Frames<'a> {
    pub(crate) fn new(chain: &'a [u32], rel: usize) -> Frames<'a> {
        Frames {
            chain,
            rel,
            cursor: 0,
        }
    }

    /// The cursor the next call to `next` resumes from.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Iterator for Frames<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let (frame, cursor) = next_frame(self.chain, self.rel, self.cursor);
        self.cursor = cursor;
        frame
    }
}

/// Builds a [`FrameChain`] while machine code for a region is emitted.
///
/// Every `enter_frame` opens a record and every `leave_frame` closes the most
/// recently opened one, so frames must nest. Records still open when
/// [`ChainBuilder::finish`] is called extend to the end of the region.
#[derive(Debug, Default)]
pub struct ChainBuilder {
    words: Vec<u32>,
    open: Vec<usize>,
}

impl ChainBuilder {
    /// Creates an empty builder.
    pub fn new() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Opens a record for `frame_id` starting at `offset`.
    ///
    /// Offsets must not decrease from one call to the next.
    pub fn enter_frame(&mut self, frame_id: u32, offset: u32) -> Result<(), OutOfMemory> {
        self.words.try_reserve(RECORD_WORDS)?;
        self.open.try_reserve(1)?;
        self.open.push(self.words.len());
        // Stop offset and skip pointer are patched in when the frame closes.
        self.words.extend_from_slice(&[frame_id, offset, 0, 0]);
        Ok(())
    }

    /// Closes the innermost open record at `offset` and returns its frame id.
    ///
    /// Returns `None`, changing nothing, if no record is open.
    pub fn leave_frame(&mut self, offset: u32) -> Option<u32> {
        let at = self.open.pop()?;
        self.close(at, offset);
        Some(self.words[at])
    }

    fn close(&mut self, at: usize, stop: u32) {
        self.words[at + 2] = stop;
        self.words[at + 3] = self.words.len() as u32;
    }

    /// Opens one record per id in `frame_ids`, each starting at offset 0.
    ///
    /// Used when a region continues execution inside frames that were
    /// already active where it was attached, such as a bridge leaving a
    /// trace; pass the ids enclosing-first, as
    /// [`CodeRegistry::unpack_traceback`](crate::CodeRegistry::unpack_traceback)
    /// returns them.
    pub fn inherit_frames(&mut self, frame_ids: &[u32]) -> Result<(), OutOfMemory> {
        for &id in frame_ids {
            self.enter_frame(id, 0)?;
        }
        Ok(())
    }

    /// Number of records currently open.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Closes every open record at `region_size` and returns the chain.
    pub fn finish(mut self, region_size: u32) -> Result<FrameChain, OutOfMemory> {
        while let Some(at) = self.open.pop() {
            self.close(at, region_size);
        }
        FrameChain::try_from_slice(&self.words)
    }
}
