//! Implementation of the `jitmap decode` CLI command.

use anyhow::{Context, Result};
use clap::Parser;
use jitmap_codemap::{FrameChain, RECORD_WORDS, next_frame};
use std::io::Write;

/// Decodes the frames active at an offset of a raw frame chain.
#[derive(Parser)]
pub struct DecodeCommand {
    /// The chain's words, as `frame_id,start,stop,next_index` records.
    #[arg(long, value_name = "W,W,...", value_delimiter = ',', required = true)]
    chain: Vec<u32>,

    /// Offset into the region, in bytes.
    #[arg(long, value_name = "N")]
    offset: u32,

    /// Size of the region the chain describes; defaults to the largest stop
    /// offset in the chain.
    #[arg(long, value_name = "BYTES")]
    region_size: Option<u32>,

    /// Print every decoding step along with the cursor it returned.
    #[arg(long)]
    steps: bool,

    /// Print the frames as a JSON array.
    #[arg(long)]
    json: bool,
}

impl DecodeCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let chain = FrameChain::try_from_slice(&self.chain)?;
        let region_size = self.region_size.unwrap_or_else(|| {
            chain
                .words()
                .chunks(RECORD_WORDS)
                .filter_map(|record| record.get(2).copied())
                .max()
                .unwrap_or(0)
        });
        chain.check(region_size).context("malformed chain")?;

        let mut stdout = std::io::stdout().lock();
        let mut frames = Vec::new();
        let mut cursor = 0;
        loop {
            let (frame, next) = next_frame(chain.words(), self.offset as usize, cursor);
            if self.steps {
                writeln!(stdout, "cursor {cursor} -> {frame:?}, {next}")?;
            }
            let Some(frame) = frame else { break };
            frames.push(frame);
            cursor = next;
        }

        if self.json {
            serde_json::to_writer(&mut stdout, &frames)?;
            writeln!(stdout)?;
        } else {
            for frame in &frames {
                writeln!(stdout, "{frame}")?;
            }
        }
        Ok(())
    }
}
