//! Implementation of the `jitmap replay` CLI command.

use crate::commands::parse_address;
use crate::script::{Op, Script, TraceEvent};
use anyhow::{Context, Result, bail};
use clap::Parser;
use jitmap_codemap::{ChainBuilder, CodeRegistry, Config, FrameChain};
use serde_derive::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

/// Replays a script of JIT events and samples program counters.
#[derive(Parser)]
pub struct ReplayCommand {
    /// The script to replay.
    script: PathBuf,

    /// Additional program counter to sample, in hex (`0x...`) or decimal.
    #[arg(long = "pc", value_name = "ADDR", value_parser = parse_address)]
    pcs: Vec<usize>,

    /// Print the samples as JSON.
    #[arg(long)]
    json: bool,

    /// Override the maximum skip list height of the script's `[config]`.
    #[arg(long, value_name = "N")]
    max_height: Option<usize>,

    /// Override the pool chunk size of the script's `[config]`.
    #[arg(long, value_name = "NODES")]
    chunk_size: Option<usize>,

    /// Override the node height seed of the script's `[config]`.
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
}

/// What a profiler would have seen at one program counter.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct Sample {
    /// The sampled program counter.
    pub pc: usize,
    /// Start of the region containing `pc`, if any.
    pub region: Option<usize>,
    /// Frames active at `pc`, enclosing-first.
    pub frames: Vec<u32>,
    /// Stack depth at `pc`, if known.
    pub depth: Option<u32>,
}

impl ReplayCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let script = Script::from_file(&self.script)?;

        let mut config = Config::new();
        script.config.apply(&mut config);
        if let Some(height) = self.max_height {
            config.max_height(height);
        }
        if let Some(nodes) = self.chunk_size {
            config.chunk_size(nodes);
        }
        if let Some(seed) = self.seed {
            config.seed(seed);
        }

        let mut replay = Replay::new(&config);
        for (i, op) in script.ops.iter().enumerate() {
            replay
                .apply(op)
                .with_context(|| format!("failed to apply op {i} of `{}`", self.script.display()))?;
        }

        let samples: Vec<Sample> = script
            .queries
            .iter()
            .chain(&self.pcs)
            .map(|&pc| replay.sample(pc))
            .collect();

        let mut stdout = std::io::stdout().lock();
        if self.json {
            serde_json::to_writer_pretty(&mut stdout, &samples)?;
            writeln!(stdout)?;
        } else {
            for sample in &samples {
                writeln!(stdout, "{}", sample.display())?;
            }
        }
        Ok(())
    }
}

impl Sample {
    fn display(&self) -> String {
        let region = match self.region {
            Some(start) => format!("{start:#x}"),
            None => "-".to_string(),
        };
        let depth = match self.depth {
            Some(depth) => depth.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{:#x}: region={region} frames={:?} depth={depth}",
            self.pc, self.frames
        )
    }
}

/// A registry plus the keys the script has registered, so that script
/// mistakes are reported instead of tripping the registry's preconditions.
pub struct Replay {
    registry: CodeRegistry,
    code: BTreeSet<usize>,
    depth: BTreeSet<usize>,
}

impl Replay {
    /// Creates an empty replay.
    pub fn new(config: &Config) -> Replay {
        Replay {
            registry: CodeRegistry::new(config),
            code: BTreeSet::new(),
            depth: BTreeSet::new(),
        }
    }

    /// The registry the script is replayed against.
    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    /// Applies one op.
    pub fn apply(&mut self, op: &Op) -> Result<()> {
        log::debug!("replay: {op:?}");
        match op {
            Op::AddCode {
                address,
                size,
                chain,
            } => {
                let chain = FrameChain::try_from_slice(chain)?;
                chain
                    .check(*size)
                    .with_context(|| format!("malformed chain for region {address:#x}"))?;
                self.add_code(*address, *size, chain)?;
            }
            Op::AddTrace {
                address,
                size,
                inherit,
                events,
            } => {
                let mut builder = ChainBuilder::new();
                builder.inherit_frames(inherit)?;
                for event in events {
                    match *event {
                        TraceEvent::Enter { enter, at } => builder.enter_frame(enter, at)?,
                        TraceEvent::Leave { leave } => {
                            if builder.leave_frame(leave).is_none() {
                                bail!("leaving a frame at offset {leave} but none is open");
                            }
                        }
                    }
                }
                let chain = builder.finish(*size)?;
                chain
                    .check(*size)
                    .with_context(|| format!("trace for region {address:#x} leaves the region"))?;
                self.add_code(*address, *size, chain)?;
            }
            Op::RemoveCode { address } => {
                if !self.code.remove(address) {
                    bail!("no region is registered at {address:#x}");
                }
                self.registry.unregister_code(*address);
            }
            Op::AddDepth {
                address,
                size,
                depth,
            } => {
                self.claim_depth(*address)?;
                self.registry.depth().add(*address, *size, *depth)?;
            }
            Op::FrameDepths {
                start,
                stop,
                positions,
                depths,
            } => {
                let len = stop.saturating_sub(*start);
                for (i, &pos) in positions.iter().enumerate() {
                    let next = positions.get(i + 1).map_or(len, |&p| p as usize);
                    if next > pos as usize {
                        self.claim_depth(start + pos as usize)?;
                    }
                }
                self.registry
                    .register_frame_depth_map(*start, *stop, positions, depths)?;
            }
            Op::ClearDepth { address, size } => {
                forget_range(&mut self.depth, *address, *size);
                self.registry.depth().clear_range(*address, *size);
            }
            Op::Free { start, stop } => {
                let len = stop.saturating_sub(*start);
                forget_range(&mut self.depth, *start, len);
                forget_range(&mut self.code, *start, len);
                self.registry.free_code_block(*start, *stop);
            }
        }
        Ok(())
    }

    fn add_code(&mut self, address: usize, size: u32, chain: FrameChain) -> Result<()> {
        if !self.code.insert(address) {
            bail!("a region is already registered at {address:#x}");
        }
        self.registry.register_code(address, size, chain)?;
        Ok(())
    }

    fn claim_depth(&mut self, address: usize) -> Result<()> {
        if !self.depth.insert(address) {
            bail!("a depth block is already registered at {address:#x}");
        }
        Ok(())
    }

    /// Samples `pc` the way a profiler would.
    pub fn sample(&self, pc: usize) -> Sample {
        let region = self.registry.find_region(pc).map(|r| r.start());
        Sample {
            pc,
            region,
            frames: self.registry.unpack_traceback(pc),
            depth: self.registry.stack_depth_at(pc),
        }
    }
}

fn forget_range(keys: &mut BTreeSet<usize>, start: usize, len: usize) {
    let gone: Vec<usize> = keys
        .range(start..start.saturating_add(len))
        .copied()
        .collect();
    for key in gone {
        keys.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(ops: &[Op]) -> Result<Replay> {
        let mut replay = Replay::new(&Config::new());
        for op in ops {
            replay.apply(op)?;
        }
        Ok(replay)
    }

    #[test]
    fn recursive_trace_with_depths() -> Result<()> {
        let replay = replay(&[
            Op::AddTrace {
                address: 0x10000,
                size: 600,
                inherit: vec![],
                events: vec![
                    TraceEvent::Enter { enter: 4, at: 0 },
                    TraceEvent::Enter { enter: 2, at: 100 },
                    TraceEvent::Leave { leave: 300 },
                ],
            },
            Op::FrameDepths {
                start: 0x10000,
                stop: 0x10000 + 600,
                positions: vec![0, 100],
                depths: vec![16, 48],
            },
        ])?;

        assert_eq!(
            replay.sample(0x10000 + 200),
            Sample {
                pc: 0x10000 + 200,
                region: Some(0x10000),
                frames: vec![4, 2],
                depth: Some(48),
            }
        );
        assert_eq!(replay.sample(0x10000 + 50).depth, Some(16));
        assert_eq!(replay.sample(0x10000 + 400).frames, [4]);
        assert_eq!(
            replay.sample(0x20000),
            Sample {
                pc: 0x20000,
                region: None,
                frames: vec![],
                depth: None,
            }
        );
        Ok(())
    }

    #[test]
    fn free_then_reuse_the_block() -> Result<()> {
        let mut replay = replay(&[
            Op::AddCode {
                address: 0x1000,
                size: 64,
                chain: vec![7, 0, 64, 4],
            },
            Op::AddDepth {
                address: 0x1000,
                size: 64,
                depth: 3,
            },
            Op::Free {
                start: 0x1000,
                stop: 0x1040,
            },
        ])?;
        assert_eq!(replay.sample(0x1020).region, None);
        assert_eq!(replay.sample(0x1020).depth, None);

        replay.apply(&Op::AddCode {
            address: 0x1000,
            size: 32,
            chain: vec![8, 0, 32, 4],
        })?;
        assert_eq!(replay.sample(0x1010).frames, [8]);
        assert_eq!(replay.registry().code().len(), 1);
        Ok(())
    }

    #[test]
    fn script_mistakes_are_errors() {
        let add = Op::AddCode {
            address: 0x1000,
            size: 64,
            chain: vec![7, 0, 64, 4],
        };
        let err = |ops: &[Op]| format!("{:#}", replay(ops).err().unwrap());

        assert!(err(&[add.clone(), add.clone()]).contains("already registered"));
        assert!(err(&[Op::RemoveCode { address: 0x1000 }]).contains("no region"));
        assert!(
            err(&[Op::AddCode {
                address: 0x1000,
                size: 64,
                chain: vec![7, 0, 64, 0],
            }])
            .contains("malformed chain")
        );
        assert!(
            err(&[Op::AddTrace {
                address: 0,
                size: 8,
                inherit: vec![],
                events: vec![TraceEvent::Leave { leave: 4 }],
            }])
            .contains("none is open")
        );
        assert!(
            err(&[Op::AddTrace {
                address: 0,
                size: 8,
                inherit: vec![],
                events: vec![TraceEvent::Enter { enter: 1, at: 16 }],
            }])
            .contains("leaves the region")
        );
    }

    #[test]
    fn clear_depth_forgets_keys() -> Result<()> {
        let mut replay = replay(&[
            Op::AddDepth {
                address: 0x2000,
                size: 16,
                depth: 3,
            },
            Op::ClearDepth {
                address: 0x2000,
                size: 16,
            },
        ])?;
        replay.apply(&Op::AddDepth {
            address: 0x2000,
            size: 8,
            depth: 5,
        })?;
        assert_eq!(replay.sample(0x2007).depth, Some(5));
        assert_eq!(replay.sample(0x2008).depth, None);
        Ok(())
    }
}
