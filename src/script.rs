//! Replay scripts: a TOML description of what a JIT registered and freed.
//!
//! ```toml
//! queries = [0x10000, 0x100c8]
//!
//! [config]
//! seed = 7
//!
//! [[op]]
//! kind = "add-trace"
//! address = 0x10000
//! size = 600
//! events = [{ enter = 4, at = 0 }, { enter = 2, at = 100 }, { leave = 300 }]
//!
//! [[op]]
//! kind = "frame-depths"
//! start = 0x10000
//! stop = 0x10258
//! positions = [0, 100]
//! depths = [16, 48]
//! ```

use anyhow::{Context, Result, bail};
use jitmap_codemap::Config;
use serde_derive::Deserialize;
use std::path::Path;

/// A parsed replay script.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Program counters to sample once every op has been applied.
    #[serde(default)]
    pub queries: Vec<usize>,

    /// Tuning of the registry the script is replayed against.
    #[serde(default)]
    pub config: ScriptConfig,

    /// The events, in the order the JIT issued them.
    #[serde(default, rename = "op")]
    pub ops: Vec<Op>,
}

/// The `[config]` table of a script.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScriptConfig {
    /// See [`Config::max_height`].
    pub max_height: Option<usize>,
    /// See [`Config::chunk_size`].
    pub chunk_size: Option<usize>,
    /// See [`Config::seed`].
    pub seed: Option<u64>,
    /// See [`Config::max_nodes`].
    pub max_nodes: Option<u32>,
}

impl ScriptConfig {
    /// Applies the settings present in this table to `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(height) = self.max_height {
            config.max_height(height);
        }
        if let Some(nodes) = self.chunk_size {
            config.chunk_size(nodes);
        }
        if let Some(seed) = self.seed {
            config.seed(seed);
        }
        if let Some(nodes) = self.max_nodes {
            config.max_nodes(nodes);
        }
    }
}

/// One event of a script.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Op {
    /// Registers a region with an already encoded frame chain.
    AddCode {
        /// Region start.
        address: usize,
        /// Region size in bytes.
        size: u32,
        /// The chain's words.
        chain: Vec<u32>,
    },

    /// Registers a region whose chain is built from inlining events.
    AddTrace {
        /// Region start.
        address: usize,
        /// Region size in bytes.
        size: u32,
        /// Frames already active when the region starts, enclosing-first.
        #[serde(default)]
        inherit: Vec<u32>,
        /// Frame entries and exits, in emission order.
        #[serde(default)]
        events: Vec<TraceEvent>,
    },

    /// Unregisters the region starting at `address`.
    RemoveCode {
        /// Region start.
        address: usize,
    },

    /// Registers one stack-depth block.
    AddDepth {
        /// Block start.
        address: usize,
        /// Block size in bytes.
        size: u32,
        /// Stack depth over the block.
        depth: u32,
    },

    /// Registers the stack depths of a whole region.
    FrameDepths {
        /// Region start.
        start: usize,
        /// Region end, exclusive.
        stop: usize,
        /// Offsets at which the depth changes.
        positions: Vec<u32>,
        /// The depth starting at each offset.
        depths: Vec<u32>,
    },

    /// Clears every stack-depth block starting in a range.
    ClearDepth {
        /// Range start.
        address: usize,
        /// Range length in bytes.
        size: usize,
    },

    /// Drops all code and depth information for a block of machine code.
    Free {
        /// Block start.
        start: usize,
        /// Block end, exclusive.
        stop: usize,
    },
}

/// A frame boundary while a trace is emitted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum TraceEvent {
    /// Frame `enter` becomes active at offset `at`.
    Enter {
        /// The frame id.
        enter: u32,
        /// Offset into the region.
        at: u32,
    },
    /// The innermost active frame ends at offset `leave`.
    Leave {
        /// Offset into the region.
        leave: u32,
    },
}

impl Script {
    /// Parses a script from TOML source.
    pub fn parse(source: &str) -> Result<Script> {
        let script: Script = toml::from_str(source)?;
        script.validate()?;
        Ok(script)
    }

    /// Reads and parses the script at `path`.
    pub fn from_file(path: &Path) -> Result<Script> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script `{}`", path.display()))?;
        Script::parse(&source).with_context(|| format!("invalid script `{}`", path.display()))
    }

    /// Checks what can be checked without replaying.
    fn validate(&self) -> Result<()> {
        for (i, op) in self.ops.iter().enumerate() {
            match op {
                Op::FrameDepths {
                    start,
                    stop,
                    positions,
                    depths,
                } => {
                    if positions.len() != depths.len() {
                        bail!(
                            "op {i}: {} positions but {} depths",
                            positions.len(),
                            depths.len()
                        );
                    }
                    if positions.windows(2).any(|w| w[0] > w[1]) {
                        bail!("op {i}: positions are not ascending");
                    }
                    if stop < start {
                        bail!("op {i}: block {start:#x}..{stop:#x} ends before it starts");
                    }
                    if let Some(&last) = positions.last() {
                        if start.saturating_add(last as usize) > *stop {
                            bail!("op {i}: position {last:#x} is past the end of the block");
                        }
                    }
                }
                Op::Free { start, stop } if stop < start => {
                    bail!("op {i}: block {start:#x}..{stop:#x} ends before it starts");
                }
                Op::AddTrace { events, .. } => {
                    let mut offset = 0;
                    for event in events {
                        let at = match *event {
                            TraceEvent::Enter { at, .. } => at,
                            TraceEvent::Leave { leave } => leave,
                        };
                        if at < offset {
                            bail!("op {i}: trace offset {at} goes backwards from {offset}");
                        }
                        offset = at;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_op() {
        let script = Script::parse(
            r#"
            queries = [0x1020, 4096]

            [config]
            max-height = 4
            seed = 9

            [[op]]
            kind = "add-code"
            address = 0x1000
            size = 64
            chain = [7, 0, 64, 4]

            [[op]]
            kind = "add-trace"
            address = 0x10000
            size = 600
            inherit = [1]
            events = [{ enter = 4, at = 0 }, { leave = 300 }]

            [[op]]
            kind = "remove-code"
            address = 0x1000

            [[op]]
            kind = "add-depth"
            address = 0x2000
            size = 16
            depth = 3

            [[op]]
            kind = "frame-depths"
            start = 0x3000
            stop = 0x3100
            positions = [0, 0x80]
            depths = [8, 16]

            [[op]]
            kind = "clear-depth"
            address = 0x2000
            size = 16

            [[op]]
            kind = "free"
            start = 0x3000
            stop = 0x3100
            "#,
        )
        .unwrap();

        assert_eq!(script.queries, [0x1020, 4096]);
        assert_eq!(script.config.max_height, Some(4));
        assert_eq!(script.config.chunk_size, None);
        assert_eq!(script.ops.len(), 7);
        assert_eq!(
            script.ops[1],
            Op::AddTrace {
                address: 0x10000,
                size: 600,
                inherit: vec![1],
                events: vec![
                    TraceEvent::Enter { enter: 4, at: 0 },
                    TraceEvent::Leave { leave: 300 },
                ],
            }
        );
    }

    #[test]
    fn empty_script() {
        let script = Script::parse("").unwrap();
        assert!(script.ops.is_empty());
        assert!(script.queries.is_empty());
    }

    #[test]
    fn rejects_bad_scripts() {
        let err = |src: &str| format!("{:#}", Script::parse(src).unwrap_err());

        assert!(err("[[op]]\nkind = \"explode\"").contains("explode"));
        assert!(err("[config]\nheight = 3").contains("height"));
        assert!(
            err("[[op]]\nkind = \"frame-depths\"\nstart = 0\nstop = 16\npositions = [0]\ndepths = []")
                .contains("1 positions but 0 depths")
        );
        assert!(
            err("[[op]]\nkind = \"frame-depths\"\nstart = 0\nstop = 16\npositions = [8, 0]\ndepths = [1, 2]")
                .contains("not ascending")
        );
        assert!(
            err("[[op]]\nkind = \"add-trace\"\naddress = 0\nsize = 8\nevents = [{ enter = 1, at = 4 }, { leave = 2 }]")
                .contains("goes backwards")
        );
        assert!(err("[[op]]\nkind = \"free\"\nstart = 16\nstop = 0").contains("ends before"));
    }

    #[test]
    fn config_table_overrides_defaults() {
        let mut config = Config::new();
        ScriptConfig {
            max_height: Some(3),
            chunk_size: None,
            seed: Some(1),
            max_nodes: Some(10),
        }
        .apply(&mut config);
        let debug = format!("{config:?}");
        assert!(debug.contains("max_height: 3"));
        assert!(debug.contains("chunk_size: 64"));
        assert!(debug.contains("seed: 1"));
        assert!(debug.contains("max_nodes: 10"));
    }
}
