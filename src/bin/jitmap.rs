//! The `jitmap` command line tool.
//!
//! Replays scripts of JIT compiler events against a code registry and
//! decodes raw frame chains. See `jitmap --help` for usage.

use anyhow::Result;
use clap::Parser;

/// Inspect the address-to-frame maps of a tracing JIT
#[derive(Parser)]
#[command(
    name = "jitmap",
    version,
    after_help = "Usage examples:\n\
                  \n\
                  Replaying a script and sampling one more program counter:\n\
                  \n  \
                  jitmap replay trace.toml --pc 0x100c8\n\
                  \n\
                  Decoding a chain with one frame inlined into another:\n\
                  \n  \
                  jitmap decode --chain 4,0,600,8,2,100,300,8 --offset 200\n"
)]
struct Jitmap {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Replays a script of JIT events and samples program counters
    Replay(jitmap_cli::commands::ReplayCommand),

    /// Decodes the frames active at an offset of a raw frame chain
    Decode(jitmap_cli::commands::DecodeCommand),
}

impl Jitmap {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        match self.subcommand {
            Subcommand::Replay(c) => c.execute(),
            Subcommand::Decode(c) => c.execute(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    Jitmap::parse().execute()
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Jitmap::command().debug_assert()
}
