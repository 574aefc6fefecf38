//! The module for the jitmap CLI commands.

mod decode;
mod replay;

pub use self::{decode::*, replay::*};

use anyhow::{Context, Result};

/// Parses an address given on the command line, in hex with a `0x` prefix
/// or in decimal.
pub fn parse_address(s: &str) -> Result<usize> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.with_context(|| format!("invalid address `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_address("0x1020").unwrap(), 0x1020);
        assert_eq!(parse_address("0X1_0000").unwrap(), 0x10000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
        assert!(parse_address("").is_err());
    }
}
