//! The jitmap command line interface (CLI) crate.
//!
//! This crate implements the `jitmap` tool, which replays scripts of JIT
//! compiler events against a code registry and decodes raw frame chains.

#![deny(missing_docs)]

pub mod commands;
pub mod script;
