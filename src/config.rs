//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the loader using
//! `clap`. It handles parsing arguments like input object files, the entry
//! symbol, and the mapping profile.

use clap::Parser;
use std::path::PathBuf;

/// A minimal runtime loader/linker for 64-bit Mach-O object files.
///
/// Loads relocatable objects into the running process, resolves their
/// symbols, applies relocations, and runs their initializers. It is designed
/// for educational purposes and supports the x86_64 and arm64 flavours of
/// the format.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files, loaded in order
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Symbol to look up and call once everything is loaded
    #[arg(short, long, help = "Entry symbol to invoke after loading")]
    pub entry: Option<String>,

    /// Map every section on its own instead of into shared segments
    #[arg(long, help = "Force the constrained per-section mapping profile")]
    pub isolate_sections: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}
