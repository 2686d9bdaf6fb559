//! Entry point for the rtld loader.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and initialise logging.
//! 2. Map each input object file and index it.
//! 3. Build segments and load sections/symbols for every module, so that
//!    modules loaded together can refer to each other.
//! 4. Resolve imports and apply relocations, then run initializers.
//! 5. Optionally call the requested entry symbol.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;

use rtld::config::Config;
use rtld::loader::ObjectModule;
use rtld::symtab::GlobalSymbols;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut globals = GlobalSymbols::new();
    let mut modules = Vec::new();

    // 1. Parse every image and allocate its memory.
    for path in &config.inputs {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let name = path.display().to_string();

        let mut module =
            ObjectModule::init_from_image(&name, mmap.to_vec(), config.isolate_sections)?;
        module.build_segments()?;
        module.extract_symbols_and_sections(&mut globals)?;
        modules.push(module);
    }

    // 2. With every module's exports visible, resolve and relocate.
    for module in &mut modules {
        module.resolve_and_relocate(&mut globals)?;
    }

    // 3. Run module initializers in load order.
    for module in &modules {
        module.run_initializers()?;
    }

    tracing::info!(
        modules = modules.len(),
        symbols = globals.len(),
        "all modules loaded"
    );

    // 4. Hand control to the requested entry symbol, if any.
    if let Some(entry) = &config.entry {
        let addr = globals
            .lookup(entry)
            .with_context(|| format!("entry symbol `{entry}' is not defined"))?;
        tracing::info!(entry = %entry, addr = %format_args!("{addr:#x}"), "calling entry");
        let f: unsafe extern "C" fn() = unsafe { std::mem::transmute(addr as usize) };
        unsafe { f() };
    }

    Ok(())
}
