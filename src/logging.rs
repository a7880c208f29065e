//! Logging setup (spec.md ambient stack B.1). Library code only ever calls
//! `log::{trace,debug,info,warn,error}!`; this module wires a `fern`
//! dispatcher once from `main`, matching the teacher's `log`+`fern`+`chrono`
//! dependency stack (`Cargo.toml`).

use colored::Colorize;
use log::LevelFilter;

/// Installs the global logger. `verbose` selects `Debug` instead of `Info`
/// as the default level; `RUST_LOG`-style per-module overrides are not
/// supported, matching the teacher's single global level.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            let level_str = match record.level() {
                log::Level::Error => record.level().to_string().red().to_string(),
                log::Level::Warn => record.level().to_string().yellow().to_string(),
                log::Level::Info => record.level().to_string().green().to_string(),
                log::Level::Debug | log::Level::Trace => record.level().to_string().cyan().to_string(),
            };
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level_str,
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();

    if let Err(e) = result {
        eprintln!("logger already initialized: {}", e);
    }
}
