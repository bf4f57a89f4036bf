//! animload.
//!
//! Command line access to the animload engine: load animations from files, URLs and a local
//! mirror the same way an application would, inspect animation files, and clean up the disk
//! cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
