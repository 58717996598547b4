//! Media proxy.
//!
//! A web service that serves audio for media identifiers. Content is acquired through an external
//! downloader on the first request, cached on disk and served from there until it has not been
//! requested for a while. Clients are filtered by IP allow and deny lists.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
