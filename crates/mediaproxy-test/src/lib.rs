//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - Call [`setup`] in tests that should show log output. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The cache creates its directories lazily, so a directory that
//!    is dropped too early might silently be leaked. To avoid this, assign it to a variable in the
//!    test function (e.g. `let dir = test::tempdir()`).
//!
//!  - Downloaders created with [`fake_downloader`] are shell scripts that are run through
//!    `/bin/sh`, with the media identifier as their first argument.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Name of the file in which [`counting_downloader`] records its invocations.
const INVOCATIONS_FILE: &str = "invocations";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the mediaproxy crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("mediaproxy=trace,mediaproxy_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `lines` to the file `name` in `dir`, one per line, and returns its path.
pub fn write_lines(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(&path, contents).unwrap();
    path
}

/// Creates a downloader script in `dir` and returns the command template to run it.
///
/// `script` is the body of a `/bin/sh` script. It receives the media identifier as `$1` and
/// should write the content to stdout.
pub fn fake_downloader(dir: &Path, script: &str) -> Vec<String> {
    let mut file = tempfile::Builder::new()
        .prefix("downloader")
        .suffix(".sh")
        .tempfile_in(dir)
        .unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{script}").unwrap();
    let (_, path) = file.keep().unwrap();

    // Running the script through the shell instead of executing it directly avoids `ETXTBSY`
    // when another test forks while the file is still open for writing.
    vec![
        "/bin/sh".to_owned(),
        path.display().to_string(),
        "{id}".to_owned(),
    ]
}

/// Like [`fake_downloader`], but additionally records every run in `dir`.
///
/// The number of runs so far is returned by [`invocations`].
pub fn counting_downloader(dir: &Path, script: &str) -> Vec<String> {
    let log = dir.join(INVOCATIONS_FILE);
    fake_downloader(
        dir,
        &format!("echo \"$1\" >> '{}'\n{script}", log.display()),
    )
}

/// The number of times a [`counting_downloader`] in `dir` was run.
pub fn invocations(dir: &Path) -> usize {
    match fs::read_to_string(dir.join(INVOCATIONS_FILE)) {
        Ok(contents) => contents.lines().count(),
        Err(_) => 0,
    }
}
