//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors so that log
//! lines say what was being attempted.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Create a private scratch directory under `parent` with the given prefix.
///
/// The directory and its contents are removed when the returned handle drops.
pub fn scratch_dir(parent: &Path, prefix: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| io_error("creating scratch directory in", parent, e))
}
