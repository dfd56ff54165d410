use std::{
    io::{self, ErrorKind},
    path::Path,
};

use tracing::{info, warn};

use crate::foundation::error::{DriverError, DriverResult};

/// Remove an output file left behind by a previous render so start detection cannot
/// succeed on it.
pub fn clear_stale_output(path: &Path) -> DriverResult<()> {
    let fail = |source: io::Error| DriverError::StaleOutput {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(fail(io::Error::from(ErrorKind::IsADirectory))),
        Ok(_) => {
            std::fs::remove_file(path).map_err(fail)?;
            warn!(path = %path.display(), "removed stale output from a previous render");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fail(e)),
    }
}

/// Move the rendered file to its destination, replacing any previous artifact.
///
/// On failure the source is left where it is.
pub fn finalize_artifact(from: &Path, to: &Path) -> DriverResult<()> {
    let fail = |source: std::io::Error| DriverError::Finalize {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }
    if to.exists() {
        warn!(path = %to.display(), "replacing existing artifact");
    }

    match std::fs::rename(from, to) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            std::fs::copy(from, to).map_err(fail)?;
            std::fs::remove_file(from).map_err(fail)?;
        }
        Err(e) => return Err(fail(e)),
    }

    info!(from = %from.display(), to = %to.display(), "artifact finalized");
    Ok(())
}
