use crate::engine::{Directory, Engine};
use crate::error::{Error, Result};
use tracing::debug;

/// Marker file naming the Terraform version a source tree expects.
pub const VERSION_FILE_NAME: &str = ".terraform-version";

/// Resolve the tool version for a source tree.
///
/// A non-empty `explicit` value wins verbatim and the tree is not read.
/// Otherwise the trimmed contents of [`VERSION_FILE_NAME`] are used; a
/// missing, unreadable or blank marker is a configuration error.
pub fn resolve(engine: &dyn Engine, explicit: Option<&str>, source: &Directory) -> Result<String> {
    if let Some(version) = explicit.filter(|value| !value.is_empty()) {
        return Ok(version.to_string());
    }

    let contents = engine
        .read_file(source, VERSION_FILE_NAME)
        .map_err(|err| {
            Error::configuration(format!("failed to read {VERSION_FILE_NAME}: {err}"))
        })?
        .ok_or_else(|| {
            Error::configuration(format!(
                "no version given and {VERSION_FILE_NAME} not found in source"
            ))
        })?;

    let contents = String::from_utf8(contents)
        .map_err(|_| Error::configuration(format!("{VERSION_FILE_NAME} is not valid UTF-8")))?;

    let version = contents.trim();
    if version.is_empty() {
        return Err(Error::configuration(format!("{VERSION_FILE_NAME} is empty")));
    }

    debug!(version, "resolved version from marker file");
    Ok(version.to_string())
}
