use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Copy the contents of `src` into `dst`, merging with whatever `dst` already holds.
///
/// Symlinks are recreated rather than followed. `skip` receives paths relative to
/// `src` (with `/` separators) and prunes matching entries.
pub fn copy_tree(src: &Path, dst: &Path, skip: &dyn Fn(&str, bool) -> bool) -> Result<()> {
    fs::create_dir_all(dst).map_err(|err| Error::io(dst, err))?;

    let mut walker = WalkDir::new(src).follow_links(false).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(src).to_path_buf();
            Error::io(path, err.into())
        })?;

        let relative = match entry.path().strip_prefix(src) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let relative_str = to_slash(relative);
        let file_type = entry.file_type();

        if skip(&relative_str, file_type.is_dir()) {
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        copy_entry(entry.path(), &dst.join(relative))?;
    }

    Ok(())
}

/// Copy a single file, directory (without contents) or symlink to `target`.
pub fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source).map_err(|err| Error::io(source, err))?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        if fs::symlink_metadata(target).is_ok_and(|meta| !meta.is_dir()) {
            remove_path(target)?;
        }
        return fs::create_dir_all(target).map_err(|err| Error::io(target, err));
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    if fs::symlink_metadata(target).is_ok() {
        remove_path(target)?;
    }

    if file_type.is_symlink() {
        let link = fs::read_link(source).map_err(|err| Error::io(source, err))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, target).map_err(|err| Error::io(target, err))?;
        #[cfg(not(unix))]
        fs::copy(source.parent().unwrap_or(source).join(&link), target)
            .map(|_| ())
            .map_err(|err| Error::io(target, err))?;
        return Ok(());
    }

    fs::copy(source, target)
        .map(|_| ())
        .map_err(|err| Error::io(target, err))
}

/// Remove a file, symlink or directory tree if present.
pub fn remove_path(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|err| Error::io(path, err))
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .map_err(|err| Error::io(path, err))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions).map_err(|err| Error::io(path, err))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
