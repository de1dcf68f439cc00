//! Post-sweep tidying of the data folder.

use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files: usize,
    pub directories: usize,
}

/// Removes empty `.nc` files and then empty directories under each of `roots`,
/// deepest first, then every ancestor up to `data_folder` left empty. The data
/// folder itself is recreated if it was removed.
pub fn part_cleanup<'a, I>(roots: I, data_folder: &Utf8Path) -> Result<CleanupReport, SyncError>
where
    I: IntoIterator<Item = &'a Utf8Path>,
{
    let mut report = CleanupReport::default();
    for root in roots {
        let root = root.as_std_path();
        if !root.is_dir() {
            continue;
        }
        let (files, dirs) = walk(root)?;
        for file in files {
            if is_empty_netcdf(&file) {
                match fs::remove_file(&file) {
                    Ok(()) => report.files += 1,
                    Err(err) => warn!(path = %file.display(), error = %err, "cannot remove empty file"),
                }
            }
        }
        // `walk` lists parents before children.
        for dir in dirs.iter().rev() {
            if is_empty_dir(dir) && fs::remove_dir(dir).is_ok() {
                debug!(path = %dir.display(), "empty directory removed");
                report.directories += 1;
            }
        }
        report.directories += remove_empty_ancestors(root, data_folder.as_std_path());
    }

    if !data_folder.as_std_path().exists() {
        fs::create_dir_all(data_folder.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    Ok(report)
}

/// Climbs from `dir` towards `stop` removing each directory left empty.
/// `stop` itself may go; nothing above it is touched.
fn remove_empty_ancestors(dir: &Path, stop: &Path) -> usize {
    let mut removed = 0;
    let mut current = dir.parent();
    while let Some(parent) = current {
        if !parent.starts_with(stop) || !is_empty_dir(parent) || fs::remove_dir(parent).is_err() {
            break;
        }
        debug!(path = %parent.display(), "empty directory removed");
        removed += 1;
        if parent == stop {
            break;
        }
        current = parent.parent();
    }
    removed
}

fn walk(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), SyncError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    let mut index = 0;
    while index < dirs.len() {
        let entries = fs::read_dir(&dirs[index])
            .map_err(|err| SyncError::Filesystem(format!("{}: {err}", dirs[index].display())))?;
        for entry in entries {
            let path = entry
                .map_err(|err| SyncError::Filesystem(err.to_string()))?
                .path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
        index += 1;
    }
    Ok((files, dirs))
}

fn is_empty_netcdf(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "nc")
        && fs::metadata(path).is_ok_and(|meta| meta.len() == 0)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}
