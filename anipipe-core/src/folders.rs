use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum FolderError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("series folder {0} no longer exists")]
    Missing(PathBuf),
}

pub type FolderResult<T> = Result<T, FolderError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FolderError + '_ {
    move |source| FolderError::Io {
        source,
        path: path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    Pending,
    Processing,
    Done,
}

/// One directory directly under the work root. The folder name is the series
/// title.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesFolder {
    pub name: String,
    pub path: PathBuf,
    pub state: FolderState,
}

impl SeriesFolder {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            name,
            path,
            state: FolderState::Pending,
        }
    }
}

/// Lists series folders under `root` in name order. Hidden directories are
/// skipped, and a missing root yields an empty list.
pub fn scan_series_folders(root: &Path) -> FolderResult<Vec<SeriesFolder>> {
    if !root.exists() {
        debug!(root = %root.display(), "work root does not exist");
        return Ok(Vec::new());
    }
    let mut folders = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err(root))? {
        let entry = entry.map_err(io_err(root))?;
        let path = entry.path();
        if !entry.file_type().map_err(io_err(&path))?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        folders.push(SeriesFolder::new(path));
    }
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(folders)
}

/// `done_root/name`, or the first free `done_root/name_N` for N = 1, 2, ...
pub fn unique_destination(done_root: &Path, name: &str) -> PathBuf {
    let candidate = done_root.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let candidate = done_root.join(format!("{name}_{counter}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Moves a finished folder under `done_root` and marks it done. Existing
/// destinations are never overwritten.
pub fn relocate(folder: &mut SeriesFolder, done_root: &Path) -> FolderResult<PathBuf> {
    if !folder.path.is_dir() {
        return Err(FolderError::Missing(folder.path.clone()));
    }
    fs::create_dir_all(done_root).map_err(io_err(done_root))?;
    let destination = unique_destination(done_root, &folder.name);

    if let Err(err) = fs::rename(&folder.path, &destination) {
        // Cross-device moves cannot be renamed.
        warn!(
            from = %folder.path.display(),
            to = %destination.display(),
            error = %err,
            "rename failed, copying instead"
        );
        copy_tree(&folder.path, &destination)?;
        fs::remove_dir_all(&folder.path).map_err(io_err(&folder.path))?;
    }

    info!(series = %folder.name, to = %destination.display(), "moved to done");
    folder.path = destination.clone();
    folder.state = FolderState::Done;
    Ok(destination)
}

fn copy_tree(from: &Path, to: &Path) -> FolderResult<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(from).to_path_buf();
            FolderError::Io {
                source: err.into(),
                path,
            }
        })?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_err(&target))?;
        }
    }
    Ok(())
}
