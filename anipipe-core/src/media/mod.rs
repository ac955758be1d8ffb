mod classifier;
mod matcher;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub use classifier::{
    canonical_episode_name, classify, extract_episode_ordinal, AssetKind, OrdinalPattern,
    MAX_ORDINAL, MIN_ORDINAL, ORDINAL_PATTERNS, SUBTITLE_EXTENSIONS, VIDEO_EXTENSIONS,
};
pub use matcher::{match_pairs, MatchOutcome, MatchedPair, UnmatchedAsset, UnmatchedReason};

pub(crate) use classifier::extension_of;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaAsset {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub episode_ordinal: Option<u32>,
}

impl MediaAsset {
    /// `None` for files that are neither video nor subtitle.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_string();
        let kind = classify(&name);
        if kind == AssetKind::Unknown {
            return None;
        }
        Some(Self {
            episode_ordinal: extract_episode_ordinal(&name),
            path,
            kind,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.file_name())
    }
}

/// Video and subtitle assets of a folder, sorted by file name.
#[derive(Debug, Clone, Default)]
pub struct FolderAssets {
    pub videos: Vec<MediaAsset>,
    pub subtitles: Vec<MediaAsset>,
}

pub fn scan_assets(folder: &Path) -> io::Result<FolderAssets> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut assets = FolderAssets::default();
    for path in paths {
        match MediaAsset::from_path(path) {
            Some(asset) if asset.kind == AssetKind::Video => assets.videos.push(asset),
            Some(asset) => assets.subtitles.push(asset),
            None => {}
        }
    }
    Ok(assets)
}
