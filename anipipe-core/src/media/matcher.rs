use std::collections::HashSet;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use super::MediaAsset;

#[derive(Debug, Clone, Serialize)]
pub struct MatchedPair {
    pub ordinal: u32,
    pub video: MediaAsset,
    pub subtitle: MediaAsset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    NoOrdinal,
    NoSubtitle,
    DuplicateOrdinal,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedAsset {
    pub path: PathBuf,
    pub reason: UnmatchedReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    pub pairs: Vec<MatchedPair>,
    pub unmatched: Vec<UnmatchedAsset>,
}

/// Pairs every video with the first unused subtitle carrying the same
/// ordinal, in the order the assets are given. An ordinal is claimed by the
/// first video that has it; later videos with that ordinal are reported as
/// duplicates.
pub fn match_pairs(videos: &[MediaAsset], subtitles: &[MediaAsset]) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut consumed = HashSet::new();
    let mut claimed = HashSet::new();

    for video in videos {
        let Some(ordinal) = video.episode_ordinal else {
            debug!(path = %video.path.display(), "no episode ordinal, skipping");
            outcome.unmatched.push(UnmatchedAsset {
                path: video.path.clone(),
                reason: UnmatchedReason::NoOrdinal,
            });
            continue;
        };
        if !claimed.insert(ordinal) {
            warn!(path = %video.path.display(), ordinal, "duplicate episode ordinal, skipping");
            outcome.unmatched.push(UnmatchedAsset {
                path: video.path.clone(),
                reason: UnmatchedReason::DuplicateOrdinal,
            });
            continue;
        }
        let found = subtitles
            .iter()
            .enumerate()
            .find(|(index, subtitle)| {
                subtitle.episode_ordinal == Some(ordinal) && !consumed.contains(index)
            });
        match found {
            Some((index, subtitle)) => {
                consumed.insert(index);
                outcome.pairs.push(MatchedPair {
                    ordinal,
                    video: video.clone(),
                    subtitle: subtitle.clone(),
                });
            }
            None => {
                debug!(path = %video.path.display(), ordinal, "no subtitle for episode");
                outcome.unmatched.push(UnmatchedAsset {
                    path: video.path.clone(),
                    reason: UnmatchedReason::NoSubtitle,
                });
            }
        }
    }
    outcome
}
