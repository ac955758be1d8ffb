use std::path::Path;

use serde::Serialize;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm"];
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt", "ass", "ssa", "sub"];

pub const MIN_ORDINAL: u32 = 1;
pub const MAX_ORDINAL: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Subtitle,
    Unknown,
}

pub fn classify(filename: &str) -> AssetKind {
    let Some(extension) = extension_of(filename) else {
        return AssetKind::Unknown;
    };
    if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        AssetKind::Video
    } else if SUBTITLE_EXTENSIONS.contains(&extension.as_str()) {
        AssetKind::Subtitle
    } else {
        AssetKind::Unknown
    }
}

pub(crate) fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// `Episode 07.mp4`. Ordinals above 99 are printed without extra padding.
pub fn canonical_episode_name(ordinal: u32, extension: &str) -> String {
    format!(
        "Episode {:02}.{}",
        ordinal,
        extension.trim_start_matches('.').to_ascii_lowercase()
    )
}

/// Episode-number patterns in priority order. Specific forms come first so
/// that resolution tags or years are never read as an episode number while a
/// more explicit marker exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalPattern {
    /// `Episode 5`, `Ep 5`, `Ep.05`, `EP_5`
    EpisodeMarker,
    /// `S01E05`, `s1e5`
    SeasonEpisode,
    /// `Show - 05 - Title`, `Show - 05`
    DashDelimited,
    /// `[05]`, `(05)`
    Bracketed,
    /// last standalone 1–3 digit token
    BareNumber,
}

pub const ORDINAL_PATTERNS: [OrdinalPattern; 5] = [
    OrdinalPattern::EpisodeMarker,
    OrdinalPattern::SeasonEpisode,
    OrdinalPattern::DashDelimited,
    OrdinalPattern::Bracketed,
    OrdinalPattern::BareNumber,
];

impl OrdinalPattern {
    /// Explicit markers are authoritative: when one matches, lower patterns
    /// are not consulted even if its value is out of range.
    pub fn is_explicit(self) -> bool {
        matches!(
            self,
            OrdinalPattern::EpisodeMarker | OrdinalPattern::SeasonEpisode
        )
    }

    /// Every number this pattern finds in `stem`, in preference order.
    pub fn candidates(self, stem: &str) -> Vec<u32> {
        let lowered = stem.to_ascii_lowercase();
        let bytes = lowered.as_bytes();
        match self {
            OrdinalPattern::EpisodeMarker => episode_markers(bytes),
            OrdinalPattern::SeasonEpisode => season_episode(bytes),
            OrdinalPattern::DashDelimited => dash_delimited(bytes),
            OrdinalPattern::Bracketed => bracketed(bytes),
            OrdinalPattern::BareNumber => bare_numbers(bytes),
        }
    }
}

pub fn extract_episode_ordinal(filename: &str) -> Option<u32> {
    let stem = stem_of(filename);
    for pattern in ORDINAL_PATTERNS {
        let candidates = pattern.candidates(stem);
        if candidates.is_empty() {
            continue;
        }
        if let Some(ordinal) = candidates.into_iter().find(|value| in_range(*value)) {
            return Some(ordinal);
        }
        if pattern.is_explicit() {
            return None;
        }
    }
    None
}

fn in_range(value: u32) -> bool {
    (MIN_ORDINAL..=MAX_ORDINAL).contains(&value)
}

fn stem_of(filename: &str) -> &str {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
                    || SUBTITLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())) =>
        {
            stem
        }
        _ => name,
    }
}

fn is_word_start(bytes: &[u8], index: usize) -> bool {
    index == 0 || !bytes[index - 1].is_ascii_alphanumeric()
}

/// Reads the digit run at `start`. Returns the value (saturated for absurdly
/// long runs) and the index after the run.
fn read_number(bytes: &[u8], start: usize) -> Option<(u32, usize)> {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start {
        return None;
    }
    let value = if end - start > 6 {
        u32::MAX
    } else {
        std::str::from_utf8(&bytes[start..end])
            .ok()?
            .parse()
            .ok()?
    };
    Some((value, end))
}

fn skip_while(bytes: &[u8], mut index: usize, accept: impl Fn(u8) -> bool) -> usize {
    while index < bytes.len() && accept(bytes[index]) {
        index += 1;
    }
    index
}

fn episode_markers(bytes: &[u8]) -> Vec<u32> {
    let mut found = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if !is_word_start(bytes, index) {
            index += 1;
            continue;
        }
        let keyword_len = if bytes[index..].starts_with(b"episode") {
            7
        } else if bytes[index..].starts_with(b"ep") {
            2
        } else {
            index += 1;
            continue;
        };
        let after = skip_while(bytes, index + keyword_len, |b| {
            matches!(b, b' ' | b'.' | b'_' | b'-' | b'#')
        });
        if let Some((value, end)) = read_number(bytes, after) {
            found.push(value);
            index = end;
        } else {
            index += keyword_len;
        }
    }
    found
}

fn season_episode(bytes: &[u8]) -> Vec<u32> {
    let mut found = Vec::new();
    for index in 0..bytes.len() {
        if bytes[index] != b's' || !is_word_start(bytes, index) {
            continue;
        }
        let Some((_, season_end)) = read_number(bytes, index + 1) else {
            continue;
        };
        if bytes.get(season_end) != Some(&b'e') {
            continue;
        }
        if let Some((value, _)) = read_number(bytes, season_end + 1) {
            found.push(value);
        }
    }
    found
}

fn dash_delimited(bytes: &[u8]) -> Vec<u32> {
    let mut found = Vec::new();
    for index in 1..bytes.len() {
        if bytes[index] != b'-' || !bytes[index - 1].is_ascii_whitespace() {
            continue;
        }
        let start = skip_while(bytes, index + 1, |b| b.is_ascii_whitespace());
        if start == index + 1 {
            continue;
        }
        let Some((value, end)) = read_number(bytes, start) else {
            continue;
        };
        let next = skip_while(bytes, end, |b| b.is_ascii_whitespace());
        if next == bytes.len() || bytes[next] == b'-' {
            found.push(value);
        }
    }
    found
}

fn bracketed(bytes: &[u8]) -> Vec<u32> {
    let mut found = Vec::new();
    for index in 0..bytes.len() {
        let close = match bytes[index] {
            b'[' => b']',
            b'(' => b')',
            _ => continue,
        };
        if let Some((value, end)) = read_number(bytes, index + 1) {
            if bytes.get(end) == Some(&close) {
                found.push(value);
            }
        }
    }
    found
}

fn bare_numbers(bytes: &[u8]) -> Vec<u32> {
    let mut found: Vec<u32> = bytes
        .split(|b| !b.is_ascii_alphanumeric())
        .filter(|token| (1..=3).contains(&token.len()) && token.iter().all(u8::is_ascii_digit))
        .filter_map(|token| std::str::from_utf8(token).ok()?.parse().ok())
        .collect();
    // Series titles lead the name, so the trailing number is the better guess.
    found.reverse();
    found
}
