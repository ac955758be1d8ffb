//! Dub detection and format choice over extractor metadata.

use serde::Serialize;

use super::extractor::{RemoteFormat, RemoteVideo};

pub const DUB_KEYWORDS: &[&str] = &["dub", "english dub", "dubbed", "english"];
pub const SUB_KEYWORDS: &[&str] = &["sub", "subbed", "subtitled"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DubVerdict {
    /// Formats or title say dub.
    Dub,
    /// Nothing either way; English sites usually serve the dub by default.
    AssumedDub,
    Sub,
}

impl DubVerdict {
    pub fn is_dub(self) -> bool {
        !matches!(self, DubVerdict::Sub)
    }
}

/// Lower-cased word tokens, plus adjacent pairs so that two-word keywords
/// match as a unit.
fn tokens(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    let pairs: Vec<String> = words.windows(2).map(|pair| pair.join(" ")).collect();
    words.into_iter().chain(pairs).collect()
}

fn mentions(text: &str, keywords: &[&str]) -> bool {
    tokens(text)
        .iter()
        .any(|token| keywords.contains(&token.as_str()))
}

pub fn is_dub_format(format: &RemoteFormat) -> bool {
    let descriptor = format.descriptor();
    mentions(&descriptor, DUB_KEYWORDS) && !mentions(&descriptor, SUB_KEYWORDS)
}

/// Format metadata wins; title and description are consulted only when no
/// format is tagged as a dub.
pub fn assess_dub(video: &RemoteVideo) -> DubVerdict {
    if video.formats.iter().any(is_dub_format) {
        return DubVerdict::Dub;
    }
    let text = format!(
        "{} {}",
        video.title.as_deref().unwrap_or_default(),
        video.description.as_deref().unwrap_or_default()
    );
    if mentions(&text, SUB_KEYWORDS) {
        DubVerdict::Sub
    } else if mentions(&text, DUB_KEYWORDS) {
        DubVerdict::Dub
    } else {
        DubVerdict::AssumedDub
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatChoice {
    /// Selector handed to the extractor's `-f`.
    pub spec: String,
    pub format_id: Option<String>,
    pub height: Option<u32>,
    pub dub: bool,
}

/// Walks the resolution ladder over dub-tagged formats first, then over all
/// formats. At each height muxed audio+video beats video-only and larger
/// files beat smaller ones. Falls back to the best stream no taller than the
/// top rung.
pub fn select_format(formats: &[RemoteFormat], ladder: &[u32]) -> FormatChoice {
    let dubbed: Vec<&RemoteFormat> = formats.iter().filter(|f| is_dub_format(f)).collect();
    let everything: Vec<&RemoteFormat> = formats.iter().collect();

    for (pool, dub) in [(&dubbed, true), (&everything, false)] {
        for height in ladder {
            let best = pool
                .iter()
                .filter(|f| f.height == Some(*height) && f.has_video())
                .max_by_key(|f| (f.has_audio(), f.size()));
            if let Some(format) = best {
                let spec = if format.has_audio() {
                    format.format_id.clone()
                } else {
                    format!("{id}+bestaudio/{id}", id = format.format_id)
                };
                return FormatChoice {
                    spec,
                    format_id: Some(format.format_id.clone()),
                    height: Some(*height),
                    dub: dub || is_dub_format(format),
                };
            }
        }
    }

    let ceiling = ladder.iter().copied().max().unwrap_or(480);
    FormatChoice {
        spec: format!("best[height<={ceiling}]/best"),
        format_id: None,
        height: None,
        dub: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, height: u32, audio: bool, size: u64) -> RemoteFormat {
        RemoteFormat {
            format_id: id.to_string(),
            height: Some(height),
            vcodec: Some("avc1".into()),
            acodec: Some(if audio { "mp4a" } else { "none" }.into()),
            filesize: Some(size),
            ..RemoteFormat::default()
        }
    }

    fn video(title: &str, description: &str, formats: Vec<RemoteFormat>) -> RemoteVideo {
        RemoteVideo {
            title: Some(title.into()),
            description: Some(description.into()),
            formats,
            ..RemoteVideo::default()
        }
    }

    #[test]
    fn dub_formats_take_precedence_over_title() {
        let v = video(
            "Frieren Episode 3 (Subbed)",
            "",
            vec![format("hls-480-dub", 480, true, 10)],
        );
        assert_eq!(assess_dub(&v), DubVerdict::Dub);
    }

    #[test]
    fn title_keywords_decide_without_format_hints() {
        assert_eq!(assess_dub(&video("Frieren (English Dub)", "", vec![])), DubVerdict::Dub);
        assert_eq!(assess_dub(&video("Frieren", "Watch subbed now", vec![])), DubVerdict::Sub);
        assert_eq!(
            assess_dub(&video("Frieren Dub", "also available subtitled", vec![])),
            DubVerdict::Sub
        );
    }

    #[test]
    fn silence_means_assumed_dub() {
        let verdict = assess_dub(&video("Frieren Episode 3", "", vec![]));
        assert_eq!(verdict, DubVerdict::AssumedDub);
        assert!(verdict.is_dub());
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert_eq!(
            assess_dub(&video("Subaru's Journey", "Please subscribe", vec![])),
            DubVerdict::AssumedDub
        );
    }

    #[test]
    fn ladder_prefers_lowest_rung_and_muxed_streams() {
        let formats = vec![
            format("720", 720, true, 900),
            format("480-video", 480, false, 800),
            format("480-small", 480, true, 100),
            format("480-large", 480, true, 300),
        ];
        let choice = select_format(&formats, &[360, 480, 720, 1080]);
        assert_eq!(choice.spec, "480-large");
        assert_eq!(choice.height, Some(480));
    }

    #[test]
    fn dub_pool_is_searched_before_everything_else() {
        let formats = vec![
            format("360-sub", 360, true, 50),
            format("720-dub", 720, true, 900),
        ];
        let choice = select_format(&formats, &[360, 480, 720, 1080]);
        assert_eq!(choice.format_id.as_deref(), Some("720-dub"));
        assert!(choice.dub);
    }

    #[test]
    fn video_only_streams_get_best_audio() {
        let choice = select_format(&[format("137", 480, false, 1)], &[480]);
        assert_eq!(choice.spec, "137+bestaudio/137");
    }

    #[test]
    fn nothing_on_the_ladder_falls_back() {
        let choice = select_format(&[format("4k", 2160, true, 1)], &[360, 480]);
        assert_eq!(choice.spec, "best[height<=480]/best");
        assert!(choice.format_id.is_none());
    }
}
