use std::fmt;

use rand::Rng;
use serde::Serialize;

pub const MAX_BASE_LEN: usize = 28;
pub const MIN_BASE_LEN: usize = 3;
const SHORT_PREFIX: &str = "channel_";

/// Public channel handle, rendered `base_slug_NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHandle {
    pub base_slug: String,
    pub numeric_suffix: u16,
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:03}", self.base_slug, self.numeric_suffix)
    }
}

impl ChannelHandle {
    /// Same base, fresh suffix.
    pub fn regenerate<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        Self {
            base_slug: self.base_slug.clone(),
            numeric_suffix: rng.gen_range(100..=999),
        }
    }
}

/// Lower-cases, turns whitespace into underscores, drops everything else that
/// is not ASCII alphanumeric, collapses runs of underscores and caps the
/// length.
pub fn slugify(display_name: &str) -> String {
    let mut slug = String::with_capacity(display_name.len());
    for ch in display_name.chars() {
        let mapped = if ch.is_whitespace() || ch == '_' {
            '_'
        } else if ch.is_ascii_alphanumeric() {
            ch.to_ascii_lowercase()
        } else {
            continue;
        };
        if mapped == '_' && slug.ends_with('_') {
            continue;
        }
        slug.push(mapped);
    }
    let mut slug = slug.trim_matches('_').to_string();
    if slug.len() < MIN_BASE_LEN {
        slug = format!("{SHORT_PREFIX}{slug}").trim_end_matches('_').to_string();
    }
    slug.truncate(MAX_BASE_LEN);
    slug.trim_end_matches('_').to_string()
}

pub fn generate_handle(display_name: &str) -> ChannelHandle {
    generate_handle_with(display_name, &mut rand::thread_rng())
}

pub fn generate_handle_with<R: Rng + ?Sized>(display_name: &str, rng: &mut R) -> ChannelHandle {
    ChannelHandle {
        base_slug: slugify(display_name),
        numeric_suffix: rng.gen_range(100..=999),
    }
}
