//! Fuzzy dish-name matching for image results
//!
//! Image results are keyed by the dish name the image service was asked
//! about, which is not always the exact name the menu ended up with.
//! Candidates are ranked by tier, then by score within a tier:
//! 1. Exact (normalized) name
//! 2. Longest mutual substring, above length and overlap thresholds
//! 3. Longest shared prefix, above a length threshold

use menusync_common::config::ImageMatchConfig;
use menusync_common::events::ImageEntry;
use std::cmp::Reverse;

/// How a candidate matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Prefix,
    Substring,
    Exact,
}

/// Best candidate for one item name
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMatch<'a> {
    pub entry: &'a ImageEntry,
    pub kind: MatchKind,
    /// Matched length in chars (tie-breaker within a tier)
    pub score: usize,
    /// Length of the longer of the two names; shorter wins a score tie
    pub span: usize,
}

/// Lowercase, trim and collapse internal whitespace
pub fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct ImageMatcher {
    config: ImageMatchConfig,
}

impl ImageMatcher {
    pub fn new(config: ImageMatchConfig) -> Self {
        Self { config }
    }

    /// Best candidate for `item_name`, or None if nothing clears a threshold.
    ///
    /// Ties keep the earliest candidate.
    pub fn best_match<'a>(&self, item_name: &str, candidates: &'a [ImageEntry]) -> Option<ImageMatch<'a>> {
        let wanted = normalize(item_name);
        if wanted.is_empty() {
            return None;
        }

        let mut best: Option<ImageMatch<'a>> = None;
        for entry in candidates {
            let candidate = normalize(&entry.name);
            let Some((kind, score)) = self.classify(&wanted, &candidate) else {
                continue;
            };
            let span = wanted.chars().count().max(candidate.chars().count());
            let better = match &best {
                None => true,
                Some(current) => {
                    (kind, score, Reverse(span)) > (current.kind, current.score, Reverse(current.span))
                }
            };
            if better {
                best = Some(ImageMatch {
                    entry,
                    kind,
                    score,
                    span,
                });
            }
        }
        best
    }

    fn classify(&self, wanted: &str, candidate: &str) -> Option<(MatchKind, usize)> {
        if candidate.is_empty() {
            return None;
        }
        if wanted == candidate {
            return Some((MatchKind::Exact, wanted.chars().count()));
        }

        let wanted_len = wanted.chars().count();
        let candidate_len = candidate.chars().count();
        let (shorter, shorter_len, longer, longer_len) = if wanted_len <= candidate_len {
            (wanted, wanted_len, candidate, candidate_len)
        } else {
            (candidate, candidate_len, wanted, wanted_len)
        };

        if longer.contains(shorter)
            && shorter_len >= self.config.min_substring_len
            && (shorter_len as f64 / longer_len as f64) >= self.config.min_overlap_ratio
        {
            return Some((MatchKind::Substring, shorter_len));
        }

        let prefix = wanted
            .chars()
            .zip(candidate.chars())
            .take_while(|(a, b)| a == b)
            .count();
        if prefix >= self.config.min_prefix_len {
            return Some((MatchKind::Prefix, prefix));
        }
        None
    }
}
