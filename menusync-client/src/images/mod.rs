//! Image result matching and caching

pub mod cache;
pub mod matcher;

pub use cache::ImageUrlCache;
pub use matcher::{normalize, ImageMatch, ImageMatcher, MatchKind};
