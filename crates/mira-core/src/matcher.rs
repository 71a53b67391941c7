//! Nearest-identity matching of a query encoding against the gallery.

use crate::gallery::GalleryEntry;
use crate::types::{Encoding, UNKNOWN_LABEL};

/// Default maximum distance for a positive identification.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a query encoding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// The nearest entry was within the threshold.
    Matched { name: String, distance: f32 },
    /// Empty gallery, or the nearest entry was farther than the threshold.
    Unknown,
}

impl MatchResult {
    /// Identity label, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        match self {
            MatchResult::Matched { name, .. } => name,
            MatchResult::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Matched { distance, .. } => Some(*distance),
            MatchResult::Unknown => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// Strategy for comparing a query encoding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Encoding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Minimum Euclidean distance matcher.
///
/// Every entry is visited. When several entries sit at exactly the same
/// minimum distance the first one in gallery order wins. Entries whose length
/// differs from the query are never selected.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Encoding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            // Entries of another dimensionality are not candidates.
            let Some(dist) = query.distance(&entry.encoding) else {
                continue;
            };
            // Strict `<` keeps the earliest entry on ties; NaN never wins.
            let better = match best {
                None => !dist.is_nan(),
                Some((_, best_dist)) => dist < best_dist,
            };
            if better {
                best = Some((i, dist));
            }
        }

        match best {
            Some((idx, dist)) if dist <= threshold => {
                tracing::trace!(name = %gallery[idx].name, distance = dist, "gallery match");
                MatchResult::Matched {
                    name: gallery[idx].name.clone(),
                    distance: dist,
                }
            }
            _ => MatchResult::Unknown,
        }
    }
}

/// Match `query` against `gallery` with the default [`EuclideanMatcher`].
pub fn match_encoding(query: &Encoding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
    EuclideanMatcher.compare(query, gallery, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry::new(name, Encoding::new(values))
    }

    #[test]
    fn test_identical_vector_matches_at_zero() {
        let e_a = vec![0.1, 0.2, 0.3, 0.4];
        let gallery = vec![entry("Alice", e_a.clone())];

        let result = match_encoding(&Encoding::new(e_a), &gallery, 0.6);
        assert_eq!(
            result,
            MatchResult::Matched { name: "Alice".into(), distance: 0.0 }
        );
    }

    #[test]
    fn test_distant_vector_is_unknown() {
        let gallery = vec![entry("Alice", vec![0.0, 0.0])];
        // Distance 0.9 from Alice.
        let query = Encoding::new(vec![0.9, 0.0]);

        let result = match_encoding(&query, &gallery, 0.6);
        assert_eq!(result, MatchResult::Unknown);
        assert_eq!(result.label(), UNKNOWN_LABEL);
        assert_eq!(result.distance(), None);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = vec![entry("Alice", vec![0.0, 0.0])];
        let query = Encoding::new(vec![0.5, 0.0]);
        assert!(match_encoding(&query, &gallery, 0.5).is_match());
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let query = Encoding::new(vec![1.0, 2.0]);
        for t in [0.0, 0.6, 10.0, f32::MAX] {
            assert_eq!(match_encoding(&query, &[], t), MatchResult::Unknown);
        }
    }

    #[test]
    fn test_nearest_entry_wins_regardless_of_position() {
        let gallery = vec![
            entry("decoy1", vec![0.0, 1.0, 0.0]),
            entry("decoy2", vec![0.0, 0.0, 1.0]),
            entry("match", vec![1.0, 0.0, 0.0]),
        ];
        let result = match_encoding(&Encoding::new(vec![0.9, 0.0, 0.0]), &gallery, 0.6);
        assert_eq!(result.label(), "match");
        assert!((result.distance().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_tie_resolves_to_first_in_gallery_order() {
        let gallery = vec![
            entry("Bob", vec![1.0, 0.0]),
            entry("Carol", vec![-1.0, 0.0]),
        ];
        let result = match_encoding(&Encoding::new(vec![0.0, 0.0]), &gallery, 2.0);
        assert_eq!(result.label(), "Bob");
    }

    #[test]
    fn test_repeated_calls_are_deterministic() {
        let gallery = vec![
            entry("Bob", vec![0.3, 0.1]),
            entry("Carol", vec![0.2, 0.5]),
            entry("Bob", vec![0.35, 0.12]),
        ];
        let query = Encoding::new(vec![0.31, 0.2]);
        let first = match_encoding(&query, &gallery, 0.6);
        for _ in 0..10 {
            assert_eq!(match_encoding(&query, &gallery, 0.6), first);
        }
    }

    #[test]
    fn test_threshold_monotonicity() {
        let gallery = vec![
            entry("Bob", vec![0.0, 0.0]),
            entry("Carol", vec![1.0, 1.0]),
        ];
        let query = Encoding::new(vec![0.3, 0.2]);
        let at_t = match_encoding(&query, &gallery, 0.4);
        assert!(at_t.is_match());
        for t in [0.5, 0.6, 1.0, 5.0] {
            let wider = match_encoding(&query, &gallery, t);
            assert_eq!(wider.label(), at_t.label());
            assert_eq!(wider.distance(), at_t.distance());
        }
    }

    #[test]
    fn test_nan_entry_never_selected() {
        let gallery = vec![
            entry("broken", vec![f32::NAN, 0.0]),
            entry("Alice", vec![0.1, 0.0]),
        ];
        let result = match_encoding(&Encoding::new(vec![0.0, 0.0]), &gallery, 0.6);
        assert_eq!(result.label(), "Alice");
    }

    #[test]
    fn test_mismatched_dimension_never_matches() {
        let gallery = vec![entry("Alice", vec![1.0, 0.0])];
        let query = Encoding::new(vec![1.0, 0.0, 50.0]);
        assert_eq!(match_encoding(&query, &gallery, 0.6), MatchResult::Unknown);

        let mixed = vec![entry("Alice", vec![1.0, 0.0]), entry("Bob", vec![1.0, 0.0, 49.9])];
        let result = match_encoding(&query, &mixed, 0.6);
        assert_eq!(result.label(), "Bob");
    }
}
