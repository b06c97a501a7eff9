//! Detection-to-identity assignment.
//!
//! Two strategies: per-detection nearest neighbour (`MIN_DIST`) and a
//! globally minimal one-to-one assignment solved with the Hungarian
//! algorithm (`HUNGARIAN`), which keeps two faces in the same frame from
//! collapsing onto one identity.

use crate::types::{Embedding, GalleryEntry, Identity, MatchResult, MAX_DISTANCE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Matching strategy, chosen once at construction time.
///
/// Deserializes through [`FromStr`], so config files accept the same
/// case-insensitive names as the command line and environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum MatchAlgorithm {
    /// Nearest gallery entry for every detection independently.
    #[serde(rename = "MIN_DIST")]
    Greedy,
    /// Minimum total distance, at most one detection per identity.
    #[default]
    #[serde(rename = "HUNGARIAN")]
    Optimal,
}

impl MatchAlgorithm {
    /// Strategy object implementing this algorithm.
    pub fn matcher(self) -> Box<dyn Matcher + Send + Sync> {
        match self {
            MatchAlgorithm::Greedy => Box::new(GreedyMatcher),
            MatchAlgorithm::Optimal => Box::new(OptimalMatcher),
        }
    }
}

impl fmt::Display for MatchAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchAlgorithm::Greedy => f.write_str("MIN_DIST"),
            MatchAlgorithm::Optimal => f.write_str("HUNGARIAN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown match algorithm '{0}' (expected HUNGARIAN or MIN_DIST)")]
pub struct ParseAlgorithmError(String);

impl TryFrom<String> for MatchAlgorithm {
    type Error = ParseAlgorithmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for MatchAlgorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MIN_DIST" | "GREEDY" => Ok(MatchAlgorithm::Greedy),
            "HUNGARIAN" | "OPTIMAL" => Ok(MatchAlgorithm::Optimal),
            _ => Err(ParseAlgorithmError(s.to_string())),
        }
    }
}

/// Strategy for assigning probe embeddings to gallery identities.
///
/// Implementations return exactly one result per probe, in probe order.
pub trait Matcher {
    fn assign(&self, probes: &[Embedding], gallery: &[GalleryEntry], threshold: f32) -> Vec<MatchResult>;
}

/// Match `detections` against `gallery` with the given algorithm.
pub fn match_embeddings(
    detections: &[Embedding],
    gallery: &[GalleryEntry],
    threshold: f32,
    algo: MatchAlgorithm,
) -> Vec<MatchResult> {
    match algo {
        MatchAlgorithm::Greedy => GreedyMatcher.assign(detections, gallery, threshold),
        MatchAlgorithm::Optimal => OptimalMatcher.assign(detections, gallery, threshold),
    }
}

/// Nearest-neighbour matcher. Ties go to the first gallery entry.
pub struct GreedyMatcher;

impl Matcher for GreedyMatcher {
    fn assign(&self, probes: &[Embedding], gallery: &[GalleryEntry], threshold: f32) -> Vec<MatchResult> {
        probes
            .iter()
            .enumerate()
            .map(|(i, probe)| {
                let mut best: Option<(usize, f32)> = None;
                for (j, entry) in gallery.iter().enumerate() {
                    let distance = probe.cosine_distance(&entry.embedding);
                    if best.map_or(true, |(_, d)| distance < d) {
                        best = Some((j, distance));
                    }
                }

                match best {
                    Some((j, distance)) if distance <= threshold => MatchResult {
                        detection_index: i,
                        identity: Identity::Known(gallery[j].label.clone()),
                        distance,
                    },
                    Some((_, distance)) => MatchResult::unknown(i, distance),
                    None => MatchResult::unknown(i, MAX_DISTANCE),
                }
            })
            .collect()
    }
}

/// One-to-one matcher over distinct labels.
///
/// Each label's cost is its closest sample. Assignments above the threshold
/// are downgraded to unknown after solving; detections left without an
/// identity are unknown and report their nearest distance.
pub struct OptimalMatcher;

impl Matcher for OptimalMatcher {
    fn assign(&self, probes: &[Embedding], gallery: &[GalleryEntry], threshold: f32) -> Vec<MatchResult> {
        let labels = distinct_labels(gallery);
        if labels.is_empty() {
            return (0..probes.len())
                .map(|i| MatchResult::unknown(i, MAX_DISTANCE))
                .collect();
        }

        let column: HashMap<&str, usize> = labels.iter().enumerate().map(|(c, l)| (*l, c)).collect();
        let costs: Vec<Vec<f32>> = probes
            .iter()
            .map(|probe| {
                let mut row = vec![MAX_DISTANCE; labels.len()];
                for entry in gallery {
                    let c = column[entry.label.as_str()];
                    row[c] = row[c].min(probe.cosine_distance(&entry.embedding));
                }
                row
            })
            .collect();

        let assignment = min_cost_assignment(&costs);

        costs
            .iter()
            .zip(assignment)
            .enumerate()
            .map(|(i, (row, assigned))| match assigned {
                Some(c) if row[c] <= threshold => MatchResult {
                    detection_index: i,
                    identity: Identity::Known(labels[c].to_string()),
                    distance: row[c],
                },
                Some(c) => MatchResult::unknown(i, row[c]),
                None => {
                    let nearest = row.iter().copied().fold(MAX_DISTANCE, f32::min);
                    MatchResult::unknown(i, nearest)
                }
            })
            .collect()
    }
}

/// Distinct labels in first-seen gallery order.
fn distinct_labels(gallery: &[GalleryEntry]) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::new();
    for entry in gallery {
        if !labels.contains(&entry.label.as_str()) {
            labels.push(&entry.label);
        }
    }
    labels
}

/// Rectangular minimum-cost assignment (Hungarian algorithm with potentials).
///
/// Returns, per row, the assigned column. When there are more rows than
/// columns the surplus rows get `None`.
fn min_cost_assignment(costs: &[Vec<f32>]) -> Vec<Option<usize>> {
    let rows = costs.len();
    let cols = costs.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return vec![None; rows];
    }

    if rows > cols {
        let transposed: Vec<Vec<f32>> = (0..cols)
            .map(|c| (0..rows).map(|r| costs[r][c]).collect())
            .collect();
        let mut by_row = vec![None; rows];
        for (c, r) in min_cost_assignment(&transposed).into_iter().enumerate() {
            if let Some(r) = r {
                by_row[r] = Some(c);
            }
        }
        return by_row;
    }

    let cost = |r: usize, c: usize| -> f64 {
        let v = costs[r][c];
        if v.is_finite() { v as f64 } else { MAX_DISTANCE as f64 }
    };

    // 1-based potentials; column 0 is the virtual start column.
    let mut u = vec![0.0f64; rows + 1];
    let mut v = vec![0.0f64; cols + 1];
    let mut owner = vec![0usize; cols + 1];
    let mut way = vec![0usize; cols + 1];

    for r in 1..=rows {
        owner[0] = r;
        let mut j0 = 0usize;
        let mut min_v = vec![f64::INFINITY; cols + 1];
        let mut used = vec![false; cols + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=cols {
                if used[j] {
                    continue;
                }
                let reduced = cost(i0 - 1, j - 1) - u[i0] - v[j];
                if reduced < min_v[j] {
                    min_v[j] = reduced;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }

            for j in 0..=cols {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }

            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // Augment along the alternating path.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; rows];
    for c in 1..=cols {
        if owner[c] != 0 {
            assignment[owner[c] - 1] = Some(c - 1);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn entry(label: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry { label: label.into(), embedding: emb(values) }
    }

    fn at_angle(degrees: f32) -> Embedding {
        let r = degrees.to_radians();
        emb(&[r.cos(), r.sin()])
    }

    fn alice_bob() -> Vec<GalleryEntry> {
        vec![entry("Alice", &[1.0, 0.0, 0.0]), entry("Bob", &[0.0, 1.0, 0.0])]
    }

    #[test]
    fn test_end_to_end_known_and_unknown() {
        let probes = vec![emb(&[1.0, 0.05, 0.0]), emb(&[0.0, 0.0, 1.0])];
        for algo in [MatchAlgorithm::Greedy, MatchAlgorithm::Optimal] {
            let results = match_embeddings(&probes, &alice_bob(), 0.6, algo);
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].identity, Identity::Known("Alice".into()));
            assert!(results[0].distance < 0.01, "{algo}: {}", results[0].distance);
            assert_eq!(results[1].identity, Identity::Unknown);
            assert!((results[1].distance - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_one_result_per_detection_in_order() {
        let probes: Vec<Embedding> = (0..7).map(|i| at_angle(i as f32 * 13.0)).collect();
        let gallery = vec![
            GalleryEntry { label: "a".into(), embedding: at_angle(0.0) },
            GalleryEntry { label: "b".into(), embedding: at_angle(45.0) },
        ];
        for algo in [MatchAlgorithm::Greedy, MatchAlgorithm::Optimal] {
            let results = match_embeddings(&probes, &gallery, 0.6, algo);
            assert_eq!(results.len(), probes.len());
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.detection_index, i);
                assert!((0.0..=MAX_DISTANCE).contains(&r.distance));
            }
        }
    }

    #[test]
    fn test_empty_gallery_all_unknown() {
        let probes = vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0])];
        for algo in [MatchAlgorithm::Greedy, MatchAlgorithm::Optimal] {
            let results = match_embeddings(&probes, &[], 2.0, algo);
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r.identity.is_unknown()));
        }
    }

    #[test]
    fn test_no_probes() {
        assert!(match_embeddings(&[], &alice_bob(), 0.6, MatchAlgorithm::Optimal).is_empty());
    }

    #[test]
    fn test_greedy_below_threshold_is_known() {
        let gallery = vec![
            GalleryEntry { label: "a".into(), embedding: at_angle(0.0) },
            GalleryEntry { label: "b".into(), embedding: at_angle(90.0) },
        ];
        let probe = at_angle(20.0);
        let d = probe.cosine_distance(&gallery[0].embedding);
        let results = GreedyMatcher.assign(&[probe], &gallery, d + 1e-4);
        assert_eq!(results[0].identity, Identity::Known("a".into()));

        let results = GreedyMatcher.assign(&[at_angle(20.0)], &gallery, d - 1e-3);
        assert!(results[0].identity.is_unknown());
    }

    #[test]
    fn test_greedy_tie_prefers_first_entry() {
        let gallery = vec![entry("first", &[1.0, 0.0]), entry("second", &[1.0, 0.0])];
        let results = GreedyMatcher.assign(&[emb(&[1.0, 0.0])], &gallery, 0.5);
        assert_eq!(results[0].identity, Identity::Known("first".into()));
    }

    #[test]
    fn test_greedy_collapses_optimal_does_not() {
        let gallery = vec![
            GalleryEntry { label: "Alice".into(), embedding: at_angle(0.0) },
            GalleryEntry { label: "Bob".into(), embedding: at_angle(90.0) },
        ];
        let probes = vec![at_angle(0.0), at_angle(40.0)];

        let greedy = GreedyMatcher.assign(&probes, &gallery, 0.6);
        assert_eq!(greedy[0].identity, Identity::Known("Alice".into()));
        assert_eq!(greedy[1].identity, Identity::Known("Alice".into()));

        let optimal = OptimalMatcher.assign(&probes, &gallery, 0.6);
        assert_eq!(optimal[0].identity, Identity::Known("Alice".into()));
        assert_eq!(optimal[1].identity, Identity::Known("Bob".into()));
    }

    #[test]
    fn test_optimal_never_repeats_a_label() {
        let gallery = vec![
            GalleryEntry { label: "a".into(), embedding: at_angle(0.0) },
            GalleryEntry { label: "a".into(), embedding: at_angle(10.0) },
            GalleryEntry { label: "b".into(), embedding: at_angle(60.0) },
            GalleryEntry { label: "c".into(), embedding: at_angle(120.0) },
        ];
        let probes: Vec<Embedding> = [1.0, 3.0, 5.0, 8.0, 62.0].iter().map(|&a| at_angle(a)).collect();
        let results = OptimalMatcher.assign(&probes, &gallery, 2.0);

        let mut seen = Vec::new();
        for r in &results {
            if let Identity::Known(label) = &r.identity {
                assert!(!seen.contains(label), "label {label} assigned twice");
                seen.push(label.clone());
            }
        }
        // Three identities, five faces: two must stay unknown.
        assert_eq!(results.iter().filter(|r| r.identity.is_unknown()).count(), 2);
    }

    #[test]
    fn test_optimal_uses_closest_sample_per_label() {
        let gallery = vec![
            GalleryEntry { label: "a".into(), embedding: at_angle(80.0) },
            GalleryEntry { label: "a".into(), embedding: at_angle(1.0) },
        ];
        let results = OptimalMatcher.assign(&[at_angle(0.0)], &gallery, 0.01);
        assert_eq!(results[0].identity, Identity::Known("a".into()));
        assert!(results[0].distance < 1e-3);
    }

    #[test]
    fn test_optimal_surplus_detection_reports_nearest_distance() {
        let gallery = vec![GalleryEntry { label: "a".into(), embedding: at_angle(0.0) }];
        let results = OptimalMatcher.assign(&[at_angle(0.0), at_angle(30.0)], &gallery, 0.6);
        assert_eq!(results[0].identity, Identity::Known("a".into()));
        assert!(results[1].identity.is_unknown());
        let expected = 1.0 - 30.0f32.to_radians().cos();
        assert!((results[1].distance - expected).abs() < 1e-4);
    }

    #[test]
    fn test_min_cost_assignment_square() {
        let costs = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        // Optimal: row0->1, row1->0, row2->2, total 1 + 2 + 2 = 5.
        assert_eq!(min_cost_assignment(&costs), vec![Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_min_cost_assignment_matches_brute_force() {
        let costs = vec![
            vec![0.9, 0.1, 0.5, 0.7],
            vec![0.2, 0.3, 0.8, 0.4],
            vec![0.6, 0.4, 0.3, 0.1],
        ];
        let assignment = min_cost_assignment(&costs);
        let total: f32 = assignment
            .iter()
            .enumerate()
            .map(|(r, c)| costs[r][c.expect("every row assigned")])
            .sum();

        let mut best = f32::INFINITY;
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    if a != b && b != c && a != c {
                        best = best.min(costs[0][a] + costs[1][b] + costs[2][c]);
                    }
                }
            }
        }
        assert!((total - best).abs() < 1e-6, "total {total}, best {best}");
    }

    #[test]
    fn test_min_cost_assignment_more_rows_than_columns() {
        let costs = vec![vec![0.5], vec![0.1], vec![0.9]];
        assert_eq!(min_cost_assignment(&costs), vec![None, Some(0), None]);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("HUNGARIAN".parse::<MatchAlgorithm>(), Ok(MatchAlgorithm::Optimal));
        assert_eq!("min_dist".parse::<MatchAlgorithm>(), Ok(MatchAlgorithm::Greedy));
        assert!("nearest".parse::<MatchAlgorithm>().is_err());
        assert_eq!(MatchAlgorithm::Greedy.to_string(), "MIN_DIST");
    }

    #[test]
    fn test_deserialize_algorithm_ignores_case() {
        use serde::de::value::{Error as ValueError, StrDeserializer};
        use serde::de::IntoDeserializer;

        let parse = |name: &'static str| {
            let de: StrDeserializer<'_, ValueError> = name.into_deserializer();
            MatchAlgorithm::deserialize(de)
        };
        assert_eq!(parse("min_dist").unwrap(), MatchAlgorithm::Greedy);
        assert_eq!(parse("MIN_DIST").unwrap(), MatchAlgorithm::Greedy);
        assert_eq!(parse("Hungarian").unwrap(), MatchAlgorithm::Optimal);
        assert_eq!(parse("optimal").unwrap(), MatchAlgorithm::Optimal);
        assert!(parse("nearest").is_err());
    }
}
