//! Per-fuzzer ranking adjustments. Each fuzzer accumulates an exponentially
//! decayed score of the constraint kinds it has recently broken through;
//! groups dominated by kinds a fuzzer already masters are pushed down its
//! ranking so it spends effort where it is historically weak.

use std::cmp::Ordering;
use std::collections::HashMap;

use tree_sitter::Tree;

use crate::analysis::ConstraintGroup;
use crate::calltree::CallTree;
use crate::classifier::{classify_function_conditions, ConstraintKind, FuzzerScore};

/// Weight of the previous accumulated score when folding in a new report.
pub const SCORE_DECAY: f64 = 0.5;

/// Folds a fresh report tally into the accumulated score. Without a prior
/// score the tally is taken as-is.
pub fn update_score(fresh: &FuzzerScore, prior: Option<&FuzzerScore>) -> FuzzerScore {
    match prior {
        None => *fresh,
        Some(prior) => {
            let mut merged = FuzzerScore::default();
            for kind in ConstraintKind::ALL {
                merged.set(
                    kind,
                    SCORE_DECAY * prior.get(kind) + (1.0 - SCORE_DECAY) * fresh.get(kind),
                );
            }
            merged
        }
    }
}

/// Kind profile of one group: every member constraint contributes the `if`
/// conditions found inside its function's source range.
fn group_kind_profile(
    group: &ConstraintGroup,
    tree: &CallTree,
    trees: &HashMap<String, Tree>,
    sources: &HashMap<String, Vec<u8>>,
) -> FuzzerScore {
    let mut profile = FuzzerScore::default();
    for constraint in &group.constraints {
        let function = &tree.node(constraint.node).profile;
        let (Some(syntax), Some(source)) = (
            trees.get(&function.source_file),
            sources.get(&function.source_file),
        ) else {
            continue;
        };
        let counts =
            classify_function_conditions(syntax, source, function.line_begin, function.line_end);
        for kind in ConstraintKind::ALL {
            profile.add(kind, counts.get(kind));
        }
    }
    profile
}

/// Reorders a ranked group list for one fuzzer: penalty per group is the dot
/// product of the fuzzer's accumulated score with the group's kind profile,
/// and groups sort by ascending penalty, keeping higher stored importance
/// first among equals. The output is always a permutation of the input.
pub fn sort_constraint_groups(
    groups: Vec<ConstraintGroup>,
    score: &FuzzerScore,
    tree: &CallTree,
    trees: &HashMap<String, Tree>,
    sources: &HashMap<String, Vec<u8>>,
) -> Vec<ConstraintGroup> {
    let mut penalized: Vec<(f64, ConstraintGroup)> = groups
        .into_iter()
        .map(|group| {
            let profile = group_kind_profile(&group, tree, trees, sources);
            let penalty: f64 = ConstraintKind::ALL
                .iter()
                .map(|&kind| score.get(kind) * profile.get(kind))
                .sum();
            (penalty, group)
        })
        .collect();

    penalized.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.1.total_importance
                    .partial_cmp(&a.1.total_importance)
                    .unwrap_or(Ordering::Equal)
            })
    });
    penalized.into_iter().map(|(_, group)| group).collect()
}
