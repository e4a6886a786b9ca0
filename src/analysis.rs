//! Importance scoring over the call tree. Every covered non-root node gets a
//! five-factor score; the hottest functions are dropped outright since a
//! fuzzer gains nothing from hammering code it already reaches constantly.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::calltree::{CallTree, NodeId};
use crate::cdf::Cdf;
use crate::coverage::ProgramCoverageData;

pub const MAX_CONSTRAINTS: usize = 30;

/// Hit-frequency fraction at and above which a node is considered too hot to
/// be a useful target.
pub const HOT_CUTOFF: f64 = 0.3;

const W_HIT_FREQ: f64 = 0.10;
const W_RARITY: f64 = 0.20;
const W_DEPTH: f64 = 0.20;
const W_BRANCH: f64 = 0.35;
const W_COMPLEXITY: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct ImportantConstraint {
    pub node: NodeId,
    pub hit_freq_weight: f64,
    pub rarity_weight: f64,
    pub depth_weight: f64,
    pub branch_weight: f64,
    pub complexity_weight: f64,
    pub importance_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintGroup {
    pub group_id: String,
    #[serde(rename = "function")]
    pub main_function: String,
    pub file_name: String,
    #[serde(rename = "importance")]
    pub total_importance: f64,
    /// One entry per member constraint: function names from the root down to
    /// the constraint's parent.
    pub paths: Vec<Vec<String>>,
    #[serde(skip)]
    pub constraints: Vec<ImportantConstraint>,
}

/// Scores every eligible node against a coverage snapshot and returns the
/// top constraints, best first. The coverage snapshot is expected to list
/// uncovered functions with count 0; min/max normalization runs over all
/// entries, so in practice min is 0 and the hit frequency degenerates to
/// count/max.
pub fn identify_important_constraints(
    tree: &CallTree,
    coverage: &ProgramCoverageData,
) -> Vec<ImportantConstraint> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    let mut cdf = Cdf::new();
    let mut min_hits = u64::MAX;
    let mut max_hits = u64::MIN;
    for fc in &coverage.functions {
        counts.insert(fc.name.as_str(), fc.count);
        cdf.add(fc.count as f64);
        min_hits = min_hits.min(fc.count);
        max_hits = max_hits.max(fc.count);
    }

    let max_children = tree.len().saturating_sub(1);
    let mut constraints = Vec::new();

    for id in tree.preorder() {
        if id == CallTree::ROOT {
            continue;
        }
        let node = tree.node(id);
        let count = match counts.get(node.profile.name.as_str()) {
            Some(&count) if count > 0 => count,
            _ => continue,
        };

        let hit_freq_raw = if max_hits > min_hits {
            (count - min_hits) as f64 / (max_hits - min_hits) as f64
        } else {
            0.0
        };
        if hit_freq_raw >= HOT_CUTOFF {
            continue;
        }

        let hit_freq_weight = hit_freq_raw / HOT_CUTOFF;
        let rarity_weight = 1.0 - cdf.cdf_of(count as f64);
        let depth_weight = if tree.max_depth > 0 {
            (tree.depth(id) as f64 / tree.max_depth as f64).sqrt()
        } else {
            0.0
        };
        let branch_weight = if max_children > 0 {
            tree.count_descendants(id) as f64 / max_children as f64
        } else {
            0.0
        };
        let complexity_weight = if tree.max_cyclomatic_complexity > 0 {
            node.profile.cyclomatic_complexity as f64 / tree.max_cyclomatic_complexity as f64
        } else {
            0.0
        };

        let importance_score = W_HIT_FREQ * hit_freq_weight
            + W_RARITY * rarity_weight
            + W_DEPTH * depth_weight
            + W_BRANCH * branch_weight
            + W_COMPLEXITY * complexity_weight;

        constraints.push(ImportantConstraint {
            node: id,
            hit_freq_weight,
            rarity_weight,
            depth_weight,
            branch_weight,
            complexity_weight,
            importance_score,
        });
    }

    constraints.sort_by(|a, b| {
        b.importance_score
            .partial_cmp(&a.importance_score)
            .unwrap_or(Ordering::Equal)
    });
    constraints.truncate(MAX_CONSTRAINTS);
    constraints
}

/// Groups constraints by function name, preserving first-appearance order of
/// the ranked input.
pub fn group_constraints(
    tree: &CallTree,
    constraints: Vec<ImportantConstraint>,
) -> Vec<ConstraintGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, ConstraintGroup> = HashMap::new();

    for constraint in constraints {
        let profile = &tree.node(constraint.node).profile;
        let group = groups
            .entry(profile.name.clone())
            .or_insert_with(|| {
                order.push(profile.name.clone());
                ConstraintGroup {
                    group_id: Uuid::new_v4().to_string(),
                    main_function: profile.name.clone(),
                    file_name: profile.source_file.clone(),
                    total_importance: 0.0,
                    paths: Vec::new(),
                    constraints: Vec::new(),
                }
            });

        group.total_importance += constraint.importance_score;

        let mut path = Vec::new();
        let mut cursor = tree.node(constraint.node).parent;
        while let Some(parent) = cursor {
            path.push(tree.node(parent).profile.name.clone());
            cursor = tree.node(parent).parent;
        }
        path.reverse();
        group.paths.push(path);
        group.constraints.push(constraint);
    }

    order.into_iter().filter_map(|name| groups.remove(&name)).collect()
}

/// Full scoring pass: identify, group, and order groups by their combined
/// importance, best first.
pub fn rank_constraint_groups(
    tree: &CallTree,
    coverage: &ProgramCoverageData,
) -> Vec<ConstraintGroup> {
    let constraints = identify_important_constraints(tree, coverage);
    let mut groups = group_constraints(tree, constraints);
    groups.sort_by(|a, b| {
        b.total_importance
            .partial_cmp(&a.total_importance)
            .unwrap_or(Ordering::Equal)
    });
    groups
}
