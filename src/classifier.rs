//! Syntactic classification of branch conditions. When a source line flips
//! from uncovered to covered between two snapshots, the enclosing `if` is
//! located in the file's syntax tree and its condition is bucketed into one
//! of five constraint kinds by substring inspection. The per-kind tallies
//! describe what sort of branches a fuzzer just punched through.

use std::collections::HashMap;

use log::warn;
use tree_sitter::{Node, Tree};

use crate::coverage::FileLineCoverage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    ValCmp,
    BitOpr,
    StrMat,
    ArtOpr,
    CompOpr,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 5] = [
        ConstraintKind::ValCmp,
        ConstraintKind::BitOpr,
        ConstraintKind::StrMat,
        ConstraintKind::ArtOpr,
        ConstraintKind::CompOpr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintKind::ValCmp => "val_cmp",
            ConstraintKind::BitOpr => "bit_opr",
            ConstraintKind::StrMat => "str_mat",
            ConstraintKind::ArtOpr => "art_opr",
            ConstraintKind::CompOpr => "comp_opr",
        }
    }

    fn index(self) -> usize {
        match self {
            ConstraintKind::ValCmp => 0,
            ConstraintKind::BitOpr => 1,
            ConstraintKind::StrMat => 2,
            ConstraintKind::ArtOpr => 3,
            ConstraintKind::CompOpr => 4,
        }
    }
}

/// Per-kind tally. Also the shape of the per-fuzzer accumulated score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FuzzerScore {
    counts: [f64; 5],
}

impl FuzzerScore {
    pub fn get(&self, kind: ConstraintKind) -> f64 {
        self.counts[kind.index()]
    }

    pub fn add(&mut self, kind: ConstraintKind, value: f64) {
        self.counts[kind.index()] += value;
    }

    pub fn set(&mut self, kind: ConstraintKind, value: f64) {
        self.counts[kind.index()] = value;
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

impl std::fmt::Display for FuzzerScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for kind in ConstraintKind::ALL {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", kind.as_str(), self.get(kind))?;
            first = false;
        }
        Ok(())
    }
}

/// Buckets a condition's source text, first match wins.
pub fn classify_condition(condition: Node<'_>, source: &[u8]) -> ConstraintKind {
    let text = condition.utf8_text(source).unwrap_or_default();

    if ["strcmp", "strstr", "strncmp", "memcmp", "\"", "'"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        return ConstraintKind::StrMat;
    }
    if ["+", "-", "*", "/", "%"].iter().any(|op| text.contains(op)) {
        return ConstraintKind::ArtOpr;
    }
    if ["&", "|", "^", "~", "<<", ">>"]
        .iter()
        .any(|op| text.contains(op))
    {
        return ConstraintKind::BitOpr;
    }
    if ["==", "!=", ">", "<", ">=", "<="]
        .iter()
        .any(|op| text.contains(op))
    {
        return ConstraintKind::ValCmp;
    }
    ConstraintKind::CompOpr
}

/// First preorder node starting on `line` (1-based) whose kind ends in
/// `_statement` but is not itself an `if_statement`.
pub fn find_statement_at_line(tree: &Tree, line: usize) -> Option<Node<'_>> {
    let mut cursor = tree.root_node().walk();
    loop {
        let node = cursor.node();
        if node.start_position().row + 1 == line
            && node.kind() != "if_statement"
            && node.kind().ends_with("_statement")
        {
            return Some(node);
        }

        if cursor.goto_first_child() {
            continue;
        }
        if cursor.goto_next_sibling() {
            continue;
        }
        loop {
            if !cursor.goto_parent() {
                return None;
            }
            if cursor.goto_next_sibling() {
                break;
            }
        }
    }
}

pub fn nearest_if_statement(node: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = Some(node);
    while let Some(node) = cursor {
        if node.kind() == "if_statement" {
            return Some(node);
        }
        cursor = node.parent();
    }
    None
}

/// Condition child of an `if`: a parenthesized expression (C) or condition
/// clause (C++).
pub fn if_condition(if_node: Node<'_>) -> Option<Node<'_>> {
    for i in 0..if_node.child_count() {
        let child = if_node.child(i)?;
        if child.kind() == "parenthesized_expression" || child.kind() == "condition_clause" {
            return Some(child);
        }
    }
    None
}

/// Body of an `if`: its first `*_statement` child.
pub fn if_body(if_node: Node<'_>) -> Option<Node<'_>> {
    for i in 0..if_node.child_count() {
        let child = if_node.child(i)?;
        if child.kind().ends_with("_statement") {
            return Some(child);
        }
    }
    None
}

/// Diffs two line-coverage snapshots and classifies every newly covered
/// branch body. Only lines inside the `if`'s own body count, which keeps
/// `else` branches from being credited to the condition that guards the
/// other arm; after one hit the scan jumps past the whole `if` so nested
/// lines of the same structure are not double counted.
pub fn calculate_fuzzer_score(
    current: &[FileLineCoverage],
    previous: &[FileLineCoverage],
    trees: &HashMap<String, Tree>,
    sources: &HashMap<String, Vec<u8>>,
) -> FuzzerScore {
    let mut score = FuzzerScore::default();

    for (file_pos, cur_file) in current.iter().enumerate() {
        let prev_file = previous
            .get(file_pos)
            .filter(|p| p.file == cur_file.file)
            .or_else(|| previous.iter().find(|p| p.file == cur_file.file));
        let Some(prev_file) = prev_file else {
            continue;
        };
        let (Some(tree), Some(source)) =
            (trees.get(&cur_file.file), sources.get(&cur_file.file))
        else {
            continue;
        };

        let total = cur_file.lines.len().min(prev_file.lines.len());
        let mut index = 0;
        while index < total {
            let cur_line = &cur_file.lines[index];
            let prev_line = &prev_file.lines[index];
            let line_number = cur_line.line_number as usize;

            if prev_line.line_number != cur_line.line_number || index + 1 != line_number {
                warn!(
                    "line {} of {} does not match between snapshots",
                    cur_line.line_number, cur_file.file
                );
                break;
            }

            if prev_line.count == 0 && cur_line.count > 0 {
                if let Some(if_node) =
                    find_statement_at_line(tree, line_number).and_then(nearest_if_statement)
                {
                    if let Some(body) = if_body(if_node) {
                        let begin = body.start_position().row + 1;
                        let end = body.end_position().row + 1;
                        if (begin..=end).contains(&line_number) {
                            if let Some(condition) = if_condition(if_node) {
                                score.add(classify_condition(condition, source), 1.0);
                            }
                        }
                    }
                    index = if_node.end_position().row + 1;
                    continue;
                }
            }
            index += 1;
        }
    }
    score
}

/// Classifies every `if` condition whose statement starts inside the given
/// 1-based line range. Used to build the kind profile of a whole function.
pub fn classify_function_conditions(
    tree: &Tree,
    source: &[u8],
    line_begin: i64,
    line_end: i64,
) -> FuzzerScore {
    let mut profile = FuzzerScore::default();
    let mut cursor = tree.root_node().walk();
    loop {
        let node = cursor.node();
        if node.kind() == "if_statement" {
            let line = node.start_position().row as i64 + 1;
            if line >= line_begin && line <= line_end {
                if let Some(condition) = if_condition(node) {
                    profile.add(classify_condition(condition, source), 1.0);
                }
            }
        }

        if cursor.goto_first_child() {
            continue;
        }
        if cursor.goto_next_sibling() {
            continue;
        }
        let mut done = false;
        loop {
            if !cursor.goto_parent() {
                done = true;
                break;
            }
            if cursor.goto_next_sibling() {
                break;
            }
        }
        if done {
            break;
        }
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::LineCov;

    const CODE: &str = "\
#include <string.h>

int check(const char *x, int v) {
  if (strcmp(x, \"abc\") == 0) {
    return 1;
  }
  if (v + 1 > 10) {
    return 2;
  }
  if (v & 0x7) {
    return 3;
  }
  if (v > 42) {
    return 4;
  }
  return 0;
}
";

    fn parse(code: &str) -> Tree {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_cpp::LANGUAGE.into())
            .unwrap();
        parser.parse(code, None).unwrap()
    }

    fn file_cov(file: &str, code: &str, covered: &[u64]) -> FileLineCoverage {
        FileLineCoverage {
            file: file.to_string(),
            lines: code
                .lines()
                .enumerate()
                .map(|(i, text)| LineCov {
                    line_number: i as u64 + 1,
                    count: if covered.contains(&(i as u64 + 1)) { 1 } else { 0 },
                    code: text.to_string(),
                })
                .collect(),
        }
    }

    fn fixtures(covered: &[u64]) -> (
        Vec<FileLineCoverage>,
        Vec<FileLineCoverage>,
        HashMap<String, Tree>,
        HashMap<String, Vec<u8>>,
    ) {
        let file = "/src/check.c";
        let current = vec![file_cov(file, CODE, covered)];
        let previous = vec![file_cov(file, CODE, &[])];
        let trees = HashMap::from([(file.to_string(), parse(CODE))]);
        let sources = HashMap::from([(file.to_string(), CODE.as_bytes().to_vec())]);
        (current, previous, trees, sources)
    }

    #[test]
    fn condition_buckets_in_fixed_order() {
        let tree = parse(CODE);
        let source = CODE.as_bytes();

        let expectations = [
            (4, ConstraintKind::StrMat),
            (7, ConstraintKind::ArtOpr),
            (10, ConstraintKind::BitOpr),
            (13, ConstraintKind::ValCmp),
        ];
        for (line, expected) in expectations {
            let stmt = find_statement_at_line(&tree, line + 1).unwrap();
            let if_node = nearest_if_statement(stmt).unwrap();
            let condition = if_condition(if_node).unwrap();
            assert_eq!(
                classify_condition(condition, source),
                expected,
                "if at line {line}"
            );
        }
    }

    #[test]
    fn bare_call_condition_is_compound() {
        let code = "int f(int v) {\n  if (ready(v)) {\n    return 1;\n  }\n  return 0;\n}\n";
        let tree = parse(code);
        let stmt = find_statement_at_line(&tree, 3).unwrap();
        let if_node = nearest_if_statement(stmt).unwrap();
        let condition = if_condition(if_node).unwrap();
        assert_eq!(
            classify_condition(condition, code.as_bytes()),
            ConstraintKind::CompOpr
        );
    }

    #[test]
    fn statement_lookup_skips_if_statements() {
        let tree = parse(CODE);
        let stmt = find_statement_at_line(&tree, 5).unwrap();
        assert_eq!(stmt.kind(), "return_statement");
        assert!(find_statement_at_line(&tree, 2).is_none());
    }

    #[test]
    fn newly_covered_branch_bodies_are_classified() {
        let (current, previous, trees, sources) = fixtures(&[5, 8]);
        let score = calculate_fuzzer_score(&current, &previous, &trees, &sources);
        assert_eq!(score.get(ConstraintKind::StrMat), 1.0);
        assert_eq!(score.get(ConstraintKind::ArtOpr), 1.0);
        assert_eq!(score.total(), 2.0);
    }

    #[test]
    fn lines_covered_in_both_snapshots_do_not_count() {
        let file = "/src/check.c";
        let current = vec![file_cov(file, CODE, &[5, 8])];
        let previous = vec![file_cov(file, CODE, &[5])];
        let trees = HashMap::from([(file.to_string(), parse(CODE))]);
        let sources = HashMap::from([(file.to_string(), CODE.as_bytes().to_vec())]);

        let score = calculate_fuzzer_score(&current, &previous, &trees, &sources);
        assert_eq!(score.get(ConstraintKind::StrMat), 0.0);
        assert_eq!(score.get(ConstraintKind::ArtOpr), 1.0);
    }

    #[test]
    fn lines_outside_any_if_score_nothing() {
        let (current, previous, trees, sources) = fixtures(&[16]);
        let score = calculate_fuzzer_score(&current, &previous, &trees, &sources);
        assert_eq!(score.total(), 0.0);
    }

    #[test]
    fn unknown_files_are_ignored() {
        let (mut current, previous, trees, sources) = fixtures(&[5]);
        current[0].file = "/src/other.c".to_string();
        let score = calculate_fuzzer_score(&current, &previous, &trees, &sources);
        assert_eq!(score.total(), 0.0);
    }

    #[test]
    fn function_kind_profile_counts_every_if_in_range() {
        let tree = parse(CODE);
        let profile = classify_function_conditions(&tree, CODE.as_bytes(), 3, 17);
        assert_eq!(profile.get(ConstraintKind::StrMat), 1.0);
        assert_eq!(profile.get(ConstraintKind::ArtOpr), 1.0);
        assert_eq!(profile.get(ConstraintKind::BitOpr), 1.0);
        assert_eq!(profile.get(ConstraintKind::ValCmp), 1.0);
        assert_eq!(profile.get(ConstraintKind::CompOpr), 0.0);

        // Range covering only the first two ifs.
        let partial = classify_function_conditions(&tree, CODE.as_bytes(), 3, 9);
        assert_eq!(partial.total(), 2.0);
    }

    #[test]
    fn out_of_range_functions_profile_empty() {
        let tree = parse(CODE);
        let profile = classify_function_conditions(&tree, CODE.as_bytes(), -1, -1);
        assert_eq!(profile.total(), 0.0);
    }
}
