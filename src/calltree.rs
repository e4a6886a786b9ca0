//! Annotated call tree, parsed from the indented textual dump the
//! introspection tooling writes next to the profile document. Shared callees
//! appear once per reaching path, so this is a genuine tree rather than the
//! call graph. Nodes live in an arena and link to each other by index; the
//! whole structure is immutable once parsed and is shared freely between
//! request handlers and analysis workers.

use std::path::Path;
use std::sync::Arc;

use crate::coverage::ProgramCoverageData;
use crate::error::AdvisorError;
use crate::profile::{FunctionProfile, ProfileIndex};

/// Conventional entry point of a libFuzzer target; the dump's root line must
/// name it.
pub const ROOT_FUNCTION: &str = "LLVMFuzzerTestOneInput";

const HEADER: &str = "Call tree";

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct CallTreeNode {
    pub profile: Arc<FunctionProfile>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    /// Number of levels in the tree; a lone root counts as 1.
    pub max_depth: usize,
    pub max_cyclomatic_complexity: u32,
}

impl CallTree {
    pub const ROOT: NodeId = 0;

    pub fn parse(path: &Path, index: &ProfileIndex) -> Result<Self, AdvisorError> {
        let data = std::fs::read_to_string(path)?;
        Self::parse_str(&data, index)
    }

    pub fn parse_str(data: &str, index: &ProfileIndex) -> Result<Self, AdvisorError> {
        let mut lines = data.lines();

        if lines.next() != Some(HEADER) {
            return Err(AdvisorError::parse(format!(
                "call tree dump does not start with \"{HEADER}\""
            )));
        }

        let root_line = lines
            .next()
            .ok_or_else(|| AdvisorError::parse("call tree dump has no root line"))?;
        let root_name = root_line.split_whitespace().next().unwrap_or_default();
        if root_name != ROOT_FUNCTION {
            return Err(AdvisorError::parse(format!(
                "call tree root is {root_name:?}, expected \"{ROOT_FUNCTION}\""
            )));
        }
        let root_profile = index
            .get(ROOT_FUNCTION)
            .ok_or_else(|| AdvisorError::parse("root function missing from profile"))?
            .clone();

        let mut nodes = vec![CallTreeNode {
            profile: root_profile,
            parent: None,
            children: Vec::new(),
        }];
        // Stack of "current node at each depth". It only ever grows; entries
        // above the current depth go stale and are overwritten on reuse.
        let mut stack: Vec<NodeId> = vec![Self::ROOT];
        let mut max_depth = stack.len();
        let mut max_cc = 0;

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with("==") {
                break;
            }

            let leading = line.len() - line.trim_start_matches(' ').len();
            let depth = leading / 2;
            let name = match line[leading..].split_whitespace().next() {
                Some(name) => name,
                None => continue,
            };

            if depth == 0 || depth > stack.len() {
                return Err(AdvisorError::parse(format!(
                    "call tree node {name:?} at depth {depth} has no parent"
                )));
            }
            let profile = index
                .get(name)
                .ok_or_else(|| {
                    AdvisorError::parse(format!("call tree names unknown function {name:?}"))
                })?
                .clone();

            let id = nodes.len();
            let parent = stack[depth - 1];
            nodes.push(CallTreeNode {
                profile,
                parent: Some(parent),
                children: Vec::new(),
            });
            nodes[parent].children.push(id);

            if depth >= stack.len() {
                stack.push(id);
            } else {
                stack[depth] = id;
            }
            max_depth = max_depth.max(depth + 1);
            max_cc = max_cc.max(nodes[id].profile.cyclomatic_complexity);
        }

        Ok(CallTree {
            nodes,
            max_depth,
            max_cyclomatic_complexity: max_cc,
        })
    }

    /// Serializes back into the dump format `parse_str` accepts. Parsing the
    /// result reproduces the identical tree.
    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        out.push('\n');
        for id in self.preorder() {
            for _ in 0..self.depth(id) {
                out.push_str("  ");
            }
            out.push_str(&self.nodes[id].profile.name);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id]
    }

    /// Distance to the root; 0 for the root itself.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = self.nodes[id].parent;
        while let Some(parent) = cur {
            depth += 1;
            cur = self.nodes[parent].parent;
        }
        depth
    }

    /// Edges on the longest downward path from `id`; 0 for a leaf.
    pub fn max_lower_depth(&self, id: NodeId) -> usize {
        self.nodes[id]
            .children
            .iter()
            .map(|&child| self.max_lower_depth(child) + 1)
            .max()
            .unwrap_or(0)
    }

    /// Node count of the longest root-to-leaf path running through `id`.
    pub fn reachable_depth(&self, id: NodeId) -> usize {
        self.depth(id) + self.max_lower_depth(id) + 1
    }

    /// Descendant measure used by the scorer: every subtree contributes its
    /// node count plus one per edge, so the result is larger than the plain
    /// subtree size. The normalization downstream depends on exactly this
    /// definition.
    pub fn count_descendants(&self, id: NodeId) -> usize {
        let node = &self.nodes[id];
        let mut count = 1;
        for &child in &node.children {
            count += self.count_descendants(child) + 1;
        }
        count
    }

    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            tree: self,
            stack: if self.nodes.is_empty() {
                Vec::new()
            } else {
                vec![Self::ROOT]
            },
        }
    }

    /// Per-node hit counts in node-id order, zero where the coverage report
    /// has no matching function. The tree itself stays untouched so it can
    /// keep being shared without locks.
    pub fn apply_counts(&self, coverage: &ProgramCoverageData) -> Vec<u64> {
        let by_name: std::collections::HashMap<&str, u64> = coverage
            .functions
            .iter()
            .map(|f| (f.name.as_str(), f.count))
            .collect();
        self.nodes
            .iter()
            .map(|n| by_name.get(n.profile.name.as_str()).copied().unwrap_or(0))
            .collect()
    }
}

/// Lazy root-first traversal, children in declared order.
pub struct Preorder<'a> {
    tree: &'a CallTree,
    stack: Vec<NodeId>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.nodes[id].children.iter().rev());
        Some(id)
    }
}
