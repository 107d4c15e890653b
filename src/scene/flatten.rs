//! Depth-first flattening of the scene graph
//!
//! The flattened list stores no child counts. A subtree is the contiguous run
//! of entries following its root whose depth is greater than the root's, so
//! consumers skip or group subtrees by scanning depths forward.

use crate::scene::node::SceneNode;

/// One node of a flattened scene with its distance from the synthetic root
#[derive(Debug, Clone, Copy)]
pub struct FlatEntry<'a> {
    /// Top-level nodes have depth 1
    pub depth: usize,
    pub node: &'a SceneNode,
}

/// Pre-order traversal of `roots` into `out`
///
/// A node rejected by `visit` is left out together with its subtree. `out`
/// is cleared first so callers can reuse the allocation across frames.
pub fn flatten<'a, F>(roots: &'a [SceneNode], visit: F, out: &mut Vec<FlatEntry<'a>>)
where
    F: Fn(&SceneNode) -> bool,
{
    out.clear();
    let mut stack: Vec<(usize, &'a SceneNode)> = roots.iter().rev().map(|node| (1, node)).collect();
    while let Some((depth, node)) = stack.pop() {
        if !visit(node) {
            continue;
        }
        out.push(FlatEntry { depth, node });
        stack.extend(node.children().iter().rev().map(|child| (depth + 1, child)));
    }
}

/// Flatten every node
pub fn flatten_all<'a>(roots: &'a [SceneNode]) -> Vec<FlatEntry<'a>> {
    let mut out = Vec::new();
    flatten(roots, |_| true, &mut out);
    out
}

/// Index of the first entry after the subtree rooted at `index`
pub fn skip_subtree(entries: &[FlatEntry<'_>], index: usize) -> usize {
    let Some(root) = entries.get(index) else {
        return entries.len();
    };
    let mut next = index + 1;
    while next < entries.len() && entries[next].depth > root.depth {
        next += 1;
    }
    next
}

/// Number of descendants of the entry at `index`
pub fn descendant_count(entries: &[FlatEntry<'_>], index: usize) -> usize {
    skip_subtree(entries, index).saturating_sub(index + 1)
}
