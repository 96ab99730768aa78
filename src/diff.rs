//! Tree diffing bounded to changed regions
//!
//! After an incremental reparse we need the byte ranges whose tokens may
//! have changed. Walking every node would make diff cost proportional to
//! tree size; instead the old tree (with pending edits applied, so its
//! nodes carry change flags) and the new tree are walked with paired
//! cursors, descending only into changed subtrees. Cost is bounded by
//! tree-depth × changed-node count.

use std::ops::Range;

use tree_sitter::{Node, Tree};

/// A byte range whose tokens must be recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedRegion {
    pub start: usize,
    pub end: usize,
}

impl ChangedRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Walk both trees in lockstep and report minimal changed regions.
///
/// At a node flagged has-changes: when exactly one child changed and the
/// node's shape is otherwise stable, descend into just that child (the
/// cheap path for a local edit). With zero or multiple changed children, a
/// differing child count, or a flipped error state, the whole node is
/// reported as one region.
pub fn find_changed_nodes(old_with_edits: &Tree, new: &Tree) -> Vec<ChangedRegion> {
    let mut regions = Vec::new();
    descend(old_with_edits.root_node(), new.root_node(), &mut regions);
    regions
}

fn descend(old: Node, new: Node, regions: &mut Vec<ChangedRegion>) {
    if !old.has_changes() {
        return;
    }

    let error_flipped = old.has_error() != new.has_error();
    if error_flipped || old.child_count() != new.child_count() {
        report(new, regions);
        return;
    }

    let mut changed_child = None;
    let mut changed_count = 0;
    for i in 0..old.child_count() {
        // Child lists have equal length here; both lookups succeed
        let Some(old_child) = old.child(i) else { break };
        if old_child.has_changes() {
            changed_count += 1;
            changed_child = Some(i);
            if changed_count > 1 {
                break;
            }
        }
    }

    match (changed_count, changed_child) {
        (1, Some(i)) => {
            if let (Some(old_child), Some(new_child)) = (old.child(i), new.child(i)) {
                descend(old_child, new_child, regions);
            } else {
                report(new, regions);
            }
        }
        // Zero changed children (the change lives in this node's own
        // extent) or several of them: re-tokenize the whole node.
        _ => report(new, regions),
    }
}

/// Report a node as changed, widened to the nearest named ancestor and
/// back to the end of the previous sibling so boundary tokens (which may
/// have merged with the edit) are re-resolved too.
fn report(node: Node, regions: &mut Vec<ChangedRegion>) {
    let mut named = node;
    while !named.is_named() {
        match named.parent() {
            Some(parent) => named = parent,
            None => break,
        }
    }

    let start = named
        .prev_sibling()
        .map(|sib| sib.end_byte())
        .unwrap_or_else(|| named.start_byte());

    regions.push(ChangedRegion {
        start: start.min(named.start_byte()),
        end: named.end_byte(),
    });
}

/// Expand each changed region outward until it aligns with a real
/// tree-node boundary, merge adjacent/overlapping regions, and intersect
/// with an optional externally imposed parse-range restriction.
///
/// The result is never smaller than the reported changes (except where the
/// restriction clips it).
pub fn find_tree_changes(
    new_tree: &Tree,
    changed_nodes: Vec<ChangedRegion>,
    restriction: Option<Range<usize>>,
) -> Vec<ChangedRegion> {
    let root = new_tree.root_node();
    let mut expanded: Vec<ChangedRegion> = changed_nodes
        .into_iter()
        .filter(|r| !r.is_empty())
        .map(|r| {
            match root.descendant_for_byte_range(r.start, r.end) {
                Some(node) => ChangedRegion {
                    start: node.start_byte().min(r.start),
                    end: node.end_byte().max(r.end),
                },
                None => r,
            }
        })
        .collect();

    expanded.sort_by_key(|r| r.start);

    let mut merged: Vec<ChangedRegion> = Vec::with_capacity(expanded.len());
    for region in expanded {
        match merged.last_mut() {
            Some(last) if region.start <= last.end => last.end = last.end.max(region.end),
            _ => merged.push(region),
        }
    }

    if let Some(restrict) = restriction {
        merged.retain_mut(|r| {
            r.start = r.start.max(restrict.start);
            r.end = r.end.min(restrict.end);
            !r.is_empty()
        });
    }

    merged
}
