//! Parallel leaves-to-root traversal.
//!
//! Every leaf starts a climb towards the root. Each inner node keeps an atomic arrival counter: the first child
//! to arrive stops there, the second one processes the node and keeps climbing. So an inner node is processed
//! exactly once, after both of its children, without any locking.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{parallel::par_for_each, INVALID};

/// Calls `process_leaf` for every index in `leaves`, then `process_inner` for every inner node once both of its
/// children are done. `parents` is the output of [`super::Bvh2::compute_parents`].
///
/// The callbacks run concurrently for distinct nodes. They usually write through a
/// [`crate::parallel::UnsafeSlice`] or atomics. Writes made for a child are visible when its parent is processed.
///
/// A tree that is a lone root leaf only gets `process_leaf(0)`.
pub fn traverse_bottom_up<L, I>(parents: &[u32], leaves: &[u32], process_leaf: L, process_inner: I)
where
    L: Fn(usize) + Send + Sync,
    I: Fn(usize) + Send + Sync,
{
    crate::scope!("traverse_bottom_up");
    if parents.is_empty() {
        return;
    }
    if parents.len() == 1 {
        process_leaf(0);
        return;
    }

    let flags: Vec<AtomicU32> = (0..parents.len()).map(|_| AtomicU32::new(0)).collect();

    par_for_each(leaves.len(), |i| {
        let leaf = leaves[i] as usize;
        process_leaf(leaf);
        let mut node = leaf;
        loop {
            let parent = parents[node];
            if parent == INVALID {
                break;
            }
            // The first child to arrive leaves the parent to its sibling.
            if flags[parent as usize].fetch_add(1, Ordering::AcqRel) == 0 {
                break;
            }
            process_inner(parent as usize);
            node = parent as usize;
        }
    });
}
