use fixedbitset::FixedBitSet;

use api_types::usage::StageMask;

use crate::dependency::DependencyTable;
use profiling::enter_span;

/// Transitive reduction of the encoder dependency matrix.
///
/// Encoder indices are already topologically ordered (registration order),
/// so one forward sweep with per-encoder ancestor bitsets suffices. An
/// incoming edge `src -> dst` is redundant when some other retained
/// predecessor of `dst` already reaches `src` AND the stages signalled at
/// `src` along that indirect path cover the edge's own signal stages; an
/// indirect path that loses stage coverage cannot replace the edge, so the
/// edge is retained.
///
/// Returns the number of edges removed.
#[tracing::instrument(skip(table))]
pub fn reduce(table: &mut DependencyTable) -> usize {
    enter_span!(tracing::Level::TRACE, "Transitive reduction");

    let count = table.count();
    // ancestors[e]: every encoder reachable backwards from e
    let mut ancestors: Vec<FixedBitSet> = vec![FixedBitSet::with_capacity(count); count];
    // covered[dst * count + src]: union of signal stages of src known to
    // complete before dst through retained edges
    let mut covered: Vec<StageMask> = vec![StageMask::empty(); count * count];
    let mut removed = 0;

    for dst in 0..count as u32 {
        let incoming: Vec<u32> = table.incoming(dst).map(|(src, _)| src).collect();

        // nearest sources first: a chain through a later encoder is the
        // one that can subsume an edge from an earlier one
        let mut kept: Vec<u32> = Vec::new();
        for &src in incoming.iter().rev() {
            let dep = table.get(dst, src).unwrap();
            let mut reaches = false;
            let mut reachable_stages = StageMask::empty();
            for &via in &kept {
                if ancestors[via as usize].contains(src as usize) {
                    reaches = true;
                    reachable_stages |= covered[via as usize * count + src as usize];
                }
            }
            if reaches && reachable_stages.contains(dep.signal.stages) {
                table.clear(dst, src);
                removed += 1;
            } else {
                kept.push(src);
            }
        }

        // fold the retained edges into dst's reachability and coverage
        for &src in &kept {
            let dep = table.get(dst, src).unwrap();
            ancestors[dst as usize].insert(src as usize);
            let src_ancestors = ancestors[src as usize].clone();
            ancestors[dst as usize].union_with(&src_ancestors);

            covered[dst as usize * count + src as usize] |= dep.signal.stages;
            for ancestor in src_ancestors.ones() {
                let through = covered[src as usize * count + ancestor];
                covered[dst as usize * count + ancestor] |= through;
            }
        }
    }

    log::trace!(target: "framegraph", "Transitive reduction removed {} edges", removed);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{Dep, SyncPoint};

    fn dep(signal_index: u32, signal: StageMask, wait_index: u32, wait: StageMask) -> Dep {
        Dep {
            signal: SyncPoint { index: signal_index, stages: signal },
            wait: SyncPoint { index: wait_index, stages: wait },
        }
    }

    fn chain_table() -> DependencyTable {
        // A(0) -> B(1) -> C(2) plus direct A -> C
        let mut table = DependencyTable::new(3);
        table.merge(1, 0, dep(0, StageMask::COMPUTE, 1, StageMask::COMPUTE));
        table.merge(2, 1, dep(1, StageMask::COMPUTE, 2, StageMask::FRAGMENT));
        table
    }

    #[test]
    fn covered_triangle_edge_is_removed() {
        let mut table = chain_table();
        // direct edge's signal stages are covered by the A->B edge
        table.merge(2, 0, dep(0, StageMask::COMPUTE, 2, StageMask::FRAGMENT));
        let removed = reduce(&mut table);
        assert_eq!(removed, 1);
        assert!(table.get(2, 0).is_none());
        assert!(table.get(1, 0).is_some());
        assert!(table.get(2, 1).is_some());
    }

    #[test]
    fn uncovered_triangle_edge_is_retained() {
        let mut table = chain_table();
        // the direct edge signals FRAGMENT work at A, which the COMPUTE-only
        // A->B edge does not cover
        table.merge(2, 0, dep(0, StageMask::FRAGMENT, 2, StageMask::FRAGMENT));
        let removed = reduce(&mut table);
        assert_eq!(removed, 0);
        assert!(table.get(2, 0).is_some());
    }

    #[test]
    fn reduction_preserves_reachability() {
        // dense chain 0 -> 1 -> 2 -> 3 with every forward edge present
        let mut table = DependencyTable::new(4);
        for dst in 1..4u32 {
            for src in 0..dst {
                table.merge(dst, src, dep(src, StageMask::COMPUTE, dst, StageMask::COMPUTE));
            }
        }
        let before = table.ancestors();
        let removed = reduce(&mut table);
        assert_eq!(removed, 3);
        let after = table.ancestors();
        assert_eq!(before, after);
        // the surviving graph is exactly the chain
        assert_eq!(table.edge_count(), 3);
        for dst in 1..4u32 {
            assert!(table.get(dst, dst - 1).is_some());
        }
    }

    #[test]
    fn coverage_flows_through_long_chains() {
        // 0 -> 1 -> 2 -> 3 plus direct 0 -> 3; coverage of 0's stages must
        // propagate through two hops
        let mut table = DependencyTable::new(4);
        table.merge(1, 0, dep(0, StageMask::COMPUTE, 1, StageMask::COMPUTE));
        table.merge(2, 1, dep(1, StageMask::BLIT, 2, StageMask::BLIT));
        table.merge(3, 2, dep(2, StageMask::BLIT, 3, StageMask::FRAGMENT));
        table.merge(3, 0, dep(0, StageMask::COMPUTE, 3, StageMask::FRAGMENT));
        let removed = reduce(&mut table);
        assert_eq!(removed, 1);
        assert!(table.get(3, 0).is_none());
    }
}
