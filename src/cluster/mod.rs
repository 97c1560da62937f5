pub use crate::*;

pub mod indexed;
pub mod linear;

pub use indexed::IndexedClusterer;
pub use linear::LinearClusterer;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// The cost gained by covering both labels with their join. Never negative
/// for disjoint labels; overlapping labels can make it negative.
pub fn cost_gain_distance<L>(a: &CostLabel<L>, b: &CostLabel<L>, joined: &CostLabel<L>) -> Cost {
    joined.cost - a.cost - b.cost
}

pub trait Clusterer<F: Feature>: Sync {
    /// Agglomerates the flows until at most `k` clusters remain. `k == 0`
    /// leaves every flow as its own cluster.
    fn cluster(&self, feature: &F, flows: &[F::Label], k: usize) -> Dendrogram<F::Label>;
}

/// A candidate merge between clusters `i` and `j`. Multiple entries for the
/// same cluster may coexist in the queue; stale ones are dropped lazily at
/// the top.
#[derive(Debug, Clone)]
pub(crate) struct MergeEntry<L> {
    pub dist: Cost,
    pub joined: CostLabel<L>,
    pub i: usize,
    pub j: usize,
}

impl<L> PartialEq for MergeEntry<L> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<L> Eq for MergeEntry<L> {}

impl<L> PartialOrd for MergeEntry<L> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<L> Ord for MergeEntry<L> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the closest pair; exact ties fall
        // back to the id pair to keep the pop order deterministic.
        cmp_by_distance(other.dist, other.joined.cost, self.dist, self.joined.cost)
            .then_with(|| (other.i, other.j).cmp(&(self.i, self.j)))
    }
}

/// The result of a clustering run: one cost-label per cluster and a parent
/// link per cluster. The first `N` ids are the input flows; later ids are
/// merges, in creation order. A cluster that was never merged away is its
/// own parent.
pub struct Dendrogram<L> {
    pub clusters: Vec<CostLabel<L>>,
    pub parents: Vec<usize>,
    children: OnceLock<Vec<Vec<usize>>>,
}

/// One step of the agglomeration replayed coarsest-grained first: at level
/// `k`, the clusters in `add` appeared and those in `del` were merged away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncClusterInfo {
    pub k: usize,
    pub add: Vec<usize>,
    pub del: Vec<usize>,
}

impl<L> Dendrogram<L> {
    pub fn from_parts(clusters: Vec<CostLabel<L>>, parents: Vec<usize>) -> Self {
        assert_eq!(clusters.len(), parents.len());
        Dendrogram {
            clusters,
            parents,
            children: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Direct children of each cluster, derived from the parent links.
    /// Self-parented clusters are roots and appear in nobody's child list.
    pub fn children(&self) -> &[Vec<usize>] {
        self.children.get_or_init(|| {
            let mut children = vec![Vec::new(); self.parents.len()];
            for (c, &p) in self.parents.iter().enumerate() {
                if p != c {
                    children[p].push(c);
                }
            }
            children
        })
    }

    /// The number of input flows, recognizable as the leading run of
    /// childless clusters.
    fn num_flows(&self) -> usize {
        let children = self.children();
        let mut n = 0;
        while n < children.len() && children[n].is_empty() {
            n += 1;
        }
        n
    }

    /// For each cluster in creation order, the number of active clusters
    /// right after it appeared: leaves count up to `N`, and each merge
    /// shrinks the count by one less than the number of clusters it
    /// absorbed.
    pub fn ks(&self) -> Vec<usize> {
        let children = self.children();
        let num_flows = self.num_flows();
        let mut ks = Vec::with_capacity(self.len());
        let mut k = 0usize;
        for (i, childs) in children.iter().enumerate() {
            if i < num_flows {
                debug_assert!(childs.is_empty());
                k += 1;
            } else {
                debug_assert!(!childs.is_empty());
                k = k + 1 - childs.len();
            }
            ks.push(k);
        }
        ks
    }

    /// Incremental trace of the active cluster set: the first entry brings
    /// in all the leaves, and each later entry swaps one merge in for its
    /// children.
    pub fn inc_cluster_info(&self) -> Vec<IncClusterInfo> {
        let children = self.children();
        let num_flows = self.num_flows();

        let mut infos = Vec::with_capacity(self.len() - num_flows + 1);
        infos.push(IncClusterInfo {
            k: num_flows,
            add: (0..num_flows).collect(),
            del: Vec::new(),
        });

        let mut k = num_flows;
        for i in num_flows..self.len() {
            k = k + 1 - children[i].len();
            infos.push(IncClusterInfo {
                k,
                add: vec![i],
                del: children[i].clone(),
            });
        }
        infos
    }

    /// The exact set of clusters active when `k` clusters remained, replayed
    /// from the incremental trace.
    pub fn clusters_at(&self, k: usize) -> Vec<usize> {
        let mut active = BTreeSet::new();
        for info in self.inc_cluster_info() {
            if k <= info.k {
                for c in &info.del {
                    active.remove(c);
                }
                for &c in &info.add {
                    active.insert(c);
                }
            } else {
                break;
            }
        }
        active.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ordered_float::NotNan;

    // Five flows clustered down to a single root:
    //   5 <- 0, 1      (k: 5 -> 4)
    //   6 <- 2, 3, 4   (k: 4 -> 2, one extra cluster subsumed)
    //   7 <- 5, 6      (k: 2 -> 1)
    fn sample() -> Dendrogram<IpRange> {
        let feature = IpRangeFeature;
        let label = |b, e| {
            let label = IpRange::new(b, e);
            CostLabel {
                cost: feature.cost(&label),
                label,
            }
        };
        let clusters = vec![
            label(0, 1),
            label(2, 3),
            label(10, 11),
            label(14, 15),
            label(12, 13),
            label(0, 3),
            label(10, 15),
            label(0, 15),
        ];
        let parents = vec![5, 5, 6, 6, 6, 7, 7, 7];
        Dendrogram::from_parts(clusters, parents)
    }

    #[test]
    fn children_form_a_forest() {
        let d = sample();
        let children = d.children();
        assert_eq!(children[5], vec![0, 1]);
        assert_eq!(children[6], vec![2, 3, 4]);
        assert_eq!(children[7], vec![5, 6]);
        for leaf in 0..5 {
            assert!(children[leaf].is_empty());
        }
    }

    #[test]
    fn ks_track_the_active_count() {
        let d = sample();
        assert_eq!(d.ks(), vec![1, 2, 3, 4, 5, 4, 2, 1]);
    }

    #[test]
    fn inc_info_replays_the_merges() {
        let d = sample();
        let infos = d.inc_cluster_info();
        assert_eq!(
            infos[0],
            IncClusterInfo {
                k: 5,
                add: vec![0, 1, 2, 3, 4],
                del: vec![]
            }
        );
        assert_eq!(
            infos[1],
            IncClusterInfo {
                k: 4,
                add: vec![5],
                del: vec![0, 1]
            }
        );
        assert_eq!(
            infos[2],
            IncClusterInfo {
                k: 2,
                add: vec![6],
                del: vec![2, 3, 4]
            }
        );
        assert_eq!(
            infos[3],
            IncClusterInfo {
                k: 1,
                add: vec![7],
                del: vec![5, 6]
            }
        );
    }

    #[test]
    fn clusters_at_yields_each_level() {
        let d = sample();
        assert_eq!(d.clusters_at(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(d.clusters_at(4), vec![2, 3, 4, 5]);
        // k = 3 was skipped by the subsuming merge; the trace stops at the
        // last level with at least that many clusters.
        assert_eq!(d.clusters_at(3), vec![2, 3, 4, 5]);
        assert_eq!(d.clusters_at(2), vec![5, 6]);
        assert_eq!(d.clusters_at(1), vec![7]);
    }

    #[test]
    fn merge_entries_pop_closest_first() {
        use std::collections::BinaryHeap;
        let feature = IpRangeFeature;
        let entry = |dist: f64, cost: f64, i, j| MergeEntry {
            dist: NotNan::new(dist).unwrap(),
            joined: CostLabel {
                cost: NotNan::new(cost).unwrap(),
                label: feature.top(),
            },
            i,
            j,
        };
        let mut heap = BinaryHeap::new();
        heap.push(entry(5.0, 10.0, 0, 1));
        heap.push(entry(1.0, 50.0, 2, 3));
        heap.push(entry(1.0 + 1e-12, 20.0, 4, 5));
        let first = heap.pop().unwrap();
        // Tied distances resolve toward the cheaper join.
        assert_eq!((first.i, first.j), (4, 5));
        assert_eq!(heap.pop().map(|e| (e.i, e.j)), Some((2, 3)));
        assert_eq!(heap.pop().map(|e| (e.i, e.j)), Some((0, 1)));
    }
}
